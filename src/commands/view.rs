//! Display payloads handed to the renderer.

use async_trait::async_trait;
use serde::Serialize;

use super::conversation::Reply;
use crate::bottles::Bottle;
use crate::cloud::client::{CloudBottle, CreateTime};

/// Shown instead of a removed comment's content.
pub const REMOVED_PLACEHOLDER: &str = "[this comment was removed]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BottleView {
    pub id: String,
    pub kind_label: String,
    pub style: u8,
    pub title: Option<String>,
    pub text: Option<String>,
    pub images: Vec<String>,
    pub author_id: String,
    pub author_name: Option<String>,
    pub avatar: Option<String>,
    pub created_at: String,
    pub retrieval_count: u64,
    pub comments: Vec<CommentView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentView {
    /// 1-based, as used by the delete-comments command
    pub position: usize,
    pub author_id: String,
    pub author_name: Option<String>,
    pub avatar: Option<String>,
    pub text: Option<String>,
    pub images: Vec<String>,
    pub created_at: String,
    pub removed: bool,
}

impl BottleView {
    pub fn from_bottle(bottle: &Bottle, avatar_for: impl Fn(&str) -> String) -> Self {
        let comments = bottle
            .comments
            .iter()
            .enumerate()
            .map(|(i, comment)| {
                let (text, images) = if comment.deleted {
                    (Some(REMOVED_PLACEHOLDER.to_string()), Vec::new())
                } else {
                    (comment.text.clone(), comment.images.clone().unwrap_or_default())
                };
                CommentView {
                    position: i + 1,
                    author_id: comment.author_id.clone(),
                    author_name: comment.author_name.clone(),
                    avatar: Some(avatar_for(&comment.author_id)),
                    text,
                    images,
                    created_at: comment.created_at.format("%Y-%m-%d %H:%M").to_string(),
                    removed: comment.deleted,
                }
            })
            .collect();

        Self {
            id: bottle.id.to_string(),
            kind_label: bottle.kind().label().to_string(),
            style: bottle.style,
            title: bottle.content.title.clone(),
            text: bottle.content.text.clone(),
            images: bottle.content.images.clone().unwrap_or_default(),
            author_id: bottle.author_id.clone(),
            author_name: bottle.content.author_name.clone(),
            avatar: Some(avatar_for(&bottle.author_id)),
            created_at: bottle.content.created_at.format("%Y-%m-%d %H:%M").to_string(),
            retrieval_count: bottle.retrieval_count,
            comments,
        }
    }

    pub fn from_cloud(bottle: &CloudBottle, style: u8) -> Self {
        let content = &bottle.content;
        let kind_label = match (content.image.is_empty(), content.text.is_empty()) {
            (false, false) => "image-and-text",
            (false, true) => "image-only",
            _ => "text-only",
        };

        Self {
            id: bottle.id.to_string(),
            kind_label: kind_label.to_string(),
            style,
            title: non_blank(&content.title),
            text: non_blank(&content.text),
            images: content.image.clone(),
            author_id: bottle.user_id.clone(),
            author_name: None,
            avatar: content.avatar.clone(),
            created_at: format_create_time(&content.create_time),
            retrieval_count: bottle.get_count,
            comments: bottle
                .review
                .iter()
                .enumerate()
                .map(|(i, review)| CommentView {
                    position: i + 1,
                    author_id: review.user_id.clone(),
                    author_name: None,
                    avatar: review.avatar.clone(),
                    text: non_blank(&review.text),
                    images: review.image.clone(),
                    created_at: format_create_time(&review.create_time),
                    removed: false,
                })
                .collect(),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn format_create_time(time: &CreateTime) -> String {
    match time {
        CreateTime::Millis(ms) => chrono::DateTime::<chrono::Utc>::from_timestamp_millis(*ms)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default(),
        CreateTime::Text(text) => text.clone(),
    }
}

/// Turns a bottle view into something the chat can display.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, view: &BottleView) -> anyhow::Result<Vec<Reply>>;
}

/// Renders a view as a text block followed by its images.
pub struct PlainRenderer;

#[async_trait]
impl Renderer for PlainRenderer {
    async fn render(&self, view: &BottleView) -> anyhow::Result<Vec<Reply>> {
        let mut lines = Vec::new();
        let author = view.author_name.as_deref().unwrap_or(&view.author_id);
        lines.push(format!("Bottle #{} ({}) from {}", view.id, view.kind_label, author));
        if let Some(title) = &view.title {
            lines.push(format!("Title: {}", title));
        }
        if let Some(text) = &view.text {
            lines.push(text.clone());
        }
        lines.push(format!("Thrown {}, retrieved {} time(s)", view.created_at, view.retrieval_count));

        if !view.comments.is_empty() {
            lines.push(String::from("Comments:"));
            for comment in &view.comments {
                let who = comment.author_name.as_deref().unwrap_or(&comment.author_id);
                let text = comment.text.as_deref().unwrap_or("[image]");
                lines.push(format!("  {}. {}: {}", comment.position, who, text));
            }
        }

        let mut replies = vec![Reply::Text(lines.join("\n"))];
        replies.extend(view.images.iter().cloned().map(Reply::Image));
        for comment in &view.comments {
            replies.extend(comment.images.iter().cloned().map(Reply::Image));
        }
        Ok(replies)
    }
}
