// Domain types - plain data, no I/O
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::media::MediaKind;

pub type BottleId = u64;

/// Who is issuing a store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
}

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(id)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Bottle payload. At least one of `text`, `images`, `audio` is present,
/// and present lists are never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BottleContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub audio: Option<Vec<String>>,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottle {
    pub id: BottleId,
    #[serde(default)]
    pub style: u8,
    pub content: BottleContent,
    #[serde(default)]
    pub retrieval_count: u64,
    pub visible: bool,
    pub author_id: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Bottle {
    pub fn kind(&self) -> BottleKind {
        classify(&self.content)
    }

    pub fn is_audio(&self) -> bool {
        has_items(&self.content.audio)
    }

    /// Every media reference carried by the bottle and its comments.
    pub fn media_refs_mut(&mut self) -> impl Iterator<Item = (&mut String, MediaKind)> {
        let content = &mut self.content;
        let images = content.images.iter_mut().flatten().map(|r| (r, MediaKind::Image));
        let audio = content.audio.iter_mut().flatten().map(|r| (r, MediaKind::Audio));
        let comment_images = self
            .comments
            .iter_mut()
            .flat_map(|c| c.images.iter_mut().flatten())
            .map(|r| (r, MediaKind::Image));
        images.chain(audio).chain(comment_images)
    }
}

/// Display classification of a bottle, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BottleKind {
    Audio,
    ImageText,
    ImageOnly,
    TextOnly,
}

impl BottleKind {
    pub fn label(&self) -> &'static str {
        match self {
            BottleKind::Audio => "audio",
            BottleKind::ImageText => "image-and-text",
            BottleKind::ImageOnly => "image-only",
            BottleKind::TextOnly => "text-only",
        }
    }
}

impl fmt::Display for BottleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// audio > image + text > image only > text only
pub fn classify(content: &BottleContent) -> BottleKind {
    let has_text = content.text.as_deref().is_some_and(|t| !t.is_empty());
    if has_items(&content.audio) {
        BottleKind::Audio
    } else if has_items(&content.images) && has_text {
        BottleKind::ImageText
    } else if has_items(&content.images) {
        BottleKind::ImageOnly
    } else {
        BottleKind::TextOnly
    }
}

fn has_items(list: &Option<Vec<String>>) -> bool {
    list.as_ref().is_some_and(|items| !items.is_empty())
}

/// Raw content submitted by a user, media still referencing remote URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: Option<String>,
    pub images: Vec<String>,
    pub audio: Vec<String>,
    pub title: Option<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_audio(mut self, audio: Vec<String>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_text() && self.images.is_empty() && self.audio.is_empty()
    }
}

/// Outcome of a successful throw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: BottleId,
    pub kind: BottleKind,
    /// Images dropped by moderation before the bottle was stored
    pub filtered_images: usize,
}

/// Per-index result of a comment deletion request. Indices are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentRemoval {
    Removed(usize),
    AlreadyRemoved(usize),
}

/// Strip `<script>` blocks and markup, then trim. Empty results become `None`.
pub fn sanitize_text(input: Option<&str>) -> Option<String> {
    let input = input?;
    let without_scripts = strip_script_blocks(input);
    let mut clean = String::with_capacity(without_scripts.len());
    let mut tag_start: Option<usize> = None;
    for (i, c) in without_scripts.char_indices() {
        match (c, tag_start) {
            ('<', None) => tag_start = Some(i),
            ('>', Some(_)) => tag_start = None,
            (_, None) => clean.push(c),
            _ => {}
        }
    }
    // An unterminated '<' is plain text, not a tag
    if let Some(start) = tag_start {
        clean.push_str(&without_scripts[start..]);
    }
    let trimmed = clean.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_script_blocks(input: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with the original
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    while let Some(rel_start) = lower[cursor..].find("<script") {
        let start = cursor + rel_start;
        let Some(rel_end) = lower[start..].find("</script>") else {
            break;
        };
        let end = start + rel_end;
        let Some(rel_close) = lower[end..].find('>') else {
            break;
        };
        out.push_str(&input[cursor..start]);
        cursor = end + rel_close + 1;
    }
    out.push_str(&input[cursor..]);
    out
}
