// Conversation port - how commands talk back to the chat user
use std::time::Duration;

use async_trait::async_trait;

/// One message from the user. Media is carried as remote URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingContent {
    pub text: String,
    pub images: Vec<String>,
    pub audio: Vec<String>,
}

impl IncomingContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Parse a plain-text message where `[img:<url>]` and `[audio:<url>]`
    /// markers stand for attached media.
    ///
    /// Line breaks and inner spacing of the text are kept; only the gap a
    /// removed marker leaves behind is folded into a single space.
    pub fn parse(raw: &str) -> Self {
        let mut content = Self::default();
        let mut text = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(open) = rest.find('[') {
            text.push_str(&rest[..open]);
            let candidate = &rest[open..];
            let Some(close) = candidate.find(']') else {
                text.push_str(candidate);
                rest = "";
                break;
            };
            let inner = &candidate[1..close];
            let after = &candidate[close + 1..];
            rest = if let Some(url) = inner.strip_prefix("img:") {
                content.images.push(url.trim().to_string());
                close_marker_gap(&mut text, after)
            } else if let Some(url) = inner.strip_prefix("audio:") {
                content.audio.push(url.trim().to_string());
                close_marker_gap(&mut text, after)
            } else {
                text.push_str(&candidate[..=close]);
                after
            };
        }
        text.push_str(rest);

        content.text = text.trim().to_string();
        content
    }

    pub fn has_media(&self) -> bool {
        !self.images.is_empty() || !self.audio.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && !self.has_media()
    }

    /// A bare "no" declines an optional prompt
    pub fn is_decline(&self) -> bool {
        !self.has_media() && self.text.trim().eq_ignore_ascii_case("no")
    }
}

/// Join the text on both sides of a removed marker with at most one space.
fn close_marker_gap<'a>(text: &mut String, after: &'a str) -> &'a str {
    const GAP: [char; 2] = [' ', '\t'];
    let kept = text.trim_end_matches(GAP).len();
    text.truncate(kept);
    let after = after.trim_start_matches(GAP);

    let at_line_edge = text.is_empty() || text.ends_with('\n') || after.is_empty() || after.starts_with(['\r', '\n']);
    if !at_line_edge {
        text.push(' ');
    }
    after
}

/// Something sent back to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Image(String),
    Audio(String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

#[async_trait]
pub trait Conversation: Send {
    /// Wait up to `timeout` for the user's next message. `None` on timeout.
    async fn prompt(&mut self, timeout: Duration) -> Option<IncomingContent>;

    async fn send(&mut self, reply: Reply) -> anyhow::Result<()>;
}
