//! Content moderation: screens images and text through the external audit
//! service before anything is stored.
//!
//! Every failure of the audit service is fail-open: the content passes
//! through unchanged and the failure is logged.

pub mod backend;
pub mod cache;
pub mod signing;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::config::{ModerationConfig, ModerationPolicy};

pub use backend::{AuditBackend, AuditError, HttpAuditBackend, ImageAudit, TextAudit};
pub use cache::VerdictCache;

/// Replacement for every flagged keyword.
pub const TEXT_MASK: &str = "***";

/// Images that survived screening, in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageReport {
    pub images: Vec<String>,
    /// Images that were flagged (removed or blurred)
    pub flagged: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Screened {
    Keep(String),
    Replace(String),
    Remove,
}

pub struct ContentModerator {
    backend: Option<Arc<dyn AuditBackend>>,
    policy: ModerationPolicy,
    image_filter: HashSet<String>,
    text_filter: HashSet<String>,
    cache: Mutex<VerdictCache>,
}

impl ContentModerator {
    /// Build a moderator; it is a passthrough unless the config is active.
    pub fn new(config: &ModerationConfig, backend: Arc<dyn AuditBackend>) -> Self {
        Self {
            backend: config.is_active().then_some(backend),
            policy: config.policy,
            image_filter: config.image_filter.iter().cloned().collect(),
            text_filter: config.text_filter.iter().cloned().collect(),
            cache: Mutex::new(VerdictCache::default()),
        }
    }

    /// A moderator that lets everything through.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            policy: ModerationPolicy::Reject,
            image_filter: HashSet::new(),
            text_filter: HashSet::new(),
            cache: Mutex::new(VerdictCache::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_some()
    }

    pub fn cached_verdicts(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn audit_images(&self, urls: Vec<String>) -> ImageReport {
        let Some(backend) = self.backend.as_deref() else {
            return ImageReport {
                images: urls,
                flagged: 0,
            };
        };

        let mut report = ImageReport::default();
        // One at a time so duplicates within a message reuse the first verdict
        for url in urls {
            match self.screen_image(backend, url).await {
                Screened::Keep(url) => report.images.push(url),
                Screened::Replace(url) => {
                    report.flagged += 1;
                    report.images.push(url);
                }
                Screened::Remove => report.flagged += 1,
            }
        }

        if report.flagged > 0 {
            tracing::info!("Moderation flagged {} image(s)", report.flagged);
        }
        report
    }

    pub async fn audit_text(&self, text: &str) -> String {
        let Some(backend) = self.backend.as_deref() else {
            return text.to_string();
        };

        match backend.audit_text(text).await {
            Ok(audit) => redact(text, &audit, &self.text_filter),
            Err(e) => {
                tracing::warn!("Text audit failed, passing text through: {}", e);
                text.to_string()
            }
        }
    }

    /// A verdict flags an image when any filtered scene is not a "Pass".
    pub fn is_flagged(&self, audit: &ImageAudit) -> bool {
        audit
            .label_results
            .iter()
            .any(|label| self.image_filter.contains(&label.scene) && label.suggestion != "Pass")
    }

    async fn screen_image(&self, backend: &dyn AuditBackend, url: String) -> Screened {
        let verdict = match self.verdict_for(backend, &url).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!("Image audit failed for {}, passing through: {}", url, e);
                return Screened::Keep(url);
            }
        };

        if !self.is_flagged(&verdict) {
            return Screened::Keep(url);
        }

        match self.policy {
            ModerationPolicy::Reject => Screened::Remove,
            ModerationPolicy::Blur => match backend.blur_image(&url).await {
                Ok(blurred) => Screened::Replace(blurred),
                Err(e) => {
                    tracing::warn!("Blurring {} failed, removing it: {}", url, e);
                    Screened::Remove
                }
            },
        }
    }

    async fn verdict_for(&self, backend: &dyn AuditBackend, url: &str) -> Result<ImageAudit, AuditError> {
        let bytes = backend.fetch_image(url).await?;
        let hash = content_hash(&bytes);

        if let Some(cached) = self.lock_cache().get(&hash) {
            tracing::debug!("Reusing cached verdict for {}", hash);
            return Ok(cached.clone());
        }

        let verdict = backend.audit_image(url).await?;
        self.lock_cache().insert(hash, verdict.clone());
        Ok(verdict)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, VerdictCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hex SHA-256 of image bytes, used as the verdict cache key.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Mask every keyword of every filtered, non-passing label.
pub fn redact(text: &str, audit: &TextAudit, filter: &HashSet<String>) -> String {
    let mut out = text.to_string();
    for detail in &audit.detail_results {
        if !filter.contains(&detail.label) || detail.suggestion == "Pass" {
            continue;
        }
        for keyword in detail.keywords.iter().filter(|k| !k.is_empty()) {
            out = out.replace(keyword.as_str(), TEXT_MASK);
        }
    }
    out
}
