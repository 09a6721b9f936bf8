// Media store - downloads remote media into the local media directory
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    pub fn subdir(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
        }
    }

    pub fn default_ext(&self) -> &'static str {
        match self {
            MediaKind::Image => "jpg",
            MediaKind::Audio => "silk",
        }
    }

    /// Top-level MIME type a response must carry for its extension to be trusted.
    pub fn mime_top_level(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a valid local path: {0}")]
    InvalidPath(PathBuf),
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Persist `remote_url` locally and return a `file://` reference to it.
    async fn store(
        &self,
        remote_url: &str,
        kind: MediaKind,
        ext_hint: Option<&str>,
    ) -> Result<String, MediaError>;
}

pub struct LocalMediaStore {
    client: Client,
    base: PathBuf,
}

impl LocalMediaStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base: base.into(),
        })
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn store(
        &self,
        remote_url: &str,
        kind: MediaKind,
        ext_hint: Option<&str>,
    ) -> Result<String, MediaError> {
        if remote_url.starts_with("file://") {
            return Ok(remote_url.to_string());
        }

        let response = self.client.get(remote_url).send().await?.error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let ext = match ext_hint {
            Some(hint) => hint.trim_start_matches('.').to_string(),
            None => extension_for(content_type.as_deref(), kind),
        };

        let dir = self.base.join(kind.subdir());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.{}", Uuid::now_v7(), ext));

        if let Err(e) = write_stream(&path, response).await {
            // Never leave a truncated file behind
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        let reference = Url::from_file_path(&path).map_err(|_| MediaError::InvalidPath(path.clone()))?;
        tracing::debug!("Stored {} as {}", remote_url, path.display());
        Ok(reference.to_string())
    }
}

async fn write_stream(path: &Path, response: reqwest::Response) -> Result<(), MediaError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// File extension for a response content type, falling back to the kind's default.
///
/// Only a content type of the kind's own top-level type (`image/*` or
/// `audio/*`) is trusted; generic types such as `application/octet-stream`
/// keep the default so the file stays recognisable by its extension.
pub fn extension_for(content_type: Option<&str>, kind: MediaKind) -> String {
    let parsed = content_type.and_then(|ct| ct.parse::<mime_guess::Mime>().ok());
    let Some(mime) = parsed.filter(|mime| mime.type_() == kind.mime_top_level()) else {
        return kind.default_ext().to_string();
    };

    match mime_guess::get_mime_extensions(&mime) {
        Some(exts) if exts.contains(&kind.default_ext()) => kind.default_ext().to_string(),
        Some(exts) if !exts.is_empty() => exts[0].to_string(),
        _ => kind.default_ext().to_string(),
    }
}

/// References that were stored, in input order, plus how many downloads failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredMedia {
    pub references: Vec<String>,
    pub failed: usize,
}

/// Download every url concurrently. Failures are logged and dropped.
pub async fn store_all(store: &dyn MediaStore, urls: &[String], kind: MediaKind) -> StoredMedia {
    let results = futures::future::join_all(urls.iter().map(|url| store.store(url, kind, None))).await;

    let mut stored = StoredMedia::default();
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(reference) => stored.references.push(reference),
            Err(e) => {
                tracing::warn!("Dropping {} {}: {}", kind.subdir(), url, e);
                stored.failed += 1;
            }
        }
    }

    if !urls.is_empty() {
        tracing::info!(
            "Stored {} {} file(s), {} failed",
            stored.references.len(),
            kind.subdir(),
            stored.failed
        );
    }
    stored
}

/// Filesystem path behind a `file://` reference.
pub fn local_path(reference: &str) -> Option<PathBuf> {
    let url = Url::parse(reference).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Point a dangling local reference at the same file name under `media_root`.
///
/// Returns the new reference only when the old file is gone and the new one
/// exists.
pub fn relocate(media_root: &Path, reference: &str, kind: MediaKind) -> Option<String> {
    let path = local_path(reference)?;
    if path.exists() {
        return None;
    }
    let candidate = media_root.join(kind.subdir()).join(path.file_name()?);
    if !candidate.is_file() {
        return None;
    }
    Url::from_file_path(&candidate).ok().map(|url| url.to_string())
}
