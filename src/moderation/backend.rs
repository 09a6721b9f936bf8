// Port to the external content audit service
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::signing::SignedHeaders;
use crate::config::ModerationConfig;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Audit service answered with code {code}")]
    Service { code: i64 },

    #[error("Audit response carried no data")]
    MissingData,

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("No blur endpoint configured")]
    BlurUnavailable,
}

/// Envelope shared by every audit response
#[derive(Debug, Deserialize)]
pub struct AuditEnvelope<T> {
    pub code: i64,
    pub data: Option<T>,
}

impl<T> AuditEnvelope<T> {
    pub fn into_data(self) -> Result<T, AuditError> {
        if self.code != 200 {
            return Err(AuditError::Service { code: self.code });
        }
        self.data.ok_or(AuditError::MissingData)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageAudit {
    #[serde(default)]
    pub label_results: Vec<LabelResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabelResult {
    pub scene: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextAudit {
    #[serde(default)]
    pub detail_results: Vec<DetailResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetailResult {
    pub label: String,
    pub suggestion: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BlurData {
    url: String,
}

#[derive(Debug, Serialize)]
struct AuditRequest<'a> {
    audit_type: &'a str,
    audit_content: &'a str,
}

#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Download image bytes so the moderator can hash them
    async fn fetch_image(&self, url: &str) -> Result<Bytes, AuditError>;

    async fn audit_image(&self, url: &str) -> Result<ImageAudit, AuditError>;

    async fn audit_text(&self, text: &str) -> Result<TextAudit, AuditError>;

    /// Ask for a blurred copy of an image; returns the new image URL
    async fn blur_image(&self, url: &str) -> Result<String, AuditError>;
}

/// HTTP implementation talking to the signed audit endpoint
pub struct HttpAuditBackend {
    client: Client,
    endpoint: String,
    blur_endpoint: String,
    app_id: String,
    secret: String,
}

impl HttpAuditBackend {
    pub fn new(config: &ModerationConfig) -> Result<Self, AuditError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            blur_endpoint: config.blur_endpoint.clone(),
            app_id: config.app_id.clone(),
            secret: config.secret.clone(),
        })
    }

    async fn post_signed<B, T>(&self, url: &str, body: &B) -> Result<T, AuditError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        let headers = SignedHeaders::new(&self.app_id, &self.secret, chrono::Utc::now().timestamp())?;

        let mut request = self.client.post(url).json(body);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let envelope: AuditEnvelope<T> = request.send().await?.json().await?;
        envelope.into_data()
    }
}

#[async_trait]
impl AuditBackend for HttpAuditBackend {
    async fn fetch_image(&self, url: &str) -> Result<Bytes, AuditError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }

    async fn audit_image(&self, url: &str) -> Result<ImageAudit, AuditError> {
        let body = AuditRequest {
            audit_type: "image",
            audit_content: url,
        };
        self.post_signed(&self.endpoint, &body).await
    }

    async fn audit_text(&self, text: &str) -> Result<TextAudit, AuditError> {
        let body = AuditRequest {
            audit_type: "text",
            audit_content: text,
        };
        self.post_signed(&self.endpoint, &body).await
    }

    async fn blur_image(&self, url: &str) -> Result<String, AuditError> {
        if self.blur_endpoint.is_empty() {
            return Err(AuditError::BlurUnavailable);
        }
        let body = serde_json::json!({ "image_url": url });
        let data: BlurData = self.post_signed(&self.blur_endpoint, &body).await?;
        Ok(data.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_envelope() {
        let raw = r#"{"code":200,"data":{"LabelResults":[{"Scene":"Porn","Suggestion":"Block"}]}}"#;
        let envelope: AuditEnvelope<ImageAudit> = serde_json::from_str(raw).unwrap();
        let audit = envelope.into_data().unwrap();
        assert_eq!(audit.label_results[0].scene, "Porn");
        assert_eq!(audit.label_results[0].suggestion, "Block");
    }

    #[test]
    fn parses_text_envelope() {
        let raw = r#"{"code":200,"data":{"DetailResults":[{"Label":"Ad","Suggestion":"Review","Keywords":["buy now"]}]}}"#;
        let envelope: AuditEnvelope<TextAudit> = serde_json::from_str(raw).unwrap();
        let audit = envelope.into_data().unwrap();
        assert_eq!(audit.detail_results[0].keywords, vec!["buy now".to_string()]);
    }

    #[test]
    fn non_200_code_is_an_error() {
        let raw = r#"{"code":403,"msg":"quota exhausted"}"#;
        let envelope: AuditEnvelope<ImageAudit> = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.into_data(), Err(AuditError::Service { code: 403 })));
    }

    #[test]
    fn missing_data_is_an_error() {
        let envelope: AuditEnvelope<TextAudit> = serde_json::from_str(r#"{"code":200}"#).unwrap();
        assert!(matches!(envelope.into_data(), Err(AuditError::MissingData)));
    }
}
