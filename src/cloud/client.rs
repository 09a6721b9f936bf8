//! HTTP client for the remote bottle service.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloud service rejected the request: {0}")]
    Rejected(String),

    #[error("Bot identity unknown for platform {0}")]
    UnknownBot(String),

    #[error("Bottle has no content")]
    EmptyContent,

    #[error("Only administrators can do that")]
    Forbidden,

    #[error("Reading media failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::db::StorageError),
}

/// Remote ids arrive either as numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CloudId {
    Number(u64),
    Text(String),
}

impl fmt::Display for CloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudId::Number(n) => write!(f, "{}", n),
            CloudId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Creation time as sent by the service: epoch millis or a preformatted string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreateTime {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudBottle {
    pub id: CloudId,
    pub content: CloudContent,
    #[serde(default)]
    pub review: Vec<CloudReview>,
    pub user_id: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default = "default_show")]
    pub show: bool,
    #[serde(default)]
    pub get_count: u64,
    #[serde(default)]
    pub platform: String,
}

fn default_show() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudContent {
    pub create_time: CreateTime,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub image: Vec<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudReview {
    pub create_time: CreateTime,
    #[serde(default)]
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub image: Vec<String>,
}

/// Body of `POST /add` and of each `POST /import` list item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCloudBottle {
    pub content: NewCloudContent,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCloudContent {
    pub text: String,
    pub title: String,
    pub image: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCloudComment {
    pub bottle_id: CloudId,
    pub text: String,
    pub user_id: String,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RandomResponse {
    data: CloudBottle,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    id: CloudId,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImportResponse {
    #[serde(default)]
    ids: Vec<CloudId>,
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
    list: &'a [NewCloudBottle],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    platform: &'a str,
    bot_id: &'a str,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Exchange a bot identity for an access token
    async fn login(&self, platform: &str, bot_id: &str) -> Result<String, CloudError>;

    /// A random bottle, or the one with `id`
    async fn random(&self, token: &str, id: Option<u64>) -> Result<CloudBottle, CloudError>;

    async fn add(&self, token: &str, bottle: &NewCloudBottle) -> Result<CloudId, CloudError>;

    /// Returns the service's message for the user
    async fn comment(&self, token: &str, comment: &NewCloudComment) -> Result<String, CloudError>;

    async fn import(&self, token: &str, list: &[NewCloudBottle]) -> Result<Vec<CloudId>, CloudError>;
}

pub struct HttpCloudClient {
    client: Client,
    base_url: String,
}

impl HttpCloudClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, token)
    }
}

/// Decode a success body, or turn an error body's `msg` into `Rejected`.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CloudError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<MessageResponse>()
            .await
            .ok()
            .and_then(|body| body.msg)
            .unwrap_or_else(|| status.to_string());
        return Err(CloudError::Rejected(message));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl CloudApi for HttpCloudClient {
    async fn login(&self, platform: &str, bot_id: &str) -> Result<String, CloudError> {
        let response = self
            .client
            .post(self.url("/login"))
            .json(&LoginRequest { platform, bot_id })
            .send()
            .await?;
        let body: TokenResponse = decode(response).await?;
        Ok(body.token)
    }

    async fn random(&self, token: &str, id: Option<u64>) -> Result<CloudBottle, CloudError> {
        let mut request = self.authorized(self.client.get(self.url("/random")), token);
        if let Some(id) = id {
            request = request.query(&[("id", id)]);
        }
        let body: RandomResponse = decode(request.send().await?).await?;
        Ok(body.data)
    }

    async fn add(&self, token: &str, bottle: &NewCloudBottle) -> Result<CloudId, CloudError> {
        let request = self.authorized(self.client.post(self.url("/add")), token).json(bottle);
        let body: AddResponse = decode(request.send().await?).await?;
        Ok(body.id)
    }

    async fn comment(&self, token: &str, comment: &NewCloudComment) -> Result<String, CloudError> {
        let request = self.authorized(self.client.post(self.url("/comment")), token).json(comment);
        let body: MessageResponse = decode(request.send().await?).await?;
        Ok(body.msg.unwrap_or_default())
    }

    async fn import(&self, token: &str, list: &[NewCloudBottle]) -> Result<Vec<CloudId>, CloudError> {
        let request = self
            .authorized(self.client.post(self.url("/import")), token)
            .json(&ImportRequest { list });
        let body: ImportResponse = decode(request.send().await?).await?;
        Ok(body.ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_bottle() {
        let raw = r#"{
            "id": "64a1",
            "content": {"createTime": 1700000000000, "text": "hi", "title": "", "image": [], "userId": "u1"},
            "review": [{"createTime": "2024-01-01 10:00", "text": "yo", "userId": "u2", "botId": "b", "platform": "qq", "image": []}],
            "userId": "u1",
            "botId": "b",
            "show": true,
            "getCount": 4,
            "platform": "qq"
        }"#;
        let bottle: CloudBottle = serde_json::from_str(raw).unwrap();
        assert_eq!(bottle.id, CloudId::Text("64a1".into()));
        assert_eq!(bottle.content.create_time, CreateTime::Millis(1_700_000_000_000));
        assert_eq!(bottle.review[0].create_time, CreateTime::Text("2024-01-01 10:00".into()));
        assert_eq!(bottle.get_count, 4);
        assert!(bottle.content.avatar.is_none());
    }

    #[test]
    fn new_bottle_body_is_camel_case() {
        let body = NewCloudBottle {
            content: NewCloudContent {
                text: "hello".into(),
                title: String::new(),
                image: vec!["https://img/1.png".into()],
                create_time: None,
            },
            user_id: "u1".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["content"]["image"][0], "https://img/1.png");
        assert!(json["content"].get("createTime").is_none());
    }

    #[test]
    fn comment_body_carries_bottle_id() {
        let body = NewCloudComment {
            bottle_id: CloudId::Number(12),
            text: "nice".into(),
            user_id: "u2".into(),
            platform: "qq".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["bottleId"], 12);
        assert_eq!(json["platform"], "qq");
    }

    #[test]
    fn base_url_is_normalized() {
        let client = HttpCloudClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/login"), "http://localhost:8080/login");
    }
}
