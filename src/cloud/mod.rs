//! Cloud bottles: the same throw/retrieve/comment flow, backed by the remote
//! bottle service instead of local storage.

pub mod client;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::avatar::{avatar_url, extract_app_id};
use crate::bottles::{sanitize_text, Bottle, BottleId, Draft, Requester};
use crate::db::kv::{self, KvStore};
use crate::media;
use crate::moderation::ContentModerator;

pub use client::{
    CloudApi, CloudBottle, CloudError, CloudId, HttpCloudClient, NewCloudBottle, NewCloudComment,
    NewCloudContent,
};

/// The bot a cloud request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BotIdentity {
    pub platform: String,
    pub bot_id: String,
}

impl BotIdentity {
    /// On `qq` the bot id is the app id embedded in the bot's avatar link;
    /// elsewhere it is the bot's own user id.
    pub fn resolve(platform: &str, self_id: &str, bot_avatar: Option<&str>) -> Result<Self, CloudError> {
        let bot_id = if platform == "qq" {
            bot_avatar.and_then(extract_app_id)
        } else {
            Some(self_id.to_string()).filter(|id| !id.is_empty())
        };

        match bot_id {
            Some(bot_id) if !platform.is_empty() => Ok(Self {
                platform: platform.to_string(),
                bot_id,
            }),
            _ => Err(CloudError::UnknownBot(platform.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudThrow {
    pub id: CloudId,
    pub filtered_images: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub exported: Vec<BottleId>,
    pub already_exported: usize,
    pub skipped_audio: usize,
    pub failed: usize,
}

pub struct CloudBridge {
    api: Arc<dyn CloudApi>,
    moderator: Arc<ContentModerator>,
    kv: Arc<dyn KvStore>,
    export_key: String,
    onebot_avatars: bool,
    tokens: Mutex<HashMap<BotIdentity, String>>,
}

impl CloudBridge {
    pub fn new(
        api: Arc<dyn CloudApi>,
        moderator: Arc<ContentModerator>,
        kv: Arc<dyn KvStore>,
        export_key: impl Into<String>,
        onebot_avatars: bool,
    ) -> Self {
        Self {
            api,
            moderator,
            kv,
            export_key: export_key.into(),
            onebot_avatars,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Moderate and submit a new bottle. Images are sent as their remote URLs.
    pub async fn throw(&self, bot: &BotIdentity, requester: &Requester, draft: Draft) -> Result<CloudThrow, CloudError> {
        let text = sanitize_text(draft.text.as_deref());
        let title = sanitize_text(draft.title.as_deref());
        if text.is_none() && draft.images.is_empty() {
            return Err(CloudError::EmptyContent);
        }

        let text = match text {
            Some(text) => self.moderator.audit_text(&text).await,
            None => String::new(),
        };
        let title = match title {
            Some(title) => self.moderator.audit_text(&title).await,
            None => String::new(),
        };
        let screened = self.moderator.audit_images(draft.images).await;
        if text.is_empty() && screened.images.is_empty() {
            return Err(CloudError::EmptyContent);
        }

        let bottle = NewCloudBottle {
            content: NewCloudContent {
                text,
                title,
                image: screened.images,
                create_time: None,
            },
            user_id: requester.id.clone(),
        };

        let token = self.token(bot).await?;
        let id = self.api.add(&token, &bottle).await.inspect_err(|e| {
            tracing::warn!("Cloud throw failed for {}: {}", requester.id, e);
        })?;

        tracing::info!("User {} threw cloud bottle {}", requester.id, id);
        Ok(CloudThrow {
            id,
            filtered_images: screened.flagged,
        })
    }

    pub async fn retrieve(&self, bot: &BotIdentity, id: Option<u64>) -> Result<CloudBottle, CloudError> {
        let token = self.token(bot).await?;
        let bottle = self.api.random(&token, id).await.inspect_err(|e| {
            tracing::warn!("Cloud retrieve failed: {}", e);
        })?;
        Ok(self.attach_avatars(bottle))
    }

    pub async fn comment(
        &self,
        bot: &BotIdentity,
        requester: &Requester,
        bottle_id: CloudId,
        text: &str,
    ) -> Result<String, CloudError> {
        let text = sanitize_text(Some(text)).ok_or(CloudError::EmptyContent)?;
        let text = self.moderator.audit_text(&text).await;

        let comment = NewCloudComment {
            bottle_id,
            text,
            user_id: requester.id.clone(),
            platform: bot.platform.clone(),
        };
        let token = self.token(bot).await?;
        self.api.comment(&token, &comment).await
    }

    /// Copy locally authored bottles to the cloud, once each.
    ///
    /// Audio bottles are skipped. A bottle that fails to upload is logged and
    /// retried by the next export; the rest of the batch carries on.
    pub async fn export(
        &self,
        bot: &BotIdentity,
        requester: &Requester,
        bottles: &[Bottle],
    ) -> Result<ExportReport, CloudError> {
        if !requester.is_admin {
            return Err(CloudError::Forbidden);
        }

        let mut exported = kv::load_json::<BTreeSet<BottleId>>(self.kv.as_ref(), &self.export_key)
            .await?
            .unwrap_or_default();
        let token = self.token(bot).await?;
        let mut report = ExportReport::default();

        for bottle in bottles {
            if exported.contains(&bottle.id) {
                report.already_exported += 1;
                continue;
            }
            if bottle.is_audio() {
                report.skipped_audio += 1;
                continue;
            }

            let result = match to_import(bottle).await {
                Ok(item) => self.api.import(&token, std::slice::from_ref(&item)).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.exported.push(bottle.id),
                Err(e) => {
                    tracing::warn!("Exporting bottle {} failed: {}", bottle.id, e);
                    report.failed += 1;
                }
            }
        }

        exported.extend(report.exported.iter().copied());
        kv::save_json(self.kv.as_ref(), &self.export_key, &exported).await?;

        tracing::info!(
            "Exported {} bottle(s), {} failed, {} skipped as audio",
            report.exported.len(),
            report.failed,
            report.skipped_audio
        );
        Ok(report)
    }

    /// Cached token for `bot`, logging in on first use.
    async fn token(&self, bot: &BotIdentity) -> Result<String, CloudError> {
        let cached = self.lock_tokens().get(bot).cloned();
        if let Some(token) = cached {
            return Ok(token);
        }

        let token = self.api.login(&bot.platform, &bot.bot_id).await?;
        self.lock_tokens().insert(bot.clone(), token.clone());
        tracing::debug!("Logged in to the cloud as {}/{}", bot.platform, bot.bot_id);
        Ok(token)
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<BotIdentity, String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach_avatars(&self, mut bottle: CloudBottle) -> CloudBottle {
        if bottle.platform != "qq" {
            return bottle;
        }
        bottle.content.avatar = Some(avatar_url(
            &bottle.platform,
            &bottle.bot_id,
            &bottle.user_id,
            self.onebot_avatars,
        ));
        for review in &mut bottle.review {
            review.avatar = Some(avatar_url(
                &review.platform,
                &review.bot_id,
                &review.user_id,
                self.onebot_avatars,
            ));
        }
        bottle
    }
}

async fn to_import(bottle: &Bottle) -> Result<NewCloudBottle, CloudError> {
    let mut image = Vec::new();
    for reference in bottle.content.images.iter().flatten() {
        image.push(embed(reference).await?);
    }

    Ok(NewCloudBottle {
        content: NewCloudContent {
            text: bottle.content.text.clone().unwrap_or_default(),
            title: bottle.content.title.clone().unwrap_or_default(),
            image,
            create_time: Some(bottle.content.created_at.timestamp_millis()),
        },
        user_id: bottle.author_id.clone(),
    })
}

/// Local files become `data:` URIs; anything else is sent as-is.
async fn embed(reference: &str) -> Result<String, CloudError> {
    match media::local_path(reference) {
        Some(path) => data_uri(&path).await,
        None => Ok(reference.to_string()),
    }
}

pub async fn data_uri(path: &Path) -> Result<String, CloudError> {
    let bytes = tokio::fs::read(path).await?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}
