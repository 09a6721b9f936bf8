use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::activity::ActivityLog;
use crate::bottles::{BottleRepository, BottleStore, Requester};
use crate::cloud::{CloudBridge, HttpCloudClient};
use crate::commands::{CommandHandler, HandlerSettings, PlainRenderer, Session};
use crate::config::Config;
use crate::cooling::CoolingGate;
use crate::db::{self, KvStore, SqliteKvStore};
use crate::media::LocalMediaStore;
use crate::moderation::{ContentModerator, HttpAuditBackend};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Everything a running bot needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<BottleStore>,
    pub handler: Arc<CommandHandler>,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let pool = db::create_pool(&config.db_path())?;
        db::run_migrations(&pool)?;
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(pool));

        let moderator = if config.moderation.enabled {
            let backend = Arc::new(HttpAuditBackend::new(&config.moderation)?);
            Arc::new(ContentModerator::new(&config.moderation, backend))
        } else {
            Arc::new(ContentModerator::disabled())
        };
        if moderator.is_active() {
            tracing::info!("Content moderation enabled ({:?} policy)", config.moderation.policy);
        } else if config.moderation.enabled {
            tracing::warn!(
                "Content moderation is enabled but app_id or secret is missing; content is not screened"
            );
        }

        let media_path = config.media_path();
        std::fs::create_dir_all(&media_path)?;
        let media = Arc::new(LocalMediaStore::new(&media_path)?);

        let activity = Arc::new(ActivityLog::new(
            kv.clone(),
            config.storage.log_namespace.clone(),
            config.activity.log_cap,
        ));
        let repo = BottleRepository::new(
            kv.clone(),
            config.storage.bottle_namespace.clone(),
            config.storage.history_namespace.clone(),
        );
        let store = Arc::new(BottleStore::new(
            repo,
            media,
            moderator.clone(),
            activity,
            config.bot.style,
        ));
        let fix_root = config.storage.auto_fix_paths.then_some(media_path.as_path());
        store.load(fix_root).await?;

        let cloud = if config.cloud.enabled {
            let client = Arc::new(HttpCloudClient::new(config.cloud.base_url.clone())?);
            tracing::info!("Cloud bottles enabled at {}", config.cloud.base_url);
            Some(Arc::new(CloudBridge::new(
                client,
                moderator,
                kv,
                config.storage.export_key.clone(),
                config.compat.onebot_avatars,
            )))
        } else {
            None
        };

        let handler = Arc::new(CommandHandler::new(
            store.clone(),
            Arc::new(CoolingGate::new(&config.cooling)),
            cloud,
            Arc::new(PlainRenderer),
            HandlerSettings {
                bot_id: config.bot.bot_id.clone(),
                style: config.bot.style,
                page_size: config.activity.page_size,
                author_can_delete_comments: config.compat.author_can_delete_comments,
                onebot_avatars: config.compat.onebot_avatars,
            },
        ));

        Ok(Self {
            config,
            store,
            handler,
        })
    }

    /// A session for `user_id` talking to the configured bot.
    pub fn session(&self, user_id: &str, display_name: Option<&str>) -> Session {
        let mut user = if self.config.is_admin(user_id) {
            Requester::admin(user_id)
        } else {
            Requester::new(user_id)
        };
        if let Some(name) = display_name {
            user = user.with_name(name);
        }

        Session {
            user,
            platform: self.config.bot.platform.clone(),
            self_id: self.config.bot.bot_id.clone(),
            bot_avatar: (self.config.bot.platform == "qq" && !self.config.bot.bot_id.is_empty())
                .then(|| format!("https://q.qlogo.cn/qqapp/{}/0/100", self.config.bot.bot_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use tempfile::TempDir;

    fn load_config(tmp: &TempDir) -> Config {
        let cli = Cli {
            config: None,
            data_dir: Some(tmp.path().to_path_buf()),
            user: None,
            name: None,
            platform: None,
        };
        Config::load(&cli).unwrap()
    }

    async fn build_state(tmp: &TempDir, admins: &[&str]) -> AppState {
        let mut config = load_config(tmp);
        config.bot.admins = admins.iter().map(|s| s.to_string()).collect();
        config.bot.bot_id = "1020".into();
        AppState::build(config).await.unwrap()
    }

    #[tokio::test]
    async fn builds_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let state = build_state(&tmp, &[]).await;

        assert!(tmp.path().join("driftbottle.db").exists());
        assert!(tmp.path().join("media").is_dir());
        assert_eq!(state.store.last_id().await, 0);
    }

    #[tokio::test]
    async fn sessions_know_admins() {
        let tmp = TempDir::new().unwrap();
        let state = build_state(&tmp, &["root"]).await;

        let admin = state.session("root", Some("Root"));
        assert!(admin.user.is_admin);
        assert_eq!(admin.user.display_name.as_deref(), Some("Root"));
        assert_eq!(admin.bot_avatar.as_deref(), Some("https://q.qlogo.cn/qqapp/1020/0/100"));
        assert!(!state.session("guest", None).user.is_admin);
    }

    #[tokio::test]
    async fn moderation_without_credentials_lets_content_through() {
        let tmp = TempDir::new().unwrap();
        let mut config = load_config(&tmp);
        config.moderation.enabled = true;
        config.moderation.secret.clear();
        let state = AppState::build(config).await.unwrap();

        let alice = Requester::new("alice");
        state
            .store
            .create(&alice, crate::bottles::Draft::text("screened nowhere"))
            .await
            .unwrap();
        let bottles = state.store.authored_by("alice").await;
        assert_eq!(bottles[0].content.text.as_deref(), Some("screened nowhere"));
    }
}
