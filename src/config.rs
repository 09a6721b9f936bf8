use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "driftbottle", about = "A message-in-a-bottle service for chat bots")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// User id to act as in the console
    #[arg(short, long)]
    pub user: Option<String>,

    /// Display name of the console user
    #[arg(long)]
    pub name: Option<String>,

    /// Chat platform the console pretends to be
    #[arg(long)]
    pub platform: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub storage: StorageConfig,
    pub cooling: CoolingConfig,
    pub activity: ActivityConfig,
    pub moderation: ModerationConfig,
    pub cloud: CloudConfig,
    pub compat: CompatConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BotConfig {
    pub bot_id: String,
    pub platform: String,
    pub admins: Vec<String>,
    /// Display template selector stored on every new bottle
    pub style: u8,
    pub debug: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database: Option<PathBuf>,
    pub media_path: Option<PathBuf>,
    pub bottle_namespace: String,
    pub history_namespace: String,
    pub log_namespace: String,
    pub export_key: String,
    pub auto_fix_paths: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CoolingConfig {
    pub throw_ms: u64,
    pub retrieve_ms: u64,
    pub comment_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ActivityConfig {
    pub log_cap: usize,
    pub page_size: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModerationPolicy {
    /// Drop flagged images
    #[default]
    Reject,
    /// Replace flagged images with a blurred copy
    Blur,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    pub app_id: String,
    pub secret: String,
    pub endpoint: String,
    pub blur_endpoint: String,
    pub policy: ModerationPolicy,
    pub image_filter: Vec<String>,
    pub text_filter: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub base_url: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CompatConfig {
    /// Build avatar links the way OneBot adapters expect
    pub onebot_avatars: bool,
    pub author_can_delete_comments: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_id: String::new(),
            platform: "qq".to_string(),
            admins: Vec::new(),
            style: 0,
            debug: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: None,
            media_path: None,
            bottle_namespace: "smm-driftbottle".to_string(),
            history_namespace: "smm-driftbottle-history".to_string(),
            log_namespace: "smm-driftbottle-log".to_string(),
            export_key: "smm-driftbottle-cloud/exported".to_string(),
            auto_fix_paths: false,
        }
    }
}

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            throw_ms: 20_000,
            retrieve_ms: 20_000,
            comment_ms: 20_000,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            log_cap: 50,
            page_size: 10,
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            secret: String::new(),
            endpoint: "https://tools.mgtv100.com/external/v1/qcloud_content_audit".to_string(),
            blur_endpoint: String::new(),
            policy: ModerationPolicy::Reject,
            image_filter: ["ACGPorn", "ACGSexy", "SexualGoods", "Porn", "PornSum", "Sexy"]
                .into_iter()
                .map(String::from)
                .collect(),
            text_filter: ["Abuse", "Illegal", "Spam", "Terror", "Porn", "Polity", "Ad"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://182.92.130.139:8080".to_string(),
        }
    }
}

impl ModerationConfig {
    /// Moderation only runs when switched on and both credentials are present.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.app_id.is_empty() && !self.secret.is_empty()
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(cli);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref platform) = cli.platform {
            config.bot.platform = platform.clone();
        }

        // Resolve paths relative to data dir
        if config.storage.database.is_none() {
            config.storage.database = Some(data_dir.join("driftbottle.db"));
        }
        if config.storage.media_path.is_none() {
            config.storage.media_path = Some(data_dir.join("media"));
        }

        Ok(config)
    }

    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".driftbottle")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| PathBuf::from("driftbottle.db"))
    }

    pub fn media_path(&self) -> PathBuf {
        self.storage
            .media_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("media"))
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.bot.admins.iter().any(|admin| admin == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with(data_dir: Option<PathBuf>, config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            data_dir,
            user: None,
            name: None,
            platform: None,
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.bot.platform, "qq");
        assert_eq!(config.storage.bottle_namespace, "smm-driftbottle");
        assert_eq!(config.storage.history_namespace, "smm-driftbottle-history");
        assert_eq!(config.cooling.throw_ms, 20_000);
        assert_eq!(config.activity.log_cap, 50);
        assert_eq!(config.moderation.policy, ModerationPolicy::Reject);
        assert_eq!(config.moderation.image_filter.len(), 6);
        assert_eq!(config.moderation.text_filter.len(), 7);
        assert!(!config.moderation.is_active());
        assert!(config.storage.database.is_none());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli = cli_with(Some(PathBuf::from("/tmp/test-driftbottle")), None);
        assert_eq!(Config::data_dir(&cli), PathBuf::from("/tmp/test-driftbottle"));
    }

    #[test]
    fn load_with_no_config_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = cli_with(Some(tmp.path().to_path_buf()), None);
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.db_path(), tmp.path().join("driftbottle.db"));
        assert_eq!(config.media_path(), tmp.path().join("media"));
    }

    #[test]
    fn load_reads_toml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[bot]
bot_id = "102030"
admins = ["10001", "10002"]

[cooling]
throw_ms = 1000

[moderation]
enabled = true
app_id = "app"
secret = "s3cret"
policy = "blur"
"#,
        )
        .unwrap();

        let cli = cli_with(Some(tmp.path().to_path_buf()), Some(config_path));
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.bot.bot_id, "102030");
        assert!(config.is_admin("10002"));
        assert!(!config.is_admin("10003"));
        assert_eq!(config.cooling.throw_ms, 1000);
        assert_eq!(config.cooling.retrieve_ms, 20_000);
        assert_eq!(config.moderation.policy, ModerationPolicy::Blur);
        assert!(config.moderation.is_active());
    }

    #[test]
    fn cli_platform_beats_toml_value() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(&config_path, "[bot]\nplatform = \"discord\"\n").unwrap();

        let mut cli = cli_with(Some(tmp.path().to_path_buf()), Some(config_path));
        cli.platform = Some("onebot".to_string());
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.bot.platform, "onebot");
    }
}
