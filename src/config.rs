//! Конфигурация бота: TOML-файл, токен можно переопределить через BOT_TOKEN.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Не удалось прочитать конфиг {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Некорректный конфиг: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Не задан токен бота (bot_token в конфиге или BOT_TOKEN)")]
    MissingToken,
    #[error("Некорректное значение {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot_token: Option<String>,
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    pub support_chat_url: String,
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
    pub panel: PanelConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub clusters: ClustersConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
}

/// Учётные данные и параметры клиентов панелей 3x-ui.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_flow")]
    pub flow: String,
    #[serde(default)]
    pub limit_ip: i64,
    #[serde(default)]
    pub total_gb: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClustersConfig {
    #[serde(default = "default_fallback_cluster")]
    pub fallback_cluster: String,
}

/// Обязательная подписка на канал перед началом работы.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub yookassa: bool,
    #[serde(default)]
    pub yoomoney: bool,
    #[serde(default)]
    pub cryptobot: bool,
    #[serde(default)]
    pub stars: bool,
    #[serde(default)]
    pub robokassa: bool,
    #[serde(default)]
    pub donations: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vpn-cluster-bot/bot.db")
}

fn default_trial_days() -> i64 {
    1
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_flow() -> String {
    "xtls-rprx-vision".to_string()
}

fn default_sync_concurrency() -> usize {
    2
}

fn default_pacing_ms() -> u64 {
    600
}

fn default_fallback_cluster() -> String {
    "cluster1".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_sync_concurrency(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

impl Default for ClustersConfig {
    fn default() -> Self {
        Self {
            fallback_cluster: default_fallback_cluster(),
        }
    }
}

impl SyncConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl ChannelConfig {
    /// Канал, подписку на который нужно проверять, если проверка включена.
    pub fn required_channel(&self) -> Option<i64> {
        if self.required { self.id } else { None }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.concurrency",
                reason: "должно быть не меньше 1".to_string(),
            });
        }
        if self.trial_days < 1 {
            return Err(ConfigError::Invalid {
                field: "trial_days",
                reason: "должно быть не меньше 1".to_string(),
            });
        }
        if self.channel.required && self.channel.id.is_none() {
            return Err(ConfigError::Invalid {
                field: "channel.id",
                reason: "обязательная подписка включена, но канал не указан".to_string(),
            });
        }
        Ok(())
    }

    pub fn bot_token(&self) -> Result<String, ConfigError> {
        std::env::var("BOT_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.bot_token.clone())
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingToken)
    }

    pub fn is_admin(&self, tg_user_id: i64) -> bool {
        self.admin_ids.contains(&tg_user_id)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_toml(
        r#"
        admin_ids = [1]
        support_chat_url = "https://t.me/support"

        [panel]
        username = "admin"
        password = "secret"
        "#,
    )
    .expect("test config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = test_config();
        assert_eq!(config.sync.concurrency, 2);
        assert_eq!(config.sync.pacing(), Duration::from_millis(600));
        assert_eq!(config.clusters.fallback_cluster, "cluster1");
        assert_eq!(config.panel.flow, "xtls-rprx-vision");
        assert_eq!(config.trial_days, 1);
        assert!(config.channel.required_channel().is_none());
        assert!(!config.payments.stars);
        assert!(config.is_admin(1));
        assert!(!config.is_admin(2));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Config::from_toml(
            r#"
            admin_ids = []
            support_chat_url = "https://t.me/support"
            [panel]
            username = "a"
            password = "b"
            [sync]
            concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "sync.concurrency",
                ..
            }
        ));
    }

    #[test]
    fn required_channel_needs_id() {
        let err = Config::from_toml(
            r#"
            admin_ids = []
            support_chat_url = "https://t.me/support"
            [panel]
            username = "a"
            password = "b"
            [channel]
            required = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "channel.id", .. }));
    }
}
