use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "bkmgr.toml";

const ENV_PREFIX: &str = "BKMGR_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite file holding the job table
    pub database_path: PathBuf,
    /// Seconds between scheduler evaluations
    pub poll_interval_secs: u64,
    /// fsync every copied file
    pub sync_files: bool,
    pub verbose: bool,
    pub json_logs: bool,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("bkmgr.db"),
            poll_interval_secs: 30,
            sync_files: true,
            verbose: false,
            json_logs: false,
            notifications: NotificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Email,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channel: NotificationChannelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

fn default_smtp_port() -> u16 {
    465
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: NotificationChannelType::None,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            from_address: None,
            webhook_url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults < TOML file < `BKMGR_*` environment < CLI args.
    ///
    /// A missing config file is not an error. Nested keys use `__` in the
    /// environment, e.g. `BKMGR_NOTIFICATIONS__SMTP_PASSWORD`.
    pub fn new<T: Serialize>(config_file: &Path, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Self::figment(config_file);
        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }
        Self::from_figment(figment)
    }

    fn figment(config_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Effective configuration as TOML, with secrets masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.notifications.smtp_password.is_some() {
            shown.notifications.smtp_password = Some("********".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize config")
    }
}
