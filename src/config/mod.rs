use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,

    #[serde(default)]
    pub topup: TopupConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub donation: DonationConfig,

    #[serde(default)]
    pub trial: TrialConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    pub token: String,

    /// Chat id of the owning admin; promoted to the admin role on first contact.
    pub admin_id: i64,

    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Optional group chat that receives top-up/purchase notifications.
    #[serde(default)]
    pub notify_chat_id: Option<i64>,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopupConfig {
    #[serde(default = "default_min_amount")]
    pub min_amount: i64,

    #[serde(default = "default_max_amount")]
    pub max_amount: i64,
}

impl Default for TopupConfig {
    fn default() -> Self {
        Self {
            min_amount: default_min_amount(),
            max_amount: default_max_amount(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_token: String,

    /// Seconds between invoice status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Wall-clock deadline after which an unpaid invoice expires.
    #[serde(default = "default_invoice_deadline")]
    pub invoice_deadline_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_token: String::new(),
            poll_interval_secs: default_poll_interval(),
            invoice_deadline_secs: default_invoice_deadline(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DonationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Account name on the donation platform.
    #[serde(default)]
    pub account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_trial_minutes")]
    pub duration_minutes: i64,

    /// Cooldown in hours before the same (user, server, protocol) may claim
    /// again. -1 disables the cooldown for that role.
    #[serde(default = "default_cooldown_standard")]
    pub cooldown_hours_standard: i64,

    #[serde(default = "default_cooldown_reseller")]
    pub cooldown_hours_reseller: i64,

    #[serde(default = "default_cooldown_admin")]
    pub cooldown_hours_admin: i64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_minutes: default_trial_minutes(),
            cooldown_hours_standard: default_cooldown_standard(),
            cooldown_hours_reseller: default_cooldown_reseller(),
            cooldown_hours_admin: default_cooldown_admin(),
        }
    }
}

impl TrialConfig {
    pub fn cooldown_hours_for(&self, role: crate::store::models::Role) -> i64 {
        use crate::store::models::Role;
        match role {
            Role::Standard => self.cooldown_hours_standard,
            Role::Reseller => self.cooldown_hours_reseller,
            Role::Admin => self.cooldown_hours_admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Paid leases expiring within this many days get a one-time reminder.
    #[serde(default = "default_reminder_days")]
    pub reminder_lookahead_days: i64,

    #[serde(default = "default_paid_sweep_secs")]
    pub paid_sweep_interval_secs: u64,

    #[serde(default = "default_trial_sweep_secs")]
    pub trial_sweep_interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            reminder_lookahead_days: default_reminder_days(),
            paid_sweep_interval_secs: default_paid_sweep_secs(),
            trial_sweep_interval_secs: default_trial_sweep_secs(),
        }
    }
}

fn default_store_name() -> String {
    "kedai".to_string()
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_min_amount() -> i64 {
    10_000
}
fn default_max_amount() -> i64 {
    1_000_000
}
fn default_poll_interval() -> u64 {
    5
}
fn default_invoice_deadline() -> u64 {
    300
}
fn default_trial_minutes() -> i64 {
    60
}
fn default_cooldown_standard() -> i64 {
    24
}
fn default_cooldown_reseller() -> i64 {
    6
}
fn default_cooldown_admin() -> i64 {
    -1
}
fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_reminder_days() -> i64 {
    3
}
fn default_paid_sweep_secs() -> u64 {
    3600
}
fn default_trial_sweep_secs() -> u64 {
    60
}
fn default_db_path() -> PathBuf {
    PathBuf::from("kedai.sqlite")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Write a default config, refusing to clobber an existing file.
    pub fn init_at(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("config already exists at {}", path.display());
        }
        let default = Config::default();
        let content = toml::to_string_pretty(&default)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.topup.min_amount, 10_000);
        assert_eq!(config.topup.max_amount, 1_000_000);
        assert_eq!(config.gateway.poll_interval_secs, 5);
        assert_eq!(config.gateway.invoice_deadline_secs, 300);
        assert_eq!(config.trial.cooldown_hours_admin, -1);
        assert_eq!(config.sweeper.reminder_lookahead_days, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [bot]
            token = "123:abc"
            admin_id = 42

            [gateway]
            enabled = true
            base_url = "https://pay.example.com"
            api_token = "secret"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bot.admin_id, 42);
        assert!(config.gateway.enabled);
        assert!(!config.donation.enabled);
        assert_eq!(config.trial.duration_minutes, 60);
    }
}
