//! Dripwise configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DripError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DripConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub nurture: NurtureConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
}

impl DripConfig {
    /// Load config from the default path (~/.dripwise/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DripError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DripError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Apply `DRIPWISE_ENV` and `STRIPE_SECRET_KEY` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(env) = lookup("DRIPWISE_ENV").filter(|v| !v.trim().is_empty()) {
            self.billing.environment = env.trim().to_lowercase();
        }
        if let Some(key) = lookup("STRIPE_SECRET_KEY").filter(|v| !v.trim().is_empty()) {
            self.billing.stripe_secret_key = Some(key.trim().to_string());
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Dripwise home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dripwise")
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.dripwise/dripwise.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Scheduled-automation batch runner limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_owners_limit")]
    pub owners_limit: usize,
    #[serde(default = "default_per_owner_max_fires")]
    pub per_owner_max_fires: usize,
    /// Wall-clock budget for one pass. Work not reached is left for the next pass.
    #[serde(default = "default_pass_budget")]
    pub pass_budget_secs: u64,
    /// Per-call timeout on action runners, billing, messaging.
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

fn default_owners_limit() -> usize { 200 }
fn default_per_owner_max_fires() -> usize { 10 }
fn default_pass_budget() -> u64 { 50 }
fn default_collaborator_timeout() -> u64 { 15 }
fn default_lease_ttl() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owners_limit: default_owners_limit(),
            per_owner_max_fires: default_per_owner_max_fires(),
            pass_budget_secs: default_pass_budget(),
            collaborator_timeout_secs: default_collaborator_timeout(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// Nurture drip sequencer policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NurtureConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_hour_retry")]
    pub paused_retry_minutes: i64,
    #[serde(default = "default_hour_retry")]
    pub billing_retry_minutes: i64,
    #[serde(default = "default_send_retry")]
    pub send_retry_minutes: i64,
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,
}

fn default_batch_size() -> usize { 120 }
fn default_hour_retry() -> i64 { 60 }
fn default_send_retry() -> i64 { 15 }
fn default_max_error_len() -> usize { 500 }

impl Default for NurtureConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            paused_retry_minutes: default_hour_retry(),
            billing_retry_minutes: default_hour_retry(),
            send_retry_minutes: default_send_retry(),
            max_error_len: default_max_error_len(),
        }
    }
}

/// Event dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_grace_minutes")]
    pub missed_appointment_grace_minutes: i64,
    #[serde(default = "default_fired_set_capacity")]
    pub fired_set_capacity: usize,
}

fn default_grace_minutes() -> i64 { 30 }
fn default_fired_set_capacity() -> usize { 5000 }

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            missed_appointment_grace_minutes: default_grace_minutes(),
            fired_set_capacity: default_fired_set_capacity(),
        }
    }
}

/// Billing provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// "production" or anything else (treated as non-production).
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub stripe_secret_key: Option<String>,
    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,
}

fn default_environment() -> String { "development".into() }
fn default_stripe_api_base() -> String { "https://api.stripe.com".into() }

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            stripe_secret_key: None,
            stripe_api_base: default_stripe_api_base(),
        }
    }
}

impl BillingConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn has_stripe_key(&self) -> bool {
        self.stripe_secret_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }

    /// Developer convenience: outside production, with neither billing nor
    /// messaging configured, every campaign passes the billing gate.
    pub fn dev_bypass(&self, messaging: &MessagingConfig) -> bool {
        !self.is_production() && !self.has_stripe_key() && !messaging.is_configured()
    }
}

/// Outbound messaging relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub relay_token: Option<String>,
    #[serde(default = "default_from_name")]
    pub default_from_name: String,
}

fn default_from_name() -> String { "Dripwise".into() }

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            relay_token: None,
            default_from_name: default_from_name(),
        }
    }
}

impl MessagingConfig {
    pub fn is_configured(&self) -> bool {
        self.relay_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Where fired automation action chains are delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}
