//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/otagon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/otagon/` (~/.config/otagon/)
//! - Data: `$XDG_DATA_HOME/otagon/` (~/.local/share/otagon/)
//! - State/Logs: `$XDG_STATE_HOME/otagon/` (~/.local/state/otagon/)

use crate::error::{Error, Result};
use crate::types::{Tier, TierLimits};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Conversation cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Trial configuration
    #[serde(default)]
    pub trial: TrialConfig,

    /// Per-tier monthly limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// In-memory conversation cache settings
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum number of conversations held
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Seconds before a cached conversation is considered stale
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}

fn default_cache_ttl() -> u64 {
    300
}

/// Pro trial settings
#[derive(Debug, Deserialize, Clone)]
pub struct TrialConfig {
    /// Length of a trial in days
    #[serde(default = "default_trial_days")]
    pub duration_days: i64,

    /// Warn the user when fewer than this many hours remain
    #[serde(default = "default_warning_hours")]
    pub warning_hours: i64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            duration_days: default_trial_days(),
            warning_hours: default_warning_hours(),
        }
    }
}

/// Longest trial a config file may ask for
pub const MAX_TRIAL_DAYS: i64 = 366;

/// Longest expiry warning window a config file may ask for
pub const MAX_WARNING_HOURS: i64 = MAX_TRIAL_DAYS * 24;

fn default_trial_days() -> i64 {
    14
}

fn default_warning_hours() -> i64 {
    24
}

/// Monthly limits for each tier
///
/// Each `[limits.<tier>]` table may set `text`, `image` or both; an omitted
/// key keeps that tier's built-in value.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_free_limits", deserialize_with = "free_limits")]
    pub free: TierLimits,

    #[serde(default = "default_pro_limits", deserialize_with = "pro_limits")]
    pub pro: TierLimits,

    #[serde(
        default = "default_vanguard_limits",
        deserialize_with = "vanguard_limits"
    )]
    pub vanguard: TierLimits,
}

/// One `[limits.<tier>]` table as written in the file
#[derive(Debug, Deserialize)]
struct LimitsOverride {
    text: Option<u32>,
    image: Option<u32>,
}

impl LimitsOverride {
    fn over(self, base: TierLimits) -> TierLimits {
        TierLimits {
            text: self.text.unwrap_or(base.text),
            image: self.image.unwrap_or(base.image),
        }
    }
}

fn free_limits<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<TierLimits, D::Error> {
    LimitsOverride::deserialize(d).map(|o| o.over(TierLimits::FREE))
}

fn pro_limits<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<TierLimits, D::Error> {
    LimitsOverride::deserialize(d).map(|o| o.over(TierLimits::PRO))
}

fn vanguard_limits<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<TierLimits, D::Error> {
    LimitsOverride::deserialize(d).map(|o| o.over(TierLimits::VANGUARD))
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            free: default_free_limits(),
            pro: default_pro_limits(),
            vanguard: default_vanguard_limits(),
        }
    }
}

fn default_free_limits() -> TierLimits {
    TierLimits::FREE
}

fn default_pro_limits() -> TierLimits {
    TierLimits::PRO
}

fn default_vanguard_limits() -> TierLimits {
    TierLimits::VANGUARD
}

impl LimitsConfig {
    /// Limits configured for a tier
    pub fn for_tier(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Vanguard => self.vanguard,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the rest of the crate cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(Error::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_TRIAL_DAYS).contains(&self.trial.duration_days) {
            return Err(Error::Config(format!(
                "trial.duration_days must be between 1 and {}",
                MAX_TRIAL_DAYS
            )));
        }
        if !(0..=MAX_WARNING_HOURS).contains(&self.trial.warning_hours) {
            return Err(Error::Config(format!(
                "trial.warning_hours must be between 0 and {}",
                MAX_WARNING_HOURS
            )));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/otagon/config.toml` (~/.config/otagon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("otagon").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/otagon/` (~/.local/share/otagon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("otagon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/otagon/` (~/.local/state/otagon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("otagon")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/otagon/otagon.db` (~/.local/share/otagon/otagon.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("otagon.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/otagon/otagon.log` (~/.local/state/otagon/otagon.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("otagon.log")
    }
}
