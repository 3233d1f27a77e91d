//! Configuration loading and management.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use playtime_core::{LimitOverride, LimitSettings, TrackerSettings, UserId};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the ledger file.
    pub ledger_path: PathBuf,
    /// Daily limit in minutes for users without an override. Unset or
    /// `<= 0` means unlimited.
    pub default_limit_minutes: Option<i64>,
    /// Per-user overrides: `-1` uses the default, `0` is unlimited.
    pub user_limits: Vec<LimitOverride>,
    /// Users that are never tracked.
    pub exempt_users: Vec<UserId>,
    /// Warn when less than this many seconds remain.
    pub warn_threshold_seconds: u64,
    /// Largest gap between progress events that still counts as playtime.
    pub max_tick_gap_seconds: u64,
    /// How often to flush, save, and reconcile.
    pub flush_interval_seconds: u64,
    /// Minimum spacing between repeated stop commands to one session.
    pub enforcement_interval_seconds: u64,
    /// Send `set_access` commands that disable a user's library while they
    /// are over their limit.
    pub manage_library_access: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        let tracker = TrackerSettings::default();
        Self {
            ledger_path: data_dir.join("ledger.json"),
            default_limit_minutes: None,
            user_limits: Vec::new(),
            exempt_users: Vec::new(),
            warn_threshold_seconds: tracker.warn_threshold_seconds,
            max_tick_gap_seconds: tracker.max_tick_gap_seconds,
            flush_interval_seconds: 60,
            enforcement_interval_seconds: 5,
            manage_library_access: true,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (PLAYTIME_*)
        figment = figment.merge(Env::prefixed("PLAYTIME_"));

        figment.extract()
    }

    pub fn limits(&self) -> LimitSettings {
        LimitSettings {
            default_minutes: self.default_limit_minutes,
            overrides: self.user_limits.clone(),
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            limits: self.limits(),
            warn_threshold_seconds: self.warn_threshold_seconds,
            max_tick_gap_seconds: self.max_tick_gap_seconds,
        }
    }
}

/// Returns the platform-specific config directory for playtime.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("playtime"))
}

/// Returns the platform-specific data directory for playtime.
///
/// On Linux: `~/.local/share/playtime`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("playtime"))
}
