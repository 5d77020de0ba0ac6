//! TOML configuration for evalboard.
//!
//! Every section and field has a default, so an empty (or missing) file is
//! a valid configuration. Lookup order is the `--config` flag, the
//! `EVALBOARD_CONFIG` environment variable, `./evalboard.toml`, then the
//! compiled-in defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "EVALBOARD_CONFIG";

const LOCAL_CONFIG: &str = "evalboard.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the implicit
    /// locations fall through to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "EVALBOARD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the SQLite database file.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/evalboard.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Run lifecycle monitor timings. All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the timeout reaper.
    pub timeout_check_interval_secs: u64,
    /// Period of the auto-resume loop.
    pub auto_resume_interval_secs: u64,
    /// Timeout for runs that do not set their own. Also the idle time after
    /// which a run with a longer timeout counts as stalled.
    pub default_timeout_secs: i64,
    /// How long a run stays PAUSED before auto-resume picks it up.
    pub pause_grace_secs: i64,
    /// Soft deadline per tick; exceeding it only logs.
    pub tick_deadline_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_check_interval_secs: 60,
            auto_resume_interval_secs: 30,
            default_timeout_secs: crate::runs::DEFAULT_TIMEOUT_SECS,
            pause_grace_secs: 300,
            tick_deadline_secs: 20,
        }
    }
}

impl MonitorConfig {
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval_secs.max(1))
    }

    pub fn auto_resume_interval(&self) -> Duration {
        Duration::from_secs(self.auto_resume_interval_secs.max(1))
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_secs)
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// What `compute_for_batch` does when one model fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Propagate the first failure; later models are not computed.
    #[default]
    Abort,
    /// Record the failure and carry on with the remaining models.
    Continue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub on_model_failure: FailurePolicy,
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
