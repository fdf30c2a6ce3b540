//! Runtime configuration, read from a TOML file.
//!
//! ```toml
//! [scheduler]
//! stack_size = 65536
//!
//! [http]
//! max_clients = 100
//! timeout_ms = 20000
//! user_agent = "switchback/0.1"
//!
//! [unit]
//! debug_argument = "admin_debug_mode"
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::context::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub http: HttpConfig,
    pub unit: UnitConfig,
}

/// `[scheduler]`: worker context settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Bytes of stack per worker context.
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// `[http]`: the bundled HTTP client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Maximum concurrent transfers.
    pub max_clients: usize,
    /// Per-request timeout in milliseconds, unless the request sets its own.
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_clients: 100,
            timeout_ms: 20_000,
            user_agent: concat!("switchback/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// `[unit]`: unit-of-work wrapper settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitConfig {
    /// Argument that, when `"1"`, makes failures write their detail into
    /// the unit's output.
    pub debug_argument: String,
}

impl Default for UnitConfig {
    fn default() -> Self {
        UnitConfig {
            debug_argument: "admin_debug_mode".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_str(content: &str) -> Result<RuntimeConfig, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "scheduler.stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.scheduler.stack_size
            )));
        }
        if self.http.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "http.max_clients must be at least 1".to_string(),
            ));
        }
        if self.unit.debug_argument.is_empty() {
            return Err(ConfigError::Invalid(
                "unit.debug_argument must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
