//! Environment-driven runtime configuration.
//!
//! Every knob reads a `TOOLSMITH_*` variable with a sensible default;
//! unparseable values log a warning and fall back rather than aborting.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// In-memory database sentinel accepted for `TOOLSMITH_DB_PATH`.
pub const IN_MEMORY_DB: &str = ":memory:";

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// SQLite database path, or `:memory:`
    pub db_path: String,
    /// Tool-name allowlist globs; empty means allow all
    pub tool_allowlist: Vec<String>,
    /// Tool-name denylist globs; checked after the allowlist
    pub tool_denylist: Vec<String>,
    /// Global tool-call budget per minute, if any
    pub rate_limit_per_minute: Option<u32>,
    /// Per-tool budgets per minute
    pub tool_rate_limits: HashMap<String, u32>,
    /// Refuse to start if the integrity chain fails verification at boot
    pub strict_integrity: bool,
    /// Coordinator queue bound (queued + in-flight)
    pub max_queue_size: usize,
    /// Maximum characters per protocol line, both directions
    pub max_message_chars: usize,
    /// Health-check ping interval in milliseconds
    pub health_check_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: IN_MEMORY_DB.to_string(),
            tool_allowlist: Vec::new(),
            tool_denylist: Vec::new(),
            rate_limit_per_minute: None,
            tool_rate_limits: HashMap::new(),
            strict_integrity: false,
            max_queue_size: 1000,
            max_message_chars: 1024 * 1024,
            health_check_interval_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from `TOOLSMITH_*` environment variables.
    ///
    /// Unparseable numeric values warn and fall back to the default;
    /// a configuration that is outright unusable (empty database path,
    /// zero bounds) is a startup error.
    pub fn from_env() -> CoreResult<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            db_path: env::var("TOOLSMITH_DB_PATH").unwrap_or(defaults.db_path),
            tool_allowlist: read_list("TOOLSMITH_TOOL_ALLOWLIST"),
            tool_denylist: read_list("TOOLSMITH_TOOL_DENYLIST"),
            rate_limit_per_minute: read_parsed("TOOLSMITH_RATE_LIMIT_PER_MINUTE"),
            tool_rate_limits: read_tool_limits("TOOLSMITH_TOOL_RATE_LIMITS"),
            strict_integrity: read_parsed("TOOLSMITH_STRICT_INTEGRITY")
                .unwrap_or(defaults.strict_integrity),
            max_queue_size: read_parsed("TOOLSMITH_MAX_QUEUE_SIZE")
                .unwrap_or(defaults.max_queue_size),
            max_message_chars: read_parsed("TOOLSMITH_MAX_MESSAGE_CHARS")
                .unwrap_or(defaults.max_message_chars),
            health_check_interval_ms: read_parsed("TOOLSMITH_HEALTH_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.health_check_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.db_path.is_empty() {
            return Err(CoreError::ConfigurationError {
                message: "TOOLSMITH_DB_PATH must not be empty (use :memory: for an in-memory store)"
                    .to_string(),
            });
        }
        if self.max_queue_size == 0 {
            return Err(CoreError::ValidationError {
                message: "TOOLSMITH_MAX_QUEUE_SIZE must be greater than zero".to_string(),
            });
        }
        if self.max_message_chars == 0 {
            return Err(CoreError::ValidationError {
                message: "TOOLSMITH_MAX_MESSAGE_CHARS must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == IN_MEMORY_DB
    }
}

fn read_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn read_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = %raw, "unparseable environment value, using default");
                None
            }
        },
        Err(_) => None,
    }
}

/// Parse `tool=limit` pairs, e.g. `parse=30,analyze.graph=5`.
fn read_tool_limits(key: &str) -> HashMap<String, u32> {
    let mut limits = HashMap::new();
    if let Ok(raw) = env::var(key) {
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((tool, limit)) => match limit.trim().parse() {
                    Ok(n) => {
                        limits.insert(tool.trim().to_string(), n);
                    }
                    Err(_) => warn!(key, pair, "unparseable per-tool rate limit, skipping"),
                },
                None => warn!(key, pair, "malformed per-tool rate limit, expected tool=n"),
            }
        }
    }
    limits
}
