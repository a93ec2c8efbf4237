// Policy gate ahead of tool dispatch: allow/deny globs plus token-bucket
// rate limits. The gate is an interface; callers may swap in their own.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use toolsmith_core::RuntimeConfig;

use crate::ServerError;

/// Why a call was refused at the boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyViolation {
    #[error("tool {tool:?} is not permitted by policy")]
    Denied { tool: String },

    #[error("rate limit exceeded for {scope}")]
    RateLimited { scope: String },
}

impl PolicyViolation {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyViolation::Denied { .. } => "TOOL_DENIED",
            PolicyViolation::RateLimited { .. } => "RATE_LIMITED",
        }
    }
}

/// Boundary check applied to every `tools/call`.
pub trait PolicyGate: Send + Sync {
    fn check(&self, tool: &str) -> Result<(), PolicyViolation>;
}

/// Gate that admits everything; useful for tests and embedded use.
pub struct AllowAllGate;

impl PolicyGate for AllowAllGate {
    fn check(&self, _tool: &str) -> Result<(), PolicyViolation> {
        Ok(())
    }
}

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    /// Tokens per second
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn per_minute(limit: u32) -> Self {
        let capacity = limit.max(1) as f64;
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: capacity / 60.0,
            capacity,
        }
    }

    fn consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }
}

/// Gate assembled from the environment configuration: optional allowlist
/// and denylist globs, a global per-minute budget, and per-tool budgets.
pub struct ConfigPolicyGate {
    allow: Option<GlobSet>,
    deny: Option<GlobSet>,
    global: Option<Mutex<TokenBucket>>,
    tool_limits: HashMap<String, u32>,
    tool_buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl ConfigPolicyGate {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ServerError> {
        Ok(Self {
            allow: build_globset(&config.tool_allowlist)?,
            deny: build_globset(&config.tool_denylist)?,
            global: config
                .rate_limit_per_minute
                .map(|limit| Mutex::new(TokenBucket::per_minute(limit))),
            tool_limits: config.tool_rate_limits.clone(),
            tool_buckets: Mutex::new(HashMap::new()),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, ServerError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ServerError::Startup {
            message: format!("bad tool glob {pattern:?}: {e}"),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| ServerError::Startup {
        message: format!("could not build tool glob set: {e}"),
    })?;
    Ok(Some(set))
}

impl PolicyGate for ConfigPolicyGate {
    fn check(&self, tool: &str) -> Result<(), PolicyViolation> {
        if let Some(allow) = &self.allow {
            if !allow.is_match(tool) {
                debug!(tool, "tool not on the allowlist");
                return Err(PolicyViolation::Denied {
                    tool: tool.to_string(),
                });
            }
        }
        if let Some(deny) = &self.deny {
            if deny.is_match(tool) {
                debug!(tool, "tool on the denylist");
                return Err(PolicyViolation::Denied {
                    tool: tool.to_string(),
                });
            }
        }

        if let Some(global) = &self.global {
            let mut bucket = global.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !bucket.consume() {
                return Err(PolicyViolation::RateLimited {
                    scope: "global".to_string(),
                });
            }
        }
        if let Some(limit) = self.tool_limits.get(tool) {
            let mut buckets = self
                .tool_buckets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let bucket = buckets
                .entry(tool.to_string())
                .or_insert_with(|| TokenBucket::per_minute(*limit));
            if !bucket.consume() {
                return Err(PolicyViolation::RateLimited {
                    scope: format!("tool {tool}"),
                });
            }
        }
        Ok(())
    }
}
