// Worker protocol: line-delimited JSON, one message per line, both
// directions. Both sides reject lines exceeding the configured limit.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default per-line limit (1 MiB).
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 1024 * 1024;

/// Priority classes, served strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Batch,
}

impl Priority {
    pub const COUNT: usize = 5;

    /// Queue index; lower serves first.
    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Batch => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

fn default_max_concurrent() -> u32 {
    1
}

/// Capability set a worker advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub tools: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            languages: Vec::new(),
            max_concurrent: 1,
        }
    }
}

/// Optional resource hints reported alongside capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
}

/// Structured error carried in a worker's `error` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkerErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Coordinator-to-worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Execute {
        id: String,
        tool: String,
        params: Value,
        timeout_ms: u64,
        priority: Priority,
    },
    Ping {
        id: String,
        timestamp: i64,
    },
    Shutdown {
        graceful: bool,
        timeout_ms: u64,
    },
}

impl WorkerRequest {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkerRequest::Execute { id, .. } => Some(id),
            WorkerRequest::Ping { id, .. } => Some(id),
            WorkerRequest::Shutdown { .. } => None,
        }
    }
}

/// Worker-to-coordinator messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    Register {
        capabilities: WorkerCapabilities,
        #[serde(default)]
        resources: WorkerResources,
    },
    Success {
        id: String,
        result: Value,
    },
    Error {
        id: String,
        error: WorkerErrorBody,
    },
    Pong {
        id: String,
        timestamp: i64,
    },
}

impl WorkerReply {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkerReply::Register { .. } => None,
            WorkerReply::Success { id, .. } => Some(id),
            WorkerReply::Error { id, .. } => Some(id),
            WorkerReply::Pong { id, .. } => Some(id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of {len} chars exceeds the {max} char limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

/// Serialize one protocol message to a single line (without the trailing
/// newline), enforcing the line limit.
pub fn encode_line<T: Serialize>(message: &T, max_chars: usize) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message).map_err(|e| ProtocolError::Serialization {
        message: e.to_string(),
    })?;
    if line.len() > max_chars {
        return Err(ProtocolError::MessageTooLarge {
            len: line.len(),
            max: max_chars,
        });
    }
    Ok(line)
}

/// Parse one protocol line, enforcing the line limit.
pub fn decode_line<T: DeserializeOwned>(line: &str, max_chars: usize) -> Result<T, ProtocolError> {
    if line.len() > max_chars {
        return Err(ProtocolError::MessageTooLarge {
            len: line.len(),
            max: max_chars,
        });
    }
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Serialization {
        message: e.to_string(),
    })
}
