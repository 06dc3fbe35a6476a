//! Error types for Flotilla.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    // Routing errors
    #[error("No capable agent for capability '{capability}': {reason}")]
    NoCapableAgent { capability: String, reason: String },

    #[error("No capacity for capability '{capability}': all capable agents are saturated")]
    NoCapacity { capability: String },

    // Execution errors
    #[error("Transport error on attempt {attempt}: {message}")]
    Transport { attempt: u32, message: String },

    #[error("Attempt {attempt} timed out after {timeout_ms}ms")]
    Timeout { attempt: u32, timeout_ms: u64 },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    // Registry errors
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {id} has {in_flight} in-flight dispatches")]
    AgentBusy { id: String, in_flight: usize },

    #[error("Invalid agent descriptor: {0}")]
    InvalidDescriptor(String),

    // Task and workflow errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the execution layer may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Attempt number recorded on execution errors.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Error::Transport { attempt, .. } | Error::Timeout { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
