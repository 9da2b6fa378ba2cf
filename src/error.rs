use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{State, Trigger};

/// Reason codes surfaced to callers of the public job operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Reason {
    Create,
    Update,
    Delete,
    Execution,
}

impl Reason {
    /// Numeric code, stable across releases.
    pub fn code(&self) -> u32 {
        match self {
            Reason::Create => 1000,
            Reason::Update => 1001,
            Reason::Delete => 1002,
            Reason::Execution => 1004,
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Create => write!(f, "CREATE_EXCEPTION"),
            Reason::Update => write!(f, "UPDATE_EXCEPTION"),
            Reason::Delete => write!(f, "DELETE_EXCEPTION"),
            Reason::Execution => write!(f, "EXECUTION_EXCEPTION"),
        }
    }
}

/// Failure of a synchronous job operation (CRUD, parameter update, execution).
#[derive(Debug, Error)]
#[error("{reason} ({}): {message}", .reason.code())]
pub struct JobError {
    pub reason: Reason,
    pub message: String,
}

impl JobError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn create(message: impl Into<String>) -> Self {
        Self::new(Reason::Create, message)
    }

    pub fn update(message: impl Into<String>) -> Self {
        Self::new(Reason::Update, message)
    }

    pub fn delete(message: impl Into<String>) -> Self {
        Self::new(Reason::Delete, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(Reason::Execution, message)
    }

    pub fn not_found(reason: Reason, id: Uuid) -> Self {
        Self::new(reason, format!("job not found: {id}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("trigger {trigger} is not valid in state {state}")]
    Invalid { state: State, trigger: Trigger },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("no such parameter: {0}")]
    NotFound(String),

    #[error("parameter already exists: {0}")]
    Duplicate(String),
}

/// Raised by a module when it cannot even build its task.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module} is missing parameter {parameter}")]
    MissingParameter { module: String, parameter: String },

    #[error("module {module} failed: {message}")]
    Failed { module: String, message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("cannot open channel: {0}")]
    ChannelOpen(String),

    #[error("remote command failed: {0}")]
    Exec(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool queue is full")]
    Saturated,

    #[error("worker pool is shut down")]
    Shutdown,

    #[error("worker pool requires a running tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("state {0} cannot be bound to a module")]
    UnbindableState(State),

    #[error("unknown stage name: {0}")]
    UnknownStage(String),

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
