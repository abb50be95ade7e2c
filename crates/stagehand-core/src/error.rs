use thiserror::Error;

/// Core error type for the Stagehand engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed trigger or missing required scope fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-concurrency write lost against a competing transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bus publish failure
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Malformed persisted record
    #[error("Decode error: {0}")]
    Decode(String),

    /// No completion report within the configured budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transition not defined for the current sequence state
    #[error("Invalid state transition: {0}")]
    StateTransition(String),

    /// Execution store error
    #[error("State store error: {0}")]
    StateStore(String),

    /// Sequence execution not found
    #[error("Sequence execution not found: {0}")]
    ExecutionNotFound(String),

    /// Sequence definition not found
    #[error("Sequence definition not found: {0}")]
    DefinitionNotFound(String),

    /// Timer service error
    #[error("Timer error: {0}")]
    Timer(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    Io(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
