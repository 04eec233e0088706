//! Error types for task execution and the graph codec.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codec, the registry and task completions.
///
/// Encoding never produces an error; unrepresentable values become absent
/// fields instead. Messages posted after teardown are dropped silently.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Codec
    // ========================================================================
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Wire error: {0}")]
    Wire(#[from] serde_json::Error),

    // ========================================================================
    // Task context
    // ========================================================================
    #[error("Task context fault: {0}")]
    ContextFault(String),

    #[error("Failed to spawn task context: {0}")]
    Spawn(String),

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task #{index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Task completion was dropped before the task settled")]
    Aborted,

    // ========================================================================
    // Registry
    // ========================================================================
    #[error("Function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("Not callable: {0}")]
    NotCallable(String),

    #[error("Registry error: {0}")]
    Registry(String),

    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from replaying a malformed or oversized program.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Wire(_))
    }

    /// Whether the isolated context itself failed: a crash, a panic, a body
    /// error or a task name the context could not resolve.
    pub fn is_context_fault(&self) -> bool {
        matches!(
            self,
            Error::ContextFault(_) | Error::Spawn(_) | Error::UnknownTask(_)
        )
    }

    /// Strip coordinator wrapping and return the originating error.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Task { source, .. } = current {
            current = source;
        }
        current
    }
}
