use thiserror::Error;

/// Errors surfaced while constructing or rewriting a program graph.
///
/// Graph-construction and invariant violations are fatal to the build and
/// propagate to the caller. [`GraphError::FusingRejected`] is recoverable:
/// optimization passes skip the offending candidate and continue.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("program does not contain primitive node: {0}")]
    UnknownId(String),

    #[error("graph invariant violated: {0}")]
    InvariantViolation(String),

    #[error("incompatible layouts, error occurred for {node} node: {details}")]
    IncompatibleLayout { node: String, details: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fusing rejected for {node}: {reason}")]
    FusingRejected { node: String, reason: String },

    #[error("no implementation available for {node} ({kind})")]
    NoImplementation { node: String, kind: String },

    #[error("engine error for {node}: {details}")]
    Engine { node: String, details: String },
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        GraphError::InvariantViolation(msg.into())
    }

    /// Whether a pass may swallow this error and move on to the next candidate.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GraphError::FusingRejected { .. })
    }
}
