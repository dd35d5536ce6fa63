use std::fmt;

/// Aggregated failures from a multi-step teardown. Every step's error is
/// collected; operations never stop early just because one step failed.
#[derive(Debug, Default)]
pub struct TeardownErrors(pub Vec<String>);

impl TeardownErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, context: impl Into<String>, err: impl fmt::Display) {
        self.0.push(format!("{}: {err}", context.into()));
    }

    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Teardown(self.0))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid sandbox state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("network index exhausted: {0}")]
    NetworkExhausted(String),

    #[error("named network namespace already exists: {0}")]
    NetnsExists(String),

    #[error("timed out waiting for control socket after {0:?}")]
    SocketTimeout(std::time::Duration),

    #[error("hypervisor control request failed: {0}")]
    HypervisorRequest(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("partial teardown failures: {}", .0.join("; "))]
    Teardown(Vec<String>),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
