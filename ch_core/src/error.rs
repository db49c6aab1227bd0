/// Core error type for cronhub
///
/// Background loops translate every variant into logs + metrics and keep
/// running; synchronous handlers fail fast and surface the variant to the
/// caller. `Fatal` marks invariant violations (e.g. re-terminating a task
/// that is already terminal) and must never be reachable in correctly
/// sequenced code.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Lock held: {0}")]
    LockHeld(String),

    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("Invariant violation: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a loop may treat this failure as transient and retry it on
    /// the next tick instead of surfacing it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::WorkerUnreachable(_) | Error::LockHeld(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Database("disk".into()).is_transient());
        assert!(Error::LockHeld("dispatch".into()).is_transient());
        assert!(Error::WorkerUnreachable("w1".into()).is_transient());
        assert!(!Error::NotFound("task".into()).is_transient());
        assert!(!Error::Fatal("regressed terminal state".into()).is_transient());
    }
}
