use std::time::Duration;

use thiserror::Error;

use crate::unit::UnitId;

#[derive(Error, Debug)]
pub enum Error {
    /// A unit was handed a second task. Surfacing this to a caller is a bug in
    /// the dispatch logic.
    #[error("Execution unit {0} is already busy")]
    AlreadyBusy(UnitId),

    #[error("Queue is full: at most {limit} tasks may wait for a unit")]
    QueueOverflow { limit: usize },

    #[error("Task timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Execution unit was terminated")]
    Terminated,

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Pool has been shut down")]
    PoolShutdown,

    #[error("No handler registered for task kind `{0}`")]
    UnknownKind(String),

    #[error("Task handler failed: {0}")]
    Handler(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Failed to spawn execution unit: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Pool must be started inside a Tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl Error {
    /// Flatten a handler error into a message, keeping the whole context chain.
    pub(crate) fn handler(err: anyhow::Error) -> Self {
        Self::Handler(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::QueueOverflow { limit: 8 };
        assert_eq!(
            error.to_string(),
            "Queue is full: at most 8 tasks may wait for a unit"
        );

        let error = Error::Timeout(Duration::from_millis(1500));
        assert_eq!(error.to_string(), "Task timed out after 1500 ms");

        let error = Error::UnknownKind("resize".into());
        assert_eq!(
            error.to_string(),
            "No handler registered for task kind `resize`"
        );

        let error = Error::AlreadyBusy(UnitId::from(3));
        assert_eq!(error.to_string(), "Execution unit unit-3 is already busy");

        let error = Error::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "test"));
        assert_eq!(error.to_string(), "Failed to spawn execution unit: test");
    }

    #[test]
    fn test_handler_error_keeps_context() {
        let err = anyhow::anyhow!("missing field `text`").context("parse_json payload");
        let error = Error::handler(err);
        assert_eq!(
            error.to_string(),
            "Task handler failed: parse_json payload: missing field `text`"
        );
    }
}
