//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-related errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queued directory is at capacity.
    #[error("queue is full: {queue} holds {len} messages (limit {limit})")]
    QueueFull {
        queue: String,
        len: usize,
        limit: usize,
    },

    /// The payload exceeds the configured size bound.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: u64, limit: u64 },

    /// A message file name does not match the `<timestamp>[.<flag>]*` grammar.
    #[error("malformed message file name: {0}")]
    MalformedName(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Handler execution failed.
    #[error("handler execution failed: {0}")]
    ExecutionFailed(String),
}

impl QueueError {
    /// Returns true if the same operation may succeed when retried.
    ///
    /// Workers consult this on handler errors: a retryable error re-enters
    /// the queue as `error`, a non-retryable one is routed as `dead` without
    /// consuming the remaining retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::QueueFull { .. } | QueueError::Io(_) | QueueError::ExecutionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_is_retryable() {
        let err = QueueError::QueueFull {
            queue: "jobs".into(),
            len: 10,
            limit: 10,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_too_large_is_not_retryable() {
        let err = QueueError::MessageTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_name_is_not_retryable() {
        let err = QueueError::MalformedName("not-a-timestamp".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display_queue_full() {
        let err = QueueError::QueueFull {
            queue: "jobs".into(),
            len: 3,
            limit: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("jobs") && msg.contains("3"));
    }

    #[test]
    fn test_display_too_large() {
        let err = QueueError::MessageTooLarge {
            size: 2048,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048") && msg.contains("1024"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = QueueError::from(io);
        assert!(matches!(err, QueueError::Io(_)));
    }
}
