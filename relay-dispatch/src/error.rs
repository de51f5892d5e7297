use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
        {
            Self::Unavailable(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

/// Failures that drop a single inbound request before it reaches the queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("admission check failed: {0}")]
    Admission(#[source] StoreError),

    #[error("active set update failed: {0}")]
    ActiveSet(#[source] StoreError),
}
