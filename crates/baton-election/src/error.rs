//! Error types for the election crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Race primitive error: {0}")]
    Race(String),

    #[error("Redis operation error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Already joined the election")]
    AlreadyJoined,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ElectionError {
    fn from(e: redis::RedisError) -> Self {
        ElectionError::Redis(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ElectionError>;
