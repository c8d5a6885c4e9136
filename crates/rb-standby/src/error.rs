//! Error types for the standby module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("Lock provider connection error: {0}")]
    Connection(String),

    #[error("Lock provider operation error: {0}")]
    Provider(#[from] redis::RedisError),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StandbyError>;
