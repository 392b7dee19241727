//! Persistence layer error types

use thiserror::Error;

use crate::strategy::{ReadError, WriteError};

/// Persistence layer errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store tier error: {0}")]
    Store(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ReadError> for PersistenceError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Store(e) => Self::Store(e.to_string()),
        }
    }
}

impl From<WriteError> for PersistenceError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Store(e) => Self::Store(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
