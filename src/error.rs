use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid address")]
    InvalidAddr,
    #[error("operation does not apply to this element type")]
    InvalidType,
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
    #[error("element capacity exhausted")]
    Capacity,
    #[error("link content not found")]
    NotFound,
    #[error("corrupted segment image: {0}")]
    Corruption(&'static str),
    #[error("storage is not initialized")]
    NotInitialized,
    #[error("storage is already initialized")]
    AlreadyInitialized,
}
