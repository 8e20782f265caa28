//! Error types for TinyVecDB

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TinyVecError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Header corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid update item at index {0}: neither vector nor metadata provided")]
    InvalidUpdateItem(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, TinyVecError>;
