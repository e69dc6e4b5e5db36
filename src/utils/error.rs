//! Error types for the search and grid layers
//!
//! This module defines the leaf error types used by the grid helpers and the
//! external search client.

use thiserror::Error;

/// Errors that can occur while talking to the external search API
#[derive(Error, Debug)]
pub enum SearchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limit exceeded (HTTP 429)
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Server error with status code
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Request rejected with a client error status
    #[error("Request rejected with status {0}")]
    ClientError(u16),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Response body could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// The cell key could not be resolved into search coordinates
    #[error("Invalid cell: {0}")]
    InvalidCell(#[from] GridError),
}

impl SearchError {
    /// Check if the failure is transient and worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimit | Self::ServerError(_) | Self::Timeout => true,
            Self::ClientError(_) | Self::Decode(_) | Self::InvalidCell(_) => false,
        }
    }
}

/// Errors raised by grid-cell helpers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// The key is not a valid hexagonal cell index
    #[error("Invalid cell identifier: {0:?}")]
    InvalidCell(String),

    /// Resolution outside of the supported range
    #[error("Invalid resolution: {0}")]
    InvalidResolution(u8),

    /// The cell is not at the resolution the caller claimed
    #[error("Cell {cell} is at resolution {actual}, expected {expected}")]
    ResolutionMismatch {
        cell: String,
        expected: u8,
        actual: u8,
    },

    /// Subdivision target is not finer than the source
    #[error("Cannot split from resolution {from} to {to}: target must be finer")]
    NotFiner { from: u8, to: u8 },
}
