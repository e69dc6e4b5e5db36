//! Unified error handling for the hexsweep crate
//!
//! Domain errors stay usable on their own; [`Error`] wraps them when a
//! caller (the CLI, mostly) needs a single type.
//!
//! # Architecture
//!
//! - [`HexsweepErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use hexsweep::error::{Error, HexsweepErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Try again later ({}): {}", err.category(), err);
//!     } else {
//!         eprintln!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::processor::ProcessorError;
pub use crate::utils::error::{GridError, SearchError};

/// Common interface for all hexsweep errors
pub trait HexsweepErrorTrait: std::error::Error {
    /// Returns true if the operation might succeed on retry
    fn is_recoverable(&self) -> bool;

    /// Returns the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Search API and HTTP failures
    Network,
    /// Malformed cells or input lists
    Input,
    /// Quota admission denials
    Quota,
    /// Database and filesystem failures
    Storage,
    Config,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Input => "input",
            Self::Quota => "quota",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// Tile cache or import-log failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl HexsweepErrorTrait for SearchError {
    fn is_recoverable(&self) -> bool {
        SearchError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCell(_) => ErrorCategory::Input,
            _ => ErrorCategory::Network,
        }
    }
}

impl HexsweepErrorTrait for ProcessorError {
    fn is_recoverable(&self) -> bool {
        ProcessorError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyInput | Self::InvalidCell(_) => ErrorCategory::Input,
            Self::QuotaExceeded { .. } | Self::SubdivisionBatchTooLarge { .. } => ErrorCategory::Quota,
            Self::IllegalTransition { .. } | Self::UnknownCell(_) | Self::Relationship(_) => {
                ErrorCategory::Other
            }
        }
    }
}

impl HexsweepErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Search(e) => e.is_recoverable(),
            Self::Grid(_) => false,
            Self::Processor(e) => e.is_recoverable(),
            Self::Storage(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Search(e) => HexsweepErrorTrait::category(e),
            Self::Grid(_) => ErrorCategory::Input,
            Self::Processor(e) => HexsweepErrorTrait::category(e),
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Config,
        }
    }
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a store failure, keeping its context chain in the message
    pub fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

/// Result type alias using the unified Error
pub type Result<T> = std::result::Result<T, Error>;
