//! Error types for geostage
//!
//! This module provides user-friendly error types with actionable messages
//! that help diagnose and resolve ingestion issues.

use thiserror::Error;

/// Result type alias for geostage operations
pub type Result<T> = std::result::Result<T, GeostageError>;

/// Main error type for geostage
///
/// All errors include contextual information to help users understand
/// what went wrong and how to fix it.
#[derive(Error, Debug)]
pub enum GeostageError {
    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {message}. {suggestion}")]
    Config { message: String, suggestion: String },

    /// A source record in the inventory failed validation
    #[error("Source '{source_name}' is invalid: {reason}")]
    SourceValidation { source_name: String, reason: String },

    /// Network request failed
    #[error("Network request to '{url}' failed: {reason}")]
    Network { url: String, reason: String },

    /// A downloaded artifact failed format validation during staging
    #[error("Staging validation failed for '{artifact}': {reason}")]
    StagingValidation { artifact: String, reason: String },

    /// Failed to parse input data
    #[error("Failed to parse {data_type}: {reason}")]
    Parse { data_type: String, reason: String },

    /// The run was cancelled before this operation completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected error with details
    #[error("Unexpected error: {message}")]
    Unknown { message: String },
}

impl GeostageError {
    /// Create a configuration error with suggestion
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a source validation error
    pub fn source_validation(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceValidation {
            source_name: source.into(),
            reason: reason.into(),
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a staging validation error
    pub fn staging_validation(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StagingValidation {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(data_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            data_type: data_type.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// True when the error is the cancellation sentinel
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
