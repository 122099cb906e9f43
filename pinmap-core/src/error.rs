//! src/error.rs
//! ============================================================================
//! # `AppError`: Unified Error Type for the Coordination Runtime
//!
//! Every fallible operation in the crate reports through this enum. Variants
//! mirror the places a user can act on a failure: field validation, the
//! persistence and attachment collaborators, and dependency wiring.

use std::{io, path::PathBuf, time::Duration};

use compact_str::CompactString;
use thiserror::Error;

use crate::model::record::FieldError;

/// Unified error type for registry, cache and dispatcher operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Standard IO error, auto-converted from `io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// One or more form fields failed validation.
    #[error("Validation failed for {} field(s)", errors.len())]
    Validation { errors: Vec<FieldError> },

    /// Create, update or delete was rejected by the record store.
    #[error("Persistence '{operation}' failed: {reason}")]
    Persistence {
        operation: &'static str, // "create", "update", "delete"
        reason: String,
    },

    /// Attachment batch could not be uploaded for a saved record.
    #[error("Attachment upload for record '{owner}' failed: {reason}")]
    AttachmentUpload {
        owner: CompactString,
        reason: String,
    },

    /// Required components did not become ready in time.
    #[error("Timed out after {timeout:?} waiting for components: {}", names.join(", "))]
    DependencyTimeout {
        names: Vec<CompactString>,
        timeout: Duration,
    },

    /// A registered component exists but has an unexpected type.
    #[error("Component '{name}' is registered with an unexpected type")]
    ComponentType { name: CompactString },

    /// Element attributes could not be turned into an action.
    #[error("Invalid action attribute {attribute}: {reason}")]
    InvalidAction {
        attribute: &'static str,
        reason: String,
    },

    /// Response cache error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// TOML config parsing error.
    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// Config values that parse but cannot work together.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Config file I/O error with path.
    #[error("Failed to read config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Serialization or deserialization error (e.g., JSON).
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Any other error, with description.
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl AppError {
    #[must_use]
    /// Attach extra context to an error.
    pub fn with_context<S: Into<String>>(self, ctx: S) -> Self {
        Self::Other(format!("{}: {}", ctx.into(), self))
    }

    /// Create a persistence failure from any collaborator error
    pub fn persistence(operation: &'static str, source: &anyhow::Error) -> Self {
        Self::Persistence {
            operation,
            reason: format!("{source:#}"),
        }
    }

    /// Create an attachment upload failure
    pub fn attachment_upload<S: Into<CompactString>>(owner: S, source: &anyhow::Error) -> Self {
        Self::AttachmentUpload {
            owner: owner.into(),
            reason: format!("{source:#}"),
        }
    }

    /// Create an invalid action error
    pub fn invalid_action<S: Into<String>>(attribute: &'static str, reason: S) -> Self {
        Self::InvalidAction {
            attribute,
            reason: reason.into(),
        }
    }

    /// Whether the user can fix this by correcting input and resubmitting.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::AttachmentUpload { .. } | Self::DependencyTimeout { .. }
        )
    }

    /// Short message suitable for a toast. Internal details stay in the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { errors } => match errors.as_slice() {
                [only] => format!("Please fix the {} field", only.field),
                _ => format!("Please fix the {} highlighted fields", errors.len()),
            },
            Self::Persistence { operation, .. } => {
                format!("Could not {operation} the location. Please try again.")
            }
            Self::AttachmentUpload { .. } => {
                "Location saved, but some photos could not be uploaded".to_string()
            }
            Self::DependencyTimeout { .. } => {
                "The page is still loading. Please try again in a moment.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_details() {
        let err = AppError::persistence("create", &anyhow::anyhow!("HTTP 500 from /api"));
        assert_eq!(
            err.user_message(),
            "Could not create the location. Please try again."
        );
        assert!(err.to_string().contains("HTTP 500"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_validation_message_counts_fields() {
        let err = AppError::Validation {
            errors: vec![
                FieldError::new("name", "is required"),
                FieldError::new("lat", "out of range"),
            ],
        };
        assert!(err.is_recoverable());
        assert_eq!(err.user_message(), "Please fix the 2 highlighted fields");
    }

    #[test]
    fn test_with_context() {
        let err = AppError::Cache("boom".into()).with_context("sweep");
        assert_eq!(err.to_string(), "Unexpected error: sweep: Cache error: boom");
    }
}
