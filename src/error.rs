//! Unified error handling for the postrelay crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`RelayErrorTrait`] - Common interface implemented by the crate errors
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use postrelay::error::{Error, RelayErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), error = %err, "Will retry");
//!     } else {
//!         tracing::error!(error = %err, "Giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::compose::ComposeError;
pub use crate::models::ModelError;
pub use crate::publisher::PublishError;
pub use crate::resolver::ResolveError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StorageError;
pub use crate::transport::TransportError;

/// Common trait for postrelay error types
pub trait RelayErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport, gateway and resolution errors
    Network,
    /// Source content that cannot be published
    Content,
    /// Database and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Scheduler and timing errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Content => "content",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the postrelay crate
#[derive(Error, Debug)]
pub enum Error {
    /// Transport session errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Content composition errors
    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    /// Publish path errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Database errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Invalid model values
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RelayErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Resolve(e) => e.is_transient(),
            Self::Compose(_) => false,
            Self::Publish(e) => e.is_retryable(),
            Self::Storage(StorageError::Pool(_)) => true,
            Self::Storage(_) => false,
            Self::Scheduler(SchedulerError::Metadata { .. }) => true,
            Self::Scheduler(_) => false,
            Self::Model(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Resolve(_) => ErrorCategory::Network,
            Self::Compose(_) | Self::Model(_) | Self::Json(_) => ErrorCategory::Content,
            Self::Publish(e) => match e {
                PublishError::Compose(_) => ErrorCategory::Content,
                PublishError::Storage(_) => ErrorCategory::Storage,
                PublishError::TaskMissing { .. }
                | PublishError::TaskInactive { .. }
                | PublishError::ChannelMissing { .. } => ErrorCategory::Config,
                PublishError::Panicked { .. } => ErrorCategory::Other,
                _ => ErrorCategory::Network,
            },
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_follow_transience() {
        let err: Error = TransportError::RateLimited { seconds: 4 }.into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Network);

        let err: Error = TransportError::Unauthorized("revoked".into()).into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_publish_error_categories() {
        let err: Error = PublishError::Compose(ComposeError::NoPosts).into();
        assert_eq!(err.category(), ErrorCategory::Content);
        assert!(!err.is_recoverable());

        let err: Error = PublishError::ChannelMissing {
            task_id: 1,
            channel_id: 2,
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_config_and_other() {
        let err = Error::config("bad timezone");
        assert_eq!(err.to_string(), "Config error: bad timezone");
        assert_eq!(err.category().as_str(), "config");

        let err = Error::with_source("loading", io::Error::other("disk"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
