//! Error types for the scheduler module

use std::fmt;

use crate::storage::StorageError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Scheduler configuration error
    InvalidConfig { field: String, reason: String },

    /// Unknown IANA time zone name
    InvalidTimezone { tz: String },

    /// Metadata could not be loaded for a pass
    Metadata { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { field, reason } => {
                write!(f, "Scheduler config error in '{}': {}", field, reason)
            }
            Self::InvalidTimezone { tz } => {
                write!(f, "Invalid timezone: {}", tz)
            }
            Self::Metadata { reason } => {
                write!(f, "Metadata unavailable: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StorageError> for SchedulerError {
    fn from(err: StorageError) -> Self {
        Self::Metadata {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create a config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid timezone error
    pub fn invalid_timezone(tz: impl Into<String>) -> Self {
        Self::InvalidTimezone { tz: tz.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SchedulerError::invalid_config("tolerance", "must be below check interval");
        assert_eq!(
            err.to_string(),
            "Scheduler config error in 'tolerance': must be below check interval"
        );
        assert_eq!(
            SchedulerError::invalid_timezone("Mars/Olympus").to_string(),
            "Invalid timezone: Mars/Olympus"
        );
    }
}
