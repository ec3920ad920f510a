//! Error types

use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid price: {0:?}")]
    InvalidPrice(String),

    #[error("Price out of supported range: {0:?}")]
    PriceOutOfRange(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Reasons a price source stopped streaming
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Source {source_name} disconnected: {reason}")]
    Disconnected { source_name: String, reason: String },

    #[error("Source {source_name} stopped after {uptime_secs}s of uptime")]
    UptimeExceeded { source_name: String, uptime_secs: u64 },

    #[error("Worker for {source_name} aborted: {reason}")]
    Aborted { source_name: String, reason: String },

    #[error("Source {0} cancelled")]
    Cancelled(String),
}

impl SourceError {
    /// Name of the source that reported the error
    pub fn source_name(&self) -> &str {
        match self {
            SourceError::Disconnected { source_name, .. }
            | SourceError::UptimeExceeded { source_name, .. }
            | SourceError::Aborted { source_name, .. } => source_name,
            SourceError::Cancelled(source_name) => source_name,
        }
    }
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_name() {
        let err = SourceError::UptimeExceeded {
            source_name: "provider_7".to_string(),
            uptime_secs: 180,
        };
        assert_eq!(err.source_name(), "provider_7");
        assert_eq!(err.to_string(), "Source provider_7 stopped after 180s of uptime");

        let err = SourceError::Cancelled("provider_1".to_string());
        assert_eq!(err.source_name(), "provider_1");
    }
}
