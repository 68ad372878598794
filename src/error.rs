// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the engine:
// - Clear error categorization
// - Recovery hints for the collection loop
// - Per-source causes preserved on total collection failure
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::EventOrigin;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Vigil engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum VigilError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Collection Errors ----
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            VigilError::Config(_) => false,
            VigilError::Collector(e) => e.is_recoverable(),
            VigilError::Collection(_) => true,
            VigilError::Io(_) => true,
            VigilError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            VigilError::Config(_) => "config",
            VigilError::Collector(_) => "collector",
            VigilError::Collection(_) => "collection",
            VigilError::Io(_) => "io",
            VigilError::Internal(_) => "internal",
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with backoff
    RetryWithBackoff,
    /// Reconnect to the service
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Rule table is inconsistent: {message}")]
    InvalidRules { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Collector Errors
// ----------------------------------------------------------------------------

/// Errors from a single acquisition channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Collection failed for '{channel}': {message}")]
    CollectionFailed { channel: String, message: String },

    #[error("Connection to '{endpoint}' failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Authentication failed for '{service}': {message}")]
    AuthenticationFailed { service: String, message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Invalid response from '{channel}': {message}")]
    InvalidResponse { channel: String, message: String },

    #[error("Collector '{name}' is disabled")]
    Disabled { name: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::Disabled { .. } => false,
            CollectorError::AuthenticationFailed { .. } => false,
            _ => true,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CollectorError::ConnectionFailed { .. } => RecoveryHint::Reconnect,
            CollectorError::Timeout { .. } => RecoveryHint::RetryWithBackoff,
            CollectorError::InvalidResponse { .. } => RecoveryHint::Skip,
            CollectorError::AuthenticationFailed { .. } => RecoveryHint::FixConfiguration,
            CollectorError::CollectionFailed { .. } => RecoveryHint::RetryWithBackoff,
            CollectorError::Disabled { .. } => RecoveryHint::None,
        }
    }

    pub fn collection_failed(channel: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(channel: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::InvalidResponse {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        CollectorError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// Collection Errors
// ----------------------------------------------------------------------------

/// One failed source and the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub origin: EventOrigin,
    pub error: CollectorError,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.error)
    }
}

/// Terminal outcome of a collection cycle in which no source delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("All {} enabled sources failed: {}", .failures.len(), join_failures(.failures))]
    AllSourcesFailed { failures: Vec<SourceFailure> },
}

impl CollectionError {
    /// The per-source causes behind this failure.
    pub fn failures(&self) -> &[SourceFailure] {
        match self {
            CollectionError::AllSourcesFailed { failures } => failures,
        }
    }
}

fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ----------------------------------------------------------------------------
// Normalization Errors
// ----------------------------------------------------------------------------

/// A single raw record that could not be turned into an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("Unparsable timestamp '{value}'")]
    BadTimestamp { value: String },

    #[error("Malformed line: {reason}")]
    MalformedLine { reason: String },

    #[error("Unexpected record shape: {reason}")]
    UnexpectedShape { reason: String },
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine operations
pub type VigilResult<T> = Result<T, VigilError>;

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_error_recoverability() {
        assert!(CollectorError::timeout("poll", 30_000).is_recoverable());
        assert!(!CollectorError::Disabled { name: "shell".into() }.is_recoverable());
        assert_eq!(
            CollectorError::connection_failed("wss://ctl", "refused").recovery_hint(),
            RecoveryHint::Reconnect
        );
    }

    #[test]
    fn test_all_sources_failed_message_lists_each_cause() {
        let err = CollectionError::AllSourcesFailed {
            failures: vec![
                SourceFailure {
                    origin: EventOrigin::Api,
                    error: CollectorError::timeout("get_events", 30_000),
                },
                SourceFailure {
                    origin: EventOrigin::Shell,
                    error: CollectorError::collection_failed("ssh", "exit status 255"),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("All 2 enabled sources failed"));
        assert!(text.contains("api: Timeout"));
        assert!(text.contains("shell: Collection failed"));
        assert_eq!(err.failures().len(), 2);

        let top: VigilError = err.into();
        assert_eq!(top.category(), "collection");
        assert!(top.is_recoverable());
    }
}
