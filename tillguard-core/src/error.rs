//! Unified error handling system
//!
//! Structured error types with context, recovery suggestions, and proper error chaining

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type TillResult<T> = Result<T, TillError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Infrastructure-level error type shared by all tillguard crates
#[derive(Error, Debug)]
pub enum TillError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TillError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            TillError::Config { context, .. } => Some(context),
            TillError::Storage { context, .. } => Some(context),
            TillError::Timeout { context, .. } => Some(context),
            TillError::Io(_) | TillError::Serialization(_) => None,
        }
    }

    /// Only timeouts are worth retrying as-is
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TillError::Timeout { .. })
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        let error_id = self.context().map(|c| c.error_id.as_str());
        let suggestions = self
            .context()
            .map(|c| c.recovery_suggestions.join("; "))
            .unwrap_or_default();

        match self {
            TillError::Timeout { .. } => {
                warn!(
                    error_id = ?error_id,
                    error = %self,
                    "Timeout (may be recoverable)"
                );
            }
            TillError::Config { .. } => {
                error!(
                    error_id = ?error_id,
                    error = %self,
                    suggestions = %suggestions,
                    "Configuration error"
                );
            }
            _ => {
                error!(
                    error_id = ?error_id,
                    error = %self,
                    suggestions = %suggestions,
                    "Error occurred"
                );
            }
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr $(,)?) => {
        $crate::TillError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file")
                .with_suggestion("Run 'tillguard config --init' to create a default config"),
        }
    };
    ($msg:expr, $component:expr, $suggestion:expr $(,)?) => {
        $crate::TillError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component).with_suggestion($suggestion),
        }
    };
}

#[macro_export]
macro_rules! storage_error {
    ($msg:expr, $component:expr $(,)?) => {
        $crate::TillError::Storage {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component),
        }
    };
    ($msg:expr, $component:expr, $source:expr $(,)?) => {
        $crate::TillError::Storage {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check that the storage directory exists and is writable"),
        }
    };
}
