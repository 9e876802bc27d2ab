//! Error types for declaring, planning and converging resource graphs.
//!
//! Errors are split by who raised them: the program that declared the
//! graph, the provider that materializes resources, or the backend that
//! records state. Provider errors carry a category so the reconciler knows
//! which failures are worth retrying.

use crate::types::NodeFailure;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Declaration Errors
// ============================================================================

/// Raised while a stack is being declared, before any provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclarationError {
    /// Two resources share a logical name
    #[error("resource '{0}' is already declared")]
    DuplicateName(String),

    /// An input references a resource that was never declared
    #[error("'{dependent}' references undeclared resource '{missing}'")]
    DanglingReference {
        /// Resource holding the reference
        dependent: String,
        /// Name that could not be found
        missing: String,
    },

    /// A reference would close a loop in the graph
    #[error("dependency cycle: {}", path.join(" -> "))]
    CyclicDependency {
        /// Names along the cycle, first and last are the same node
        path: Vec<String>,
    },

    /// An input failed schema validation
    #[error("invalid input '{field}' on '{resource}': {reason}")]
    InvalidInput {
        resource: String,
        field: String,
        reason: String,
    },

    /// An output field that the resource kind does not produce
    #[error("resource '{resource}' ({kind}) has no output '{field}'")]
    UnknownOutput {
        resource: String,
        kind: String,
        field: String,
    },

    /// Two exports share a name
    #[error("export '{0}' is already defined")]
    DuplicateExport(String),
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Categories of provider failures for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Timeouts, dropped connections, 5xx responses
    Transient,
    /// Rate limited by the provider API
    Throttled,
    /// The addressed resource does not exist
    NotFound,
    /// The request conflicts with existing remote state
    Conflict,
    /// Validation, authorization and everything else that will not heal
    Permanent,
}

impl ErrorCategory {
    /// Whether this category is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Throttled)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "transient provider failure",
            Self::Throttled => "provider throttled the request",
            Self::NotFound => "resource not found",
            Self::Conflict => "conflicting remote state",
            Self::Permanent => "provider rejected the request",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Failure reported by a [`Provider`](crate::provider::Provider) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct ProviderError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ProviderError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Throttled, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, message)
    }

    /// Whether the failed call should be attempted again.
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

// ============================================================================
// State Errors
// ============================================================================

/// Failure loading or saving recorded state. Always fatal for a run.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize state: {0}")]
    Serialize(String),

    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Engine Errors
// ============================================================================

/// Errors that abort an engine operation as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    State(#[from] StateError),

    /// Preview could not evaluate some resources
    #[error("preview failed for {} resource(s): {}", failures.len(), summarize(failures))]
    Plan { failures: Vec<NodeFailure> },
}

fn summarize(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.name, f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Throttled.is_retryable());
        assert!(!ErrorCategory::NotFound.is_retryable());
        assert!(!ErrorCategory::Conflict.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::throttled("slow down");
        assert_eq!(err.to_string(), "provider throttled the request: slow down");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cycle_display() {
        let err = DeclarationError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
