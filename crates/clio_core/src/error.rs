//! Core error types for Clio.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
///
/// Errors are plain data so they can cross a transport inside a response
/// envelope and be rebuilt unchanged on the calling side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreError {
    /// No registration for this name is reachable
    UnknownFunction {
        /// Function name that was looked up
        name: String,
    },

    /// No transport factory exists for this protocol
    UnknownProtocol {
        /// Protocol identifier as requested
        protocol: String,
    },

    /// Transport failure (connect, closed channel, framing)
    Transport {
        /// What went wrong
        reason: String,
    },

    /// A user function or entry point failed
    Execution {
        /// Error message
        message: String,
    },

    /// Invalid encoding
    InvalidEncoding,

    /// Not found
    NotFound { kind: String, id: String },

    /// Validation error
    Validation { field: String, reason: String },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a transport failure
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Shorthand for an execution failure
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Shorthand for an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction { name } => write!(f, "Unknown function: {}", name),
            Self::UnknownProtocol { protocol } => write!(f, "Unknown protocol: {}", protocol),
            Self::Transport { reason } => write!(f, "Transport error: {}", reason),
            Self::Execution { message } => write!(f, "Execution failed: {}", message),
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidEncoding;
        assert_eq!(format!("{}", err), "Invalid encoding");

        let err = CoreError::NotFound {
            kind: "Module".to_string(),
            id: "main.clio".to_string(),
        };
        assert_eq!(format!("{}", err), "Module not found: main.clio");
    }

    #[test]
    fn test_unknown_function_display() {
        let err = CoreError::UnknownFunction {
            name: "fib".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown function: fib");
    }

    #[test]
    fn test_io_error_becomes_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Transport { .. }));
    }

    #[test]
    fn test_error_survives_json() {
        let err = CoreError::UnknownProtocol {
            protocol: "ws".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: CoreError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
