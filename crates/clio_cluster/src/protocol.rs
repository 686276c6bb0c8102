//! Request and response envelopes exchanged over every transport.

use clio_core::{CoreError, CoreResult, RequestId, Value};
use serde::{Deserialize, Serialize};

/// What a request asks the other side to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// Invoke a registered function by name
    Call {
        /// Registered name
        name: String,
        /// Call arguments
        args: Vec<Value>,
    },
    /// List registered names starting with a path prefix
    List {
        /// Name prefix
        path: String,
    },
}

/// Remote request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Correlation id
    pub request_id: RequestId,
    /// Request body
    pub kind: RequestKind,
}

impl RemoteRequest {
    /// Build a call request
    #[must_use]
    pub fn call(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            request_id: RequestId::new(),
            kind: RequestKind::Call {
                name: name.into(),
                args,
            },
        }
    }

    /// Build a listing request
    #[must_use]
    pub fn list(path: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            kind: RequestKind::List { path: path.into() },
        }
    }
}

/// Outcome carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    /// Return value of a call
    Value(Value),
    /// Names matched by a listing
    Names(Vec<String>),
    /// The request failed on the remote side
    Error(CoreError),
}

/// Remote response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Request ID this responds to
    pub request_id: RequestId,
    /// Result of the request
    pub outcome: Outcome,
}

impl RemoteResponse {
    /// Create a value response
    #[must_use]
    pub fn value(request_id: RequestId, value: Value) -> Self {
        Self {
            request_id,
            outcome: Outcome::Value(value),
        }
    }

    /// Create a listing response
    #[must_use]
    pub fn names(request_id: RequestId, names: Vec<String>) -> Self {
        Self {
            request_id,
            outcome: Outcome::Names(names),
        }
    }

    /// Create a failed response
    #[must_use]
    pub fn error(request_id: RequestId, error: CoreError) -> Self {
        Self {
            request_id,
            outcome: Outcome::Error(error),
        }
    }

    /// Build a response from a call result
    #[must_use]
    pub fn from_result(request_id: RequestId, result: CoreResult<Value>) -> Self {
        match result {
            Ok(value) => Self::value(request_id, value),
            Err(err) => Self::error(request_id, err),
        }
    }

    /// Extract the call result
    ///
    /// # Errors
    ///
    /// Returns the remote error, or `Transport` if the response carries names.
    pub fn into_value(self) -> CoreResult<Value> {
        match self.outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(err) => Err(err),
            Outcome::Names(_) => Err(CoreError::transport("expected a value, got a listing")),
        }
    }

    /// Extract the listed names
    ///
    /// # Errors
    ///
    /// Returns the remote error, or `Transport` if the response carries a value.
    pub fn into_names(self) -> CoreResult<Vec<String>> {
        match self.outcome {
            Outcome::Names(names) => Ok(names),
            Outcome::Error(err) => Err(err),
            Outcome::Value(_) => Err(CoreError::transport("expected a listing, got a value")),
        }
    }
}
