//! Error types for the Stratus Kubernetes Operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error, tagged with the operation that issued the call
    #[error("Kubernetes API error during {operation}: {source}")]
    KubeApi {
        operation: String,
        #[source]
        source: kube::Error,
    },
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// The cluster spec cannot be satisfied as written
    #[error("Validation failed: {0}")]
    Validation(String),
    /// A component name with no registered implementation
    #[error("Unknown component: {0}")]
    UnknownComponent(String),
    /// A component deploy or delete failed; retried on the next pass
    #[error("Component {component} failed: {message}")]
    Component { component: String, message: String },
    /// A component kept failing past its retry ceiling
    #[error("Component {component} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        component: String,
        attempts: u32,
        message: String,
    },
    /// An operation exceeded its timeout
    #[error("Timed out: {0}")]
    Timeout(String),
    /// Shutdown was requested while work was in flight
    #[error("Reconciliation cancelled")]
    Cancelled,
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi {
            operation: "api call".to_string(),
            source: err,
        }
    }
}

impl OperatorError {
    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            OperatorError::KubeApi {
                source: kube::Error::Api(ae),
                ..
            } => Some(ae.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound(_)) || self.api_code() == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeApi { source: kube::Error::Api(ae), .. }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409) && !self.is_already_exists()
    }

    /// Terminal errors are not fixed by retrying; they move the cluster to Error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperatorError::Validation(_) | OperatorError::RetriesExhausted { .. }
        )
    }
}

/// Attach the failing operation to kube results.
pub trait KubeResultExt<T> {
    fn with_op(self, operation: impl Into<String>) -> Result<T>;
}

impl<T> KubeResultExt<T> for std::result::Result<T, kube::Error> {
    fn with_op(self, operation: impl Into<String>) -> Result<T> {
        self.map_err(|source| OperatorError::KubeApi {
            operation: operation.into(),
            source,
        })
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}
