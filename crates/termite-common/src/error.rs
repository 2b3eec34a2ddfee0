//! Error types for Termite
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information such as resource names,
//! endpoint addresses, and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Termite operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.route[0].weight")
        field: Option<String>,
    },

    /// Route compilation error (pattern, threshold, or time parsing)
    #[error("compile error for route {route}: {message}")]
    Compile {
        /// Namespace-qualified route name
        route: String,
        /// Description of what failed to compile
        message: String,
    },

    /// Dispatch error talking to a worker endpoint
    #[error("dispatch error [{endpoint}]: {message}")]
    Dispatch {
        /// Endpoint address the dispatch targeted
        endpoint: String,
        /// Description of what failed
        message: String,
        /// Whether the retry policy may re-attempt this error
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watcher", "engine")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a compile error for a route
    pub fn compile(route: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compile {
            route: route.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable dispatch error
    pub fn dispatch(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            endpoint: endpoint.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable dispatch error (e.g., terminal status)
    pub fn dispatch_permanent(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            endpoint: endpoint.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, compile, and serialization errors are not retryable
    /// (they require a config fix). Dispatch errors carry their own flag.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Compile { .. } => false,
            Error::Dispatch { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Error type for reconciliation loops
///
/// Kept separate from [`Error`] so controller signatures stay small; all
/// variants are stringly-typed because they are only ever logged and
/// surfaced as status conditions.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API call failed
    #[error("kube error: {0}")]
    Kube(String),

    /// The resource spec failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal reconciler error
    #[error("internal error: {0}")]
    Internal(String),
}
