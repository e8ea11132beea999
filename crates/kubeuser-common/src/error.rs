//! Error types for the kubeuser operator
//!
//! Errors carry the User name where one is known so log lines and status
//! messages point straight at the offending object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubeuser operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The desired state references something that does not exist or is malformed
    #[error("validation error for {user}: {message}")]
    Validation {
        /// Name of the User with invalid configuration
        user: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.roles[0].existingRole")
        field: Option<String>,
    },

    /// Unrecoverable failure in the key/CSR/certificate workflow
    #[error("credential error for {user}: {message}")]
    Credential {
        /// Name of the User whose credential failed
        user: String,
        /// Description of what failed
        message: String,
        /// Workflow stage that failed (key, csr, certificate, kubeconfig)
        stage: Option<String>,
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
        /// Context where the error occurred (e.g., "reconciler", "cleanup")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without user context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            user: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with user context
    pub fn validation_for(user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            user: user.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with user context and field path
    pub fn validation_for_field(
        user: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            user: user.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a credential error with user context
    pub fn credential_for(user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            user: user.into(),
            message: msg.into(),
            stage: None,
        }
    }

    /// Create a credential error tagged with the workflow stage that failed
    pub fn credential_in_stage(
        user: impl Into<String>,
        stage: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Credential {
            user: user.into(),
            message: msg.into(),
            stage: Some(stage.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change.
    /// Credential errors are retried on a short fixed delay.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 Conflict is a stale resourceVersion: re-read and try again
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Credential { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True for a Kubernetes 409 (conflict or already exists)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the User name if this error is associated with a specific User
    pub fn user(&self) -> Option<&str> {
        match self {
            Error::Validation { user, .. } => Some(user),
            Error::Credential { user, .. } => Some(user),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Credential { stage, .. } => stage.as_deref(),
            _ => None,
        }
    }

    /// Message suitable for `status.message`, without the user prefix
    pub fn detail(&self) -> String {
        match self {
            Error::Validation { message, .. } | Error::Credential { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}
