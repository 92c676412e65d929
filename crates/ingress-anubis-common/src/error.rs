//! Error types for the ingress-anubis controller
//!
//! Errors carry the context needed to debug a failed reconciliation (the
//! ingress, the directive, the owner label value) and know whether they are
//! worth retrying. The controller's error policy keys off `is_retryable()`:
//! permanent errors wait for the user to change the Ingress, everything else
//! is requeued with backoff.

use thiserror::Error;

/// Main error type for ingress-anubis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The source Ingress is malformed in a way only the user can fix
    #[error("validation error for {ingress}: {message}")]
    Validation {
        /// `namespace/name` of the offending Ingress
        ingress: String,
        /// Description of what's invalid
        message: String,
    },

    /// A recognized directive annotation carried an unparsable value
    #[error("failed to parse annotation {key} value {value:?} as {expected}")]
    Directive {
        /// Full annotation key
        key: String,
        /// Raw annotation value
        value: String,
        /// Type the value was expected to have (e.g. "bool", "int")
        expected: String,
    },

    /// The owner label of a generated resource could not be encoded or parsed
    #[error("invalid owner key {value:?}: {message}")]
    OwnerKey {
        /// The offending label value (or namespace/name pair)
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// A named backend port could not be translated to a number
    #[error("failed to find port {port} in service {service}")]
    PortNotFound {
        /// `namespace/name` of the Service that was searched
        service: String,
        /// The port name that was looked up
        port: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Process configuration error
    #[error("configuration error for {field}: {message}")]
    Config {
        /// Configuration field (usually the environment variable name)
        field: String,
        /// Description of what's wrong
        message: String,
    },
}

impl Error {
    /// Create a validation error for the given `namespace/name`
    pub fn validation_for(ingress: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            ingress: ingress.into(),
            message: msg.into(),
        }
    }

    /// Create a directive parse error
    pub fn directive(
        key: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::Directive {
            key: key.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create an owner key error
    pub fn owner_key(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OwnerKey {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a port-not-found error
    pub fn port_not_found(service: impl Into<String>, port: impl Into<String>) -> Self {
        Self::PortNotFound {
            service: service.into(),
            port: port.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error for the given field
    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Every store failure is treated as transient (including optimistic
    /// concurrency conflicts) and relies on the controller requeueing the
    /// object against fresh state. Malformed Ingresses, bad directives and bad
    /// owner labels require a spec change and are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::Directive { .. } => false,
            Error::OwnerKey { .. } => false,
            Error::PortNotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
        }
    }

    /// Whether this error wraps a 409 Conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Metric label for this error ("transient" or "permanent")
    pub fn error_type(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}
