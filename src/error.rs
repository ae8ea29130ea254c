//! Error types for the launch preparation layer.

use std::path::PathBuf;

/// Result type alias for preparation and lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or tearing down a container launch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Administrator Policy Errors
    // =========================================================================
    /// Administrator policy forbids the request.
    #[error("configuration disallows {0}")]
    ConfigurationDisallowed(String),

    /// A feature required by the request is switched off by the administrator.
    #[error("{feature} disabled by configuration '{directive}'")]
    ConfigurationDisabled { feature: String, directive: String },

    /// The request itself is contradictory or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A policy file cannot be trusted (ownership or integrity).
    #[error("policy file {path} cannot be trusted: {reason}")]
    PolicyIntegrity { path: PathBuf, reason: String },

    // =========================================================================
    // Privilege Errors
    // =========================================================================
    /// Setuid / non-setuid expectation violated for the requested operation.
    #[error("privilege mismatch: {0}")]
    PrivilegeMismatch(String),

    /// An instance record failed an authenticity proof.
    #[error("instance integrity check failed: {0}")]
    InstanceIntegrity(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// A helper binary or kernel feature is missing.
    #[error("{resource} unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// A bounded starter field would overflow.
    #[error("{field} exceeds starter capacity ({limit})")]
    CapacityExceeded { field: String, limit: usize },

    /// The backing filesystem of an image is mounted read-only.
    #[error("{path} is on a read-only filesystem")]
    ReadOnlyFilesystem { path: PathBuf },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// I/O error attached to a path.
    #[error("{path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call failure.
    #[error("{call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// One or more independent cleanup actions failed.
    #[error("encountered errors during cleanup: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Broad classes used to decide how an error is handled by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Policy forbids the request. Never retried.
    ConfigurationDisallowed,
    /// A policy file is untrusted. Abort before any privileged action.
    PolicyIntegrity,
    /// Setuid expectation violated.
    PrivilegeMismatch,
    /// Untrusted instance record failed a proof.
    InstanceIntegrity,
    /// Missing helper or kernel feature.
    ResourceUnavailable,
    /// File access failure not implying a policy violation.
    TransientIo,
    /// Programming or state error.
    Internal,
}

impl Error {
    /// Returns the taxonomy class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigurationDisallowed(_)
            | Self::ConfigurationDisabled { .. }
            | Self::InvalidConfiguration(_) => ErrorCategory::ConfigurationDisallowed,
            Self::PolicyIntegrity { .. } => ErrorCategory::PolicyIntegrity,
            Self::PrivilegeMismatch(_) => ErrorCategory::PrivilegeMismatch,
            Self::InstanceIntegrity(_) => ErrorCategory::InstanceIntegrity,
            Self::ResourceUnavailable { .. } | Self::CapacityExceeded { .. } => {
                ErrorCategory::ResourceUnavailable
            }
            Self::ReadOnlyFilesystem { .. }
            | Self::PathIo { .. }
            | Self::Io(_)
            | Self::Sys { .. }
            | Self::Timeout { .. }
            | Self::Cleanup(_) => ErrorCategory::TransientIo,
            Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true if the error must abort the launch without any fallback.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReadOnlyFilesystem { .. })
    }

    pub(crate) fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn sys(call: &'static str, source: nix::Error) -> Self {
        Self::Sys { call, source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
