//! Error handling for the rabia-consensus library
//!
//! This module provides the error type shared by every component of the
//! consensus subsystem: the phase engine, topology and leader tracking,
//! persistence and the in-process transport.
//!
//! # Error Categories
//!
//! - **Protocol Errors**: proposal intake and phase engine failures
//! - **Storage Errors**: checkpoint persistence and snapshot handling
//! - **Encoding Errors**: wire and checkpoint serialization failures
//! - **Configuration Errors**: invalid settings, rejected at construction
//! - **Internal Errors**: invariant violations
//!
//! Quorum loss is deliberately absent from this list. It is an operating mode
//! of the engine, not an error: proposals submitted while quorum is missing
//! simply stay pending until a decision is reached.
//!
//! # Usage Example
//!
//! ```rust
//! use rabia_consensus::error::{RabiaError, Result};
//!
//! fn submit() -> Result<()> {
//!     Err(RabiaError::ResourceExhausted {
//!         resource: "pending batches".to_string(),
//!         limit: 1024,
//!     })
//! }
//!
//! assert!(submit().unwrap_err().is_transient());
//! ```

use crate::config::ConfigError;
use thiserror::Error;

/// Error type for rabia-consensus operations
#[derive(Error, Debug)]
pub enum RabiaError {
    // === Protocol Errors ===

    /// A proposal was rejected before entering the pending queue
    #[error("Proposal rejected: {reason}")]
    ProposalRejected {
        /// The reason for rejection
        reason: String,
    },

    /// The caller's correlation was evicted from the bounded tracker
    #[error("Proposal {correlation_id} dropped before a decision was observed")]
    ProposalDropped {
        /// Correlation of the dropped proposal
        correlation_id: String,
    },

    /// Snapshot creation or restore failed
    #[error("Snapshot {operation} failed: {details}")]
    Snapshot {
        /// The snapshot operation that failed (create, restore)
        operation: String,
        /// Additional details about the failure
        details: String,
    },

    // === Storage Errors ===

    /// Persistence operation failed
    #[error("Storage operation '{operation}' failed: {source}")]
    Storage {
        /// The storage operation that failed
        operation: String,
        /// The underlying error that caused the failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Encoding Errors ===

    /// Message serialization or deserialization failed
    #[error("Serialization error for {message_type}: {source}")]
    Serialization {
        /// Encoding that failed (binary, json)
        message_type: String,
        /// The underlying serialization error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Configuration Errors ===

    /// Configuration rejected at construction time
    #[error("Configuration error: {source}")]
    Configuration {
        /// The underlying configuration error
        #[from]
        source: ConfigError,
    },

    // === System Errors ===

    /// A bounded resource is full
    #[error("Resource exhausted: {resource} (limit {limit})")]
    ResourceExhausted {
        /// The resource that was exhausted
        resource: String,
        /// Configured capacity of the resource
        limit: usize,
    },

    /// The node runtime is not running
    #[error("Service '{service}' unavailable: {reason}")]
    ServiceUnavailable {
        /// The service that is unavailable
        service: String,
        /// Why it is unavailable
        reason: String,
    },

    /// I/O operation failed
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// The operation that encountered the I/O error
        operation: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    // === Internal Errors ===

    /// Internal invariant was violated
    #[error("Invariant violation in {component}: {details}")]
    InvariantViolation {
        /// The component where the violation occurred
        component: String,
        /// Details about the violation
        details: String,
    },
}

impl RabiaError {
    /// Check if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabiaError::ResourceExhausted { .. }
                | RabiaError::ProposalDropped { .. }
        )
    }

    /// Get the error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            RabiaError::ProposalRejected { .. }
            | RabiaError::ProposalDropped { .. }
            | RabiaError::Snapshot { .. } => "protocol",

            RabiaError::Storage { .. } => "storage",

            RabiaError::Serialization { .. } => "encoding",

            RabiaError::Configuration { .. } => "configuration",

            RabiaError::ResourceExhausted { .. }
            | RabiaError::ServiceUnavailable { .. }
            | RabiaError::Io { .. } => "system",

            RabiaError::InvariantViolation { .. } => "internal",
        }
    }

    /// Create a storage error with context
    pub fn storage_error(
        operation: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RabiaError::Storage {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with context
    pub fn serialization_error(
        message_type: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RabiaError::Serialization {
            message_type: message_type.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a snapshot error with context
    pub fn snapshot_error(operation: &str, details: impl std::fmt::Display) -> Self {
        RabiaError::Snapshot {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    /// Create a service-unavailable error for the node runtime
    pub fn node_stopped(reason: &str) -> Self {
        RabiaError::ServiceUnavailable {
            service: "rabia-node".to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Convenient Result type alias for rabia-consensus operations
pub type Result<T> = std::result::Result<T, RabiaError>;

impl From<std::io::Error> for RabiaError {
    fn from(err: std::io::Error) -> Self {
        RabiaError::Io {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<bincode::Error> for RabiaError {
    fn from(err: bincode::Error) -> Self {
        RabiaError::serialization_error("binary", err)
    }
}

impl From<serde_json::Error> for RabiaError {
    fn from(err: serde_json::Error) -> Self {
        RabiaError::serialization_error("json", err)
    }
}
