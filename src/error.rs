//! Error types for the replica engine.

use crate::types::{ClassRef, Ref, TxId};
use thiserror::Error;

/// Main error type for replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    /// A remote protocol call rejected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An index rejected a transaction. Indices before it have already applied.
    #[error("Index '{index}' failed on transaction {tx}: {source}")]
    Pipeline {
        index: String,
        tx: TxId,
        #[source]
        source: Box<ReplicaError>,
    },

    /// Both the network send and the local pipeline of an optimistic apply failed.
    #[error("Transaction failed remotely ({transport}) and locally ({pipeline})")]
    TxFailed {
        transport: Box<ReplicaError>,
        pipeline: Box<ReplicaError>,
    },

    #[error("Cannot cast document {doc} of class {actual} to {expected}")]
    Cast {
        doc: Ref,
        expected: ClassRef,
        actual: ClassRef,
    },

    #[error("Unknown class: {0}")]
    UnknownClass(ClassRef),

    #[error("Document already exists: {id}")]
    DuplicateCreate { id: Ref },

    #[error("Document not found: {id}")]
    NotFound { id: Ref },

    #[error("Domain of class {class} cannot change from '{from}' to '{to}'")]
    DomainChange {
        class: ClassRef,
        from: String,
        to: String,
    },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// The task running an optimistic apply panicked or was cancelled.
    #[error("Transaction task failed: {0}")]
    TaskFailed(String),

    #[error("Live query closed")]
    QueryClosed,
}

impl ReplicaError {
    /// True for duplicate-create and not-found errors, the conflicts a caller
    /// may resolve by refreshing instead of treating as infrastructure failure.
    pub fn is_conflict(&self) -> bool {
        match self {
            ReplicaError::DuplicateCreate { .. } | ReplicaError::NotFound { .. } => true,
            ReplicaError::Pipeline { source, .. } => source.is_conflict(),
            ReplicaError::TxFailed { pipeline, .. } => pipeline.is_conflict(),
            _ => false,
        }
    }

    /// Name of the index a pipeline failure is blamed on.
    pub fn failing_index(&self) -> Option<&str> {
        match self {
            ReplicaError::Pipeline { index, .. } => Some(index),
            ReplicaError::TxFailed { pipeline, .. } => pipeline.failing_index(),
            _ => None,
        }
    }

    /// True if the remote half of an operation failed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ReplicaError::Transport(_) | ReplicaError::TxFailed { .. }
        )
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(e: serde_json::Error) -> Self {
        ReplicaError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ReplicaError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ReplicaError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ReplicaError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ReplicaError::Deserialization(e.to_string())
    }
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;
