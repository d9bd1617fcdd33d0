//! Error types for remote stores and reconciliation.

use thiserror::Error;

use crate::resource::ResourceKey;

/// Errors returned by a remote store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The resource (or the collection holding it) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write conflicted with the stored version, or the object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached or answered with an unexpected status.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with a payload that could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The adapter does not implement the operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    /// Returns true if this error means the resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true if this error is a version or existence conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Outcome class of a failed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The resource is already gone; the delete succeeded in effect.
    AlreadyAbsent,

    /// Anything else; retried under the key's retry budget.
    Retryable,
}

/// Classify a store error raised by a mutation.
pub fn classify(op: Operation, err: &StoreError) -> FailureClass {
    match (op, err) {
        (Operation::Delete, StoreError::NotFound(_)) => FailureClass::AlreadyAbsent,
        _ => FailureClass::Retryable,
    }
}

/// Remote store operation, for logs and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Watch,
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Lowercase operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Watch => "watch",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A remote mutation failed for one key.
    #[error("{op} {key} failed: {source}")]
    Store {
        op: Operation,
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    /// A state the controller cannot be in was observed. Stops the controller.
    #[error("invariant violated for {key} in state {state}: {detail}")]
    InvariantViolation {
        key: ResourceKey,
        state: &'static str,
        detail: String,
    },

    /// The change feed stopped while the controller was still running.
    /// Stops the controller.
    #[error("change feed of {controller} stopped: {detail}")]
    FeedStopped { controller: String, detail: String },
}

impl ReconcileError {
    /// Wrap a store error with its operation and key.
    pub fn store(op: Operation, key: &ResourceKey, source: StoreError) -> Self {
        Self::Store {
            op,
            key: key.clone(),
            source,
        }
    }

    /// Returns true if this error must stop the controller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation { .. } | Self::FeedStopped { .. }
        )
    }
}
