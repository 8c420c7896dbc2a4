//! Typed failures returned by the lending engine and the entity store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{EntityId, EntityKind, MembershipType};
use crate::io::store::Filter;

pub type LendingResult<T> = Result<T, LendingError>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Stable classification of a [`LendingError`].
///
/// Callers (the HTTP gateway in particular) branch on this instead of
/// inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ValidationError,
    CapacityExceeded,
    AuthorLimitExceeded,
    NoCopiesAvailable,
    OverdueBlock,
    NotBorrowed,
    ConflictError,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LendingError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{membership} members can borrow up to {limit} books at a time")]
    CapacityExceeded {
        membership: MembershipType,
        limit: usize,
    },

    #[error("author {author} can only be linked to up to {limit} books at a time")]
    AuthorLimitExceeded { author: EntityId, limit: usize },

    #[error("no available copies of book {book}")]
    NoCopiesAvailable { book: EntityId },

    #[error("borrower {borrower} has overdue books")]
    OverdueBlock { borrower: EntityId },

    #[error("book {book} is not borrowed by borrower {borrower}")]
    NotBorrowed { borrower: EntityId, book: EntityId },

    #[error("concurrent update to {kind} {id}")]
    Conflict { kind: EntityKind, id: EntityId },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl LendingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LendingError::NotFound { .. } => ErrorKind::NotFound,
            LendingError::Validation(_) => ErrorKind::ValidationError,
            LendingError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            LendingError::AuthorLimitExceeded { .. } => ErrorKind::AuthorLimitExceeded,
            LendingError::NoCopiesAvailable { .. } => ErrorKind::NoCopiesAvailable,
            LendingError::OverdueBlock { .. } => ErrorKind::OverdueBlock,
            LendingError::NotBorrowed { .. } => ErrorKind::NotBorrowed,
            LendingError::Conflict { .. } => ErrorKind::ConflictError,
            LendingError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LendingError::Validation(vec![message.into()])
    }
}

/// Failures reported by an [`crate::io::store::EntityStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("{kind} {id} changed: expected version {expected}, found {actual}")]
    Conflict {
        kind: EntityKind,
        id: EntityId,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} with {field} '{value}' already exists")]
    Duplicate {
        kind: EntityKind,
        field: &'static str,
        value: String,
    },

    /// A count-bounded precondition attached to the write did not hold.
    #[error("precondition failed: {count} records match {filter:?}, limit {limit}")]
    PreconditionFailed {
        filter: Filter,
        count: usize,
        limit: usize,
    },

    /// A heavily borrowed book would be left above its copy cap.
    #[error(
        "book {book} cannot hold {available} available copies with {borrowed} active loans (cap 100 above 10 loans)"
    )]
    CopyCapExceeded {
        book: EntityId,
        borrowed: usize,
        available: u32,
    },

    #[error("timed out after {0} ms waiting for the store lock")]
    Timeout(u64),
}

impl From<StoreError> for LendingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => LendingError::NotFound { kind, id },
            StoreError::Conflict { kind, id, .. } => LendingError::Conflict { kind, id },
            StoreError::Duplicate { .. } => LendingError::Validation(vec![err.to_string()]),
            StoreError::PreconditionFailed {
                filter: Filter::BooksByAuthor(author),
                limit,
                ..
            } => LendingError::AuthorLimitExceeded { author, limit },
            StoreError::PreconditionFailed { .. } | StoreError::CopyCapExceeded { .. } => {
                LendingError::Validation(vec![err.to_string()])
            }
            StoreError::Timeout(_) => LendingError::Unavailable(err.to_string()),
        }
    }
}
