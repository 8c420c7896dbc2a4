//! Entity types shared by the validator, the engine and the store.
//!
//! These are plain data: no I/O, no store handles. Fields owned by the
//! lending engine (`available_copies`, `total_copies`, `borrowed_books`)
//! are public for serialization but only the engine writes them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of any stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The three record kinds held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Author,
    Book,
    Borrower,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Author => "author",
            EntityKind::Book => "book",
            EntityKind::Borrower => "borrower",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipType {
    Standard,
    Premium,
}

impl MembershipType {
    /// Maximum number of simultaneous loans for this membership.
    pub fn loan_limit(self) -> usize {
        match self {
            MembershipType::Standard => 5,
            MembershipType::Premium => 10,
        }
    }
}

impl fmt::Display for MembershipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipType::Standard => f.write_str("Standard"),
            MembershipType::Premium => f.write_str("Premium"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: EntityId,
    pub name: String,
    pub email: String,
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: EntityId,
    pub title: String,
    pub author: EntityId,
    pub isbn: String,
    pub available_copies: u32,
    /// Copies owned as of the last copy-count write (available + on loan).
    pub total_copies: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrower {
    pub id: EntityId,
    pub name: String,
    pub membership_active: bool,
    pub membership_type: MembershipType,
    pub borrowed_books: BTreeSet<EntityId>,
    pub overdue_books: BTreeSet<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuthor {
    pub name: String,
    pub email: String,
    pub phone_number: String,
}

/// Caller-supplied fields for a new book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: EntityId,
    pub isbn: String,
    pub available_copies: u32,
}

/// Caller-supplied fields for a new borrower.
///
/// Loans always start empty; only the overdue set may be seeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBorrower {
    pub name: String,
    pub membership_active: bool,
    pub membership_type: MembershipType,
    #[serde(default)]
    pub overdue_books: BTreeSet<EntityId>,
}

/// Partial update for an author. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

/// Partial update for a book. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookUpdate {
    pub title: Option<String>,
    pub author: Option<EntityId>,
    pub isbn: Option<String>,
    pub available_copies: Option<u32>,
}

/// Partial update for a borrower. Active loans are not editable here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BorrowerUpdate {
    pub name: Option<String>,
    pub membership_active: Option<bool>,
    pub membership_type: Option<MembershipType>,
    pub overdue_books: Option<BTreeSet<EntityId>>,
}

/// Both sides of a completed borrow or return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanReceipt {
    pub borrower: Borrower,
    pub book: Book,
}

/// An author together with its live book count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
    #[serde(flatten)]
    pub author: Author,
    pub book_count: usize,
}

/// Direction in which a book's copy accounting is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Available plus on loan exceeds the copies owned.
    Overcommitted,
    /// Available plus on loan falls short of the copies owned: a copy was
    /// taken or a loan cleared without the matching write on the other side.
    Leaked,
}

/// A book whose copy accounting no longer adds up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyDrift {
    pub book: EntityId,
    pub kind: DriftKind,
    pub available_copies: u32,
    pub borrowed_count: usize,
    pub total_copies: u32,
}
