//! Test-only helpers for constructing entities and seeded engines.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::core::types::{
    Author, Book, Borrower, EntityId, MembershipType, NewAuthor, NewBook, NewBorrower,
};
use crate::engine::LendingEngine;
use crate::io::config::LendingConfig;
use crate::io::store::MemoryStore;

/// Create an author with a valid email/phone derived from `name`.
pub fn author(name: &str) -> Author {
    let now = Utc::now();
    Author {
        id: EntityId::new(),
        name: name.to_string(),
        email: format!("{}@example.org", name),
        phone_number: "+14155552671".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// Create a book with `copies` available and no loans.
pub fn book(title: &str, author: EntityId, copies: u32) -> Book {
    let now = Utc::now();
    Book {
        id: EntityId::new(),
        title: title.to_string(),
        author,
        isbn: format!("isbn-{}", title),
        available_copies: copies,
        total_copies: copies,
        created_at: now,
        updated_at: now,
    }
}

/// Create an active borrower with no loans and nothing overdue.
pub fn borrower(name: &str, membership: MembershipType) -> Borrower {
    let now = Utc::now();
    Borrower {
        id: EntityId::new(),
        name: name.to_string(),
        membership_active: true,
        membership_type: membership,
        borrowed_books: BTreeSet::new(),
        overdue_books: BTreeSet::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn new_author(name: &str) -> NewAuthor {
    NewAuthor {
        name: name.to_string(),
        email: format!("{}@example.org", name),
        phone_number: "+14155552671".to_string(),
    }
}

pub fn new_book(title: &str, author: EntityId, copies: u32) -> NewBook {
    NewBook {
        title: title.to_string(),
        author,
        isbn: format!("isbn-{}", title),
        available_copies: copies,
    }
}

pub fn new_borrower(name: &str, membership: MembershipType) -> NewBorrower {
    NewBorrower {
        name: name.to_string(),
        membership_active: true,
        membership_type: membership,
        overdue_books: BTreeSet::new(),
    }
}

/// Engine over a fresh in-memory store with default config.
pub fn engine() -> LendingEngine<MemoryStore> {
    engine_with(&LendingConfig::default())
}

pub fn engine_with(config: &LendingConfig) -> LendingEngine<MemoryStore> {
    let store = Arc::new(MemoryStore::new(config.lock_timeout()));
    LendingEngine::new(store, config)
}
