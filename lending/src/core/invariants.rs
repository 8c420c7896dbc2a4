//! Entity-level and cross-entity invariants checked before any write.
//!
//! Everything here is pure: callers pass in the counts and snapshots they
//! read, so each rule is testable without a store.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{EntityId, MembershipType, NewAuthor, NewBook, NewBorrower};
use crate::error::{LendingError, LendingResult};

/// Most books a single author may be linked to.
pub const AUTHOR_BOOK_LIMIT: usize = 5;

/// Above this many active loans, a book's available copies are capped.
pub const HEAVY_BORROW_THRESHOLD: usize = 10;

/// Copy cap applied to heavily borrowed books.
pub const HEAVY_BORROW_COPY_CAP: u32 = 100;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").expect("email pattern compiles"));

// E.164-like, ASCII digits only.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{1,14}$").expect("phone pattern compiles"));

/// Gate a new book-author link. `current_count` is the number of books the
/// author owns *before* the link, so the fifth link is the last accepted.
pub fn validate_author_book_limit(author: EntityId, current_count: usize) -> LendingResult<()> {
    if current_count >= AUTHOR_BOOK_LIMIT {
        return Err(LendingError::AuthorLimitExceeded {
            author,
            limit: AUTHOR_BOOK_LIMIT,
        });
    }
    Ok(())
}

/// Heavily borrowed books (more than 10 active loans) may not advertise
/// more than 100 available copies.
pub fn validate_available_copies(borrowed_count: usize, available_copies: u32) -> LendingResult<()> {
    if borrowed_count > HEAVY_BORROW_THRESHOLD && available_copies > HEAVY_BORROW_COPY_CAP {
        return Err(LendingError::validation(format!(
            "available copies cannot exceed {} while the book has more than {} active loans (available={}, borrowed={})",
            HEAVY_BORROW_COPY_CAP, HEAVY_BORROW_THRESHOLD, available_copies, borrowed_count
        )));
    }
    Ok(())
}

/// Check a borrower's loan count after a proposed change against the
/// membership ceiling.
pub fn validate_membership_capacity(
    membership: MembershipType,
    proposed_borrowed_count: usize,
) -> LendingResult<()> {
    let limit = membership.loan_limit();
    if proposed_borrowed_count > limit {
        return Err(LendingError::CapacityExceeded { membership, limit });
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Option<String> {
    if EMAIL_RE.is_match(email) {
        None
    } else {
        Some(format!("invalid email format '{}'", email))
    }
}

pub fn validate_phone_number(phone: &str) -> Option<String> {
    if PHONE_RE.is_match(phone) {
        None
    } else {
        Some(format!("invalid phone number format '{}'", phone))
    }
}

pub fn validate_required(field: &str, value: &str) -> Option<String> {
    if value.trim().is_empty() {
        Some(format!("{} is required", field))
    } else {
        None
    }
}

/// Field checks for a new author. Returns stable messages (empty on success).
pub fn validate_new_author(author: &NewAuthor) -> Vec<String> {
    [
        validate_required("name", &author.name),
        validate_email(&author.email),
        validate_phone_number(&author.phone_number),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub fn validate_new_book(book: &NewBook) -> Vec<String> {
    [
        validate_required("title", &book.title),
        validate_required("isbn", &book.isbn),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub fn validate_new_borrower(borrower: &NewBorrower) -> Vec<String> {
    validate_required("name", &borrower.name).into_iter().collect()
}

/// Turn collected field messages into a single validation failure.
pub fn into_result(errors: Vec<String>) -> LendingResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LendingError::Validation(errors))
    }
}
