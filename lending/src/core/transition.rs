//! Borrow/return transitions for a (borrower, book) pair.
//!
//! Planning is pure: it takes a snapshot of both entities and returns their
//! next states, or the first failed precondition. Inputs are never mutated,
//! so a refused transition leaves nothing to undo.

use chrono::{DateTime, Utc};

use crate::core::invariants::{validate_available_copies, validate_membership_capacity};
use crate::core::types::{Book, Borrower};
use crate::error::{LendingError, LendingResult};

/// Loan state of one (borrower, book) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanState {
    NotBorrowed,
    Borrowed,
}

pub fn loan_state(borrower: &Borrower, book: &Book) -> LoanState {
    if borrower.borrowed_books.contains(&book.id) {
        LoanState::Borrowed
    } else {
        LoanState::NotBorrowed
    }
}

/// Next states of both entities after a legal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub borrower: Borrower,
    pub book: Book,
}

/// Plan a borrow. Preconditions are checked in a fixed order: copies,
/// overdue block, membership capacity on the pre-addition count, then the
/// book's copy cap with the loan added.
///
/// `holders` is the number of borrowers currently holding `book`.
pub fn plan_borrow(
    borrower: &Borrower,
    book: &Book,
    holders: usize,
    now: DateTime<Utc>,
) -> LendingResult<TransitionPlan> {
    if book.available_copies == 0 {
        return Err(LendingError::NoCopiesAvailable { book: book.id });
    }

    if !borrower.overdue_books.is_empty() {
        return Err(LendingError::OverdueBlock {
            borrower: borrower.id,
        });
    }

    validate_membership_capacity(borrower.membership_type, borrower.borrowed_books.len() + 1)?;

    let mut next_borrower = borrower.clone();
    if !next_borrower.borrowed_books.insert(book.id) {
        // The loan set holds ids, so one borrower holds at most one copy of a title.
        return Err(LendingError::validation(format!(
            "borrower {} already holds book {}",
            borrower.id, book.id
        )));
    }
    next_borrower.updated_at = now;

    let mut next_book = book.clone();
    next_book.available_copies -= 1;
    next_book.updated_at = now;
    validate_available_copies(holders + 1, next_book.available_copies)?;

    Ok(TransitionPlan {
        borrower: next_borrower,
        book: next_book,
    })
}

/// Plan a return. Refused if the book is not held, or if putting the copy
/// back would leave a heavily borrowed book above the copy cap.
///
/// `holders` is the number of borrowers currently holding `book`, this one
/// included.
pub fn plan_return(
    borrower: &Borrower,
    book: &Book,
    holders: usize,
    now: DateTime<Utc>,
) -> LendingResult<TransitionPlan> {
    if loan_state(borrower, book) == LoanState::NotBorrowed {
        return Err(LendingError::NotBorrowed {
            borrower: borrower.id,
            book: book.id,
        });
    }

    let mut next_borrower = borrower.clone();
    next_borrower.borrowed_books.remove(&book.id);
    next_borrower.updated_at = now;

    let mut next_book = book.clone();
    next_book.available_copies = next_book.available_copies.saturating_add(1);
    next_book.updated_at = now;
    validate_available_copies(holders.saturating_sub(1), next_book.available_copies)?;

    Ok(TransitionPlan {
        borrower: next_borrower,
        book: next_book,
    })
}
