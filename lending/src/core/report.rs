//! Read-only drift reports over a full snapshot of the inventory.
//!
//! Write-time guards should keep every report here empty; they exist to
//! surface data written around the engine (imports, historical snapshots).

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::core::invariants::{
    AUTHOR_BOOK_LIMIT, validate_available_copies, validate_membership_capacity,
};
use crate::core::types::{Author, AuthorSummary, Book, Borrower, CopyDrift, DriftKind, EntityId};

/// Attach live book counts to every author, preserving input order.
pub fn author_summaries(authors: &[Author], books: &[Book]) -> Vec<AuthorSummary> {
    let counts = books_per_author(books);
    authors
        .iter()
        .map(|author| AuthorSummary {
            author: author.clone(),
            book_count: counts.get(&author.id).copied().unwrap_or(0),
        })
        .collect()
}

/// Authors linked to more than the allowed number of books.
pub fn authors_exceeding_limit(authors: &[Author], books: &[Book]) -> Vec<AuthorSummary> {
    author_summaries(authors, books)
        .into_iter()
        .filter(|summary| summary.book_count > AUTHOR_BOOK_LIMIT)
        .collect()
}

/// Books where `available + on loan` differs from the copies last written.
///
/// A borrow or return in flight shows up as `Leaked` until its second write
/// lands; at rest every entry is real drift. Results are ordered by book id.
pub fn copy_drift(books: &[Book], borrowers: &[Borrower]) -> Vec<CopyDrift> {
    let loans = loans_per_book(borrowers);

    let mut drift: Vec<CopyDrift> = books
        .iter()
        .filter_map(|book| {
            let borrowed_count = loans.get(&book.id).copied().unwrap_or(0);
            let accounted = book.available_copies as usize + borrowed_count;
            let owned = book.total_copies as usize;
            let kind = match accounted.cmp(&owned) {
                Ordering::Greater => DriftKind::Overcommitted,
                Ordering::Less => DriftKind::Leaked,
                Ordering::Equal => return None,
            };
            Some(CopyDrift {
                book: book.id,
                kind,
                available_copies: book.available_copies,
                borrowed_count,
                total_copies: book.total_copies,
            })
        })
        .collect();
    drift.sort_by_key(|entry| entry.book);
    drift
}

/// Check every stored invariant over a full snapshot.
///
/// Returns stable messages (empty when the inventory is consistent), ordered
/// authors, then books, then borrowers.
pub fn audit(authors: &[Author], books: &[Book], borrowers: &[Borrower]) -> Vec<String> {
    let mut errors = Vec::new();

    for summary in authors_exceeding_limit(authors, books) {
        errors.push(format!(
            "author {}: linked to {} books (limit {})",
            summary.author.id, summary.book_count, AUTHOR_BOOK_LIMIT
        ));
    }

    let loans = loans_per_book(borrowers);
    for book in books {
        let borrowed = loans.get(&book.id).copied().unwrap_or(0);
        if let Err(err) = validate_available_copies(borrowed, book.available_copies) {
            errors.push(format!("book {}: {}", book.id, err));
        }
    }
    for drift in copy_drift(books, borrowers) {
        let relation = match drift.kind {
            DriftKind::Overcommitted => "exceeds",
            DriftKind::Leaked => "falls short of",
        };
        errors.push(format!(
            "book {}: {} available + {} on loan {} {} owned",
            drift.book, drift.available_copies, drift.borrowed_count, relation, drift.total_copies
        ));
    }

    for borrower in borrowers {
        if let Err(err) =
            validate_membership_capacity(borrower.membership_type, borrower.borrowed_books.len())
        {
            errors.push(format!(
                "borrower {}: holds {} books; {}",
                borrower.id,
                borrower.borrowed_books.len(),
                err
            ));
        }
    }

    errors
}

fn loans_per_book(borrowers: &[Borrower]) -> HashMap<EntityId, usize> {
    let mut loans = HashMap::new();
    for borrower in borrowers {
        for book in &borrower.borrowed_books {
            *loans.entry(*book).or_default() += 1;
        }
    }
    loans
}

fn books_per_author(books: &[Book]) -> HashMap<EntityId, usize> {
    let mut counts = HashMap::new();
    for book in books {
        *counts.entry(book.author).or_default() += 1;
    }
    counts
}
