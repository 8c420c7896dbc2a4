//! The lending engine: the single entry point for every mutation.
//!
//! Borrow and return touch exactly one book and one borrower. Each side is
//! written with a version-conditioned update; the copy is taken before the
//! loan is recorded and released only after the loan is cleared, so at no
//! point can `available_copies + loans` exceed the copies owned. If the
//! second write fails the first is undone before the attempt is retried.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::core::invariants::{
    AUTHOR_BOOK_LIMIT, into_result, validate_author_book_limit, validate_available_copies,
    validate_email, validate_membership_capacity, validate_new_author, validate_new_book,
    validate_new_borrower, validate_phone_number, validate_required,
};
use crate::core::report;
use crate::core::transition::{TransitionPlan, plan_borrow, plan_return};
use crate::core::types::{
    Author, AuthorSummary, AuthorUpdate, Book, BookUpdate, Borrower, BorrowerUpdate, CopyDrift,
    EntityId, EntityKind, LoanReceipt, NewAuthor, NewBook, NewBorrower,
};
use crate::error::{LendingError, LendingResult, StoreError};
use crate::io::config::LendingConfig;
use crate::io::store::{EntityStore, Filter, Precondition, Record, Versioned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Borrow,
    Return,
}

impl Transition {
    fn label(self) -> &'static str {
        match self {
            Transition::Borrow => "borrow",
            Transition::Return => "return",
        }
    }
}

pub struct LendingEngine<S> {
    store: Arc<S>,
    max_conflict_retries: u32,
}

impl<S> Clone for LendingEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

impl<S: EntityStore> LendingEngine<S> {
    pub fn new(store: Arc<S>, config: &LendingConfig) -> Self {
        Self {
            store,
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Lend one copy of `book_id` to `borrower_id`.
    pub fn borrow(&self, borrower_id: EntityId, book_id: EntityId) -> LendingResult<LoanReceipt> {
        self.run_transition(borrower_id, book_id, Transition::Borrow)
    }

    /// Take back a copy of `book_id` from `borrower_id`.
    pub fn return_book(
        &self,
        borrower_id: EntityId,
        book_id: EntityId,
    ) -> LendingResult<LoanReceipt> {
        self.run_transition(borrower_id, book_id, Transition::Return)
    }

    fn run_transition(
        &self,
        borrower_id: EntityId,
        book_id: EntityId,
        transition: Transition,
    ) -> LendingResult<LoanReceipt> {
        for attempt in 1..=self.max_conflict_retries {
            match self.try_transition(borrower_id, book_id, transition) {
                Err(LendingError::Conflict { kind, id }) => {
                    debug!(
                        transition = transition.label(),
                        attempt,
                        %kind,
                        %id,
                        "conflict, retrying"
                    );
                }
                Ok(receipt) => {
                    info!(
                        transition = transition.label(),
                        borrower = %borrower_id,
                        book = %book_id,
                        available_copies = receipt.book.available_copies,
                        loans = receipt.borrower.borrowed_books.len(),
                        "loan transition applied"
                    );
                    return Ok(receipt);
                }
                Err(err) => return Err(err),
            }
        }
        warn!(
            transition = transition.label(),
            borrower = %borrower_id,
            book = %book_id,
            retries = self.max_conflict_retries,
            "giving up after repeated conflicts"
        );
        Err(LendingError::Unavailable(format!(
            "{} of book {} by borrower {} kept conflicting after {} attempts",
            transition.label(),
            book_id,
            borrower_id,
            self.max_conflict_retries
        )))
    }

    /// One read-validate-write pass. Returns `Conflict` when a write lost a
    /// race; by then any partial write has been undone.
    fn try_transition(
        &self,
        borrower_id: EntityId,
        book_id: EntityId,
        transition: Transition,
    ) -> LendingResult<LoanReceipt> {
        let borrower: Versioned<Borrower> = self.store.get(borrower_id)?;
        let book: Versioned<Book> = self.store.get(book_id)?;
        let holders = self.store.count(&Filter::BorrowersHolding(book_id))?;

        let now = Utc::now();
        let TransitionPlan {
            borrower: next_borrower,
            book: next_book,
        } = match transition {
            Transition::Borrow => plan_borrow(&borrower.record, &book.record, holders, now)?,
            Transition::Return => plan_return(&borrower.record, &book.record, holders, now)?,
        };
        // Re-checked by the store on the write that adds a holder or a copy.
        let cap = [Precondition::CopyCap { book: book_id }];

        match transition {
            Transition::Borrow => {
                let book = self
                    .store
                    .conditional_update(book_id, book.version, next_book, &[])?;
                match self.store.conditional_update(
                    borrower_id,
                    borrower.version,
                    next_borrower,
                    &cap,
                ) {
                    Ok(borrower) => Ok(LoanReceipt {
                        borrower: borrower.record,
                        book: book.record,
                    }),
                    Err(err) => {
                        self.restock(book_id)?;
                        Err(replan(err, book_id))
                    }
                }
            }
            Transition::Return => {
                let borrower = self.store.conditional_update(
                    borrower_id,
                    borrower.version,
                    next_borrower,
                    &[],
                )?;
                match self
                    .store
                    .conditional_update(book_id, book.version, next_book, &cap)
                {
                    Ok(book) => Ok(LoanReceipt {
                        borrower: borrower.record,
                        book: book.record,
                    }),
                    Err(err) => {
                        self.reinstate_loan(borrower_id, book_id)?;
                        Err(replan(err, book_id))
                    }
                }
            }
        }
    }

    /// Undo a copy taken by a borrow whose loan could not be recorded.
    fn restock(&self, book_id: EntityId) -> LendingResult<()> {
        self.update_with_retry::<Book, _>(book_id, |book| {
            book.available_copies = book.available_copies.saturating_add(1);
            Ok(Vec::new())
        })
        .map(|_| ())
        .map_err(|err| compensation_failed("restock", book_id, err))
    }

    /// Undo a cleared loan whose copy could not be put back on the shelf.
    fn reinstate_loan(&self, borrower_id: EntityId, book_id: EntityId) -> LendingResult<()> {
        self.update_with_retry::<Borrower, _>(borrower_id, |borrower| {
            borrower.borrowed_books.insert(book_id);
            Ok(Vec::new())
        })
        .map(|_| ())
        .map_err(|err| compensation_failed("reinstate loan", borrower_id, err))
    }

    /// Read-modify-write loop keyed on the record version. `apply` edits a
    /// fresh copy and returns the preconditions for the write.
    fn update_with_retry<R, F>(&self, id: EntityId, mut apply: F) -> LendingResult<Versioned<R>>
    where
        R: Record,
        F: FnMut(&mut R) -> LendingResult<Vec<Precondition>>,
    {
        for attempt in 1..=self.max_conflict_retries {
            let current: Versioned<R> = self.store.get(id)?;
            let mut next = current.record.clone();
            let preconditions = apply(&mut next)?;
            match self
                .store
                .conditional_update(id, current.version, next, &preconditions)
            {
                Ok(written) => return Ok(written),
                Err(StoreError::Conflict { .. }) => {
                    debug!(kind = %R::KIND, %id, attempt, "conflict, retrying update");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LendingError::Unavailable(format!(
            "update of {} {} kept conflicting after {} attempts",
            R::KIND,
            id,
            self.max_conflict_retries
        )))
    }

    pub fn create_author(&self, fields: NewAuthor) -> LendingResult<Author> {
        into_result(validate_new_author(&fields))?;
        let now = Utc::now();
        let author = Author {
            id: EntityId::new(),
            name: fields.name,
            email: fields.email,
            phone_number: fields.phone_number,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create(author, &[])?;
        info!(author = %created.record.id, "author created");
        Ok(created.record)
    }

    /// Create a book under its author, enforcing the author book limit both
    /// before the write and atomically with it.
    pub fn create_book(&self, fields: NewBook) -> LendingResult<Book> {
        into_result(validate_new_book(&fields))?;
        let guard = self.author_guard(fields.author)?;

        let now = Utc::now();
        let book = Book {
            id: EntityId::new(),
            title: fields.title,
            author: fields.author,
            isbn: fields.isbn,
            available_copies: fields.available_copies,
            total_copies: fields.available_copies,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create(book, &guard)?;
        info!(book = %created.record.id, author = %fields.author, "book created");
        Ok(created.record)
    }

    pub fn create_borrower(&self, fields: NewBorrower) -> LendingResult<Borrower> {
        into_result(validate_new_borrower(&fields))?;
        let now = Utc::now();
        let borrower = Borrower {
            id: EntityId::new(),
            name: fields.name,
            membership_active: fields.membership_active,
            membership_type: fields.membership_type,
            borrowed_books: Default::default(),
            overdue_books: fields.overdue_books,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create(borrower, &[])?;
        info!(borrower = %created.record.id, "borrower created");
        Ok(created.record)
    }

    pub fn update_author(&self, id: EntityId, update: AuthorUpdate) -> LendingResult<Author> {
        let written = self.update_with_retry::<Author, _>(id, |author| {
            if let Some(name) = &update.name {
                author.name = name.clone();
            }
            if let Some(email) = &update.email {
                author.email = email.clone();
            }
            if let Some(phone) = &update.phone_number {
                author.phone_number = phone.clone();
            }
            into_result(
                [
                    validate_required("name", &author.name),
                    validate_email(&author.email),
                    validate_phone_number(&author.phone_number),
                ]
                .into_iter()
                .flatten()
                .collect(),
            )?;
            author.updated_at = Utc::now();
            Ok(Vec::new())
        })?;
        Ok(written.record)
    }

    /// Generic book update. Moving to another author re-runs the author
    /// guard; a copy-count write re-checks the copy cap and moves
    /// `total_copies` by the same delta.
    pub fn update_book(&self, id: EntityId, update: BookUpdate) -> LendingResult<Book> {
        let written = self.update_with_retry::<Book, _>(id, |book| {
            if let Some(title) = &update.title {
                book.title = title.clone();
            }
            if let Some(isbn) = &update.isbn {
                book.isbn = isbn.clone();
            }
            into_result(
                [
                    validate_required("title", &book.title),
                    validate_required("isbn", &book.isbn),
                ]
                .into_iter()
                .flatten()
                .collect(),
            )?;

            let mut preconditions = Vec::new();
            if let Some(author) = update.author {
                if author != book.author {
                    preconditions = self.author_guard(author)?;
                    book.author = author;
                }
            }

            if let Some(copies) = update.available_copies {
                let borrowed = self.store.count(&Filter::BorrowersHolding(book.id))?;
                validate_available_copies(borrowed, copies)?;
                let on_loan = book.total_copies.saturating_sub(book.available_copies);
                book.total_copies = on_loan.saturating_add(copies);
                book.available_copies = copies;
                preconditions.push(Precondition::CopyCap { book: book.id });
            }

            book.updated_at = Utc::now();
            Ok(preconditions)
        })?;
        Ok(written.record)
    }

    /// Generic borrower update. Loans are untouched; a membership change is
    /// refused if current loans exceed the new ceiling.
    pub fn update_borrower(&self, id: EntityId, update: BorrowerUpdate) -> LendingResult<Borrower> {
        let written = self.update_with_retry::<Borrower, _>(id, |borrower| {
            if let Some(name) = &update.name {
                borrower.name = name.clone();
            }
            if let Some(active) = update.membership_active {
                borrower.membership_active = active;
            }
            if let Some(membership) = update.membership_type {
                validate_membership_capacity(membership, borrower.borrowed_books.len())?;
                borrower.membership_type = membership;
            }
            if let Some(overdue) = &update.overdue_books {
                borrower.overdue_books = overdue.clone();
            }
            into_result(validate_required("name", &borrower.name).into_iter().collect())?;
            borrower.updated_at = Utc::now();
            Ok(Vec::new())
        })?;
        Ok(written.record)
    }

    /// Delete an author. Books still referencing it are left as they are.
    pub fn delete_author(&self, id: EntityId) -> LendingResult<Author> {
        let removed = self.store.delete::<Author>(id)?;
        info!(author = %id, "author deleted");
        Ok(removed.record)
    }

    pub fn delete_book(&self, id: EntityId) -> LendingResult<Book> {
        let removed = self.store.delete::<Book>(id)?;
        info!(book = %id, "book deleted");
        Ok(removed.record)
    }

    pub fn delete_borrower(&self, id: EntityId) -> LendingResult<Borrower> {
        let removed = self.store.delete::<Borrower>(id)?;
        info!(borrower = %id, "borrower deleted");
        Ok(removed.record)
    }

    pub fn get_author(&self, id: EntityId) -> LendingResult<Author> {
        Ok(self.store.get::<Author>(id)?.record)
    }

    pub fn get_book(&self, id: EntityId) -> LendingResult<Book> {
        Ok(self.store.get::<Book>(id)?.record)
    }

    pub fn get_borrower(&self, id: EntityId) -> LendingResult<Borrower> {
        Ok(self.store.get::<Borrower>(id)?.record)
    }

    pub fn list_books(&self) -> LendingResult<Vec<Book>> {
        Ok(records(self.store.list::<Book>()?))
    }

    pub fn list_borrowers(&self) -> LendingResult<Vec<Borrower>> {
        Ok(records(self.store.list::<Borrower>()?))
    }

    /// Every author with its live book count.
    pub fn list_authors(&self) -> LendingResult<Vec<AuthorSummary>> {
        let snapshot = self.store.snapshot()?;
        Ok(report::author_summaries(
            &snapshot.authors(),
            &snapshot.books(),
        ))
    }

    /// Authors linked to more than five books. Empty unless data was
    /// written around the engine.
    pub fn authors_exceeding_limit(&self) -> LendingResult<Vec<AuthorSummary>> {
        let snapshot = self.store.snapshot()?;
        Ok(report::authors_exceeding_limit(
            &snapshot.authors(),
            &snapshot.books(),
        ))
    }

    /// Books whose available copies plus active loans exceed the copies owned.
    pub fn inconsistent_books(&self) -> LendingResult<Vec<CopyDrift>> {
        let snapshot = self.store.snapshot()?;
        Ok(report::copy_drift(&snapshot.books(), &snapshot.borrowers()))
    }

    /// Every invariant violation present in the store right now.
    pub fn audit(&self) -> LendingResult<Vec<String>> {
        let snapshot = self.store.snapshot()?;
        Ok(report::audit(
            &snapshot.authors(),
            &snapshot.books(),
            &snapshot.borrowers(),
        ))
    }

    /// Author must exist and own fewer than five books. Returns the
    /// precondition that re-checks the count at write time.
    fn author_guard(&self, author: EntityId) -> LendingResult<Vec<Precondition>> {
        self.store.get::<Author>(author)?;
        let current = self.store.count(&Filter::BooksByAuthor(author))?;
        validate_author_book_limit(author, current)?;
        Ok(vec![Precondition::FewerThan {
            filter: Filter::BooksByAuthor(author),
            limit: AUTHOR_BOOK_LIMIT,
        }])
    }
}

fn records<R>(entries: Vec<Versioned<R>>) -> Vec<R> {
    entries.into_iter().map(|entry| entry.record).collect()
}

/// Error for a second write that failed after the first was undone. A copy
/// cap breach means the book moved since planning, so it is retried like a
/// version conflict and re-planned against fresh reads.
fn replan(err: StoreError, book: EntityId) -> LendingError {
    match err {
        StoreError::CopyCapExceeded { .. } => {
            debug!(%book, error = %err, "copy cap moved since planning");
            LendingError::Conflict {
                kind: EntityKind::Book,
                id: book,
            }
        }
        other => other.into(),
    }
}

fn compensation_failed(step: &str, id: EntityId, err: LendingError) -> LendingError {
    error!(step, %id, error = %err, "compensating write failed");
    LendingError::Unavailable(format!("{} of {} failed: {}", step, id, err))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::core::types::{DriftKind, MembershipType};
    use crate::error::{ErrorKind, StoreResult};
    use crate::io::snapshot::Snapshot;
    use crate::io::store::MemoryStore;
    use crate::test_support::{engine, new_author, new_book, new_borrower};

    #[test]
    fn borrow_then_return_restores_loan_fields() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 2))
            .expect("book");
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Standard))
            .expect("borrower");

        let lent = engine.borrow(reader.id, title.id).expect("borrow");
        assert_eq!(lent.book.available_copies, 1);
        assert!(lent.borrower.borrowed_books.contains(&title.id));

        let back = engine.return_book(reader.id, title.id).expect("return");
        assert_eq!(back.book.available_copies, title.available_copies);
        assert_eq!(back.book.total_copies, title.total_copies);
        assert_eq!(back.borrower.borrowed_books, reader.borrowed_books);

        let err = engine
            .return_book(reader.id, title.id)
            .expect_err("second return");
        assert_eq!(err.kind(), ErrorKind::NotBorrowed);
    }

    #[test]
    fn borrow_reports_missing_entities() {
        let engine = engine();
        let missing = EntityId::new();
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Standard))
            .expect("borrower");
        let err = engine.borrow(reader.id, missing).expect_err("missing book");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = engine.borrow(missing, missing).expect_err("missing borrower");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// A refused borrow leaves both records at their original versions.
    #[test]
    fn refused_borrow_writes_nothing() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 1))
            .expect("book");
        let mut fields = new_borrower("x", MembershipType::Standard);
        fields.overdue_books.insert(EntityId::new());
        let reader = engine.create_borrower(fields).expect("borrower");

        let err = engine.borrow(reader.id, title.id).expect_err("overdue");
        assert_eq!(err.kind(), ErrorKind::OverdueBlock);

        let book: Versioned<Book> = engine.store().get(title.id).expect("book");
        let borrower: Versioned<Borrower> = engine.store().get(reader.id).expect("borrower");
        assert_eq!(book.version, 1);
        assert_eq!(borrower.version, 1);
    }

    #[test]
    fn sixth_book_for_author_is_refused() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        for i in 0..5 {
            engine
                .create_book(new_book(&format!("b{}", i), writer.id, 1))
                .expect("within limit");
        }
        let err = engine
            .create_book(new_book("b5", writer.id, 1))
            .expect_err("sixth");
        assert_eq!(
            err,
            LendingError::AuthorLimitExceeded {
                author: writer.id,
                limit: 5,
            }
        );
    }

    #[test]
    fn create_book_requires_existing_author() {
        let engine = engine();
        let err = engine
            .create_book(new_book("dune", EntityId::new(), 1))
            .expect_err("no author");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn create_author_rejects_bad_fields_and_duplicate_email() {
        let engine = engine();
        let mut bad = new_author("ada");
        bad.email = "ada-at-example".to_string();
        let err = engine.create_author(bad).expect_err("bad email");
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        engine.create_author(new_author("ada")).expect("first");
        let err = engine
            .create_author(new_author("ada"))
            .expect_err("same email");
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn moving_book_to_full_author_is_refused() {
        let engine = engine();
        let full = engine.create_author(new_author("full")).expect("author");
        let other = engine.create_author(new_author("other")).expect("author");
        for i in 0..5 {
            engine
                .create_book(new_book(&format!("f{}", i), full.id, 1))
                .expect("book");
        }
        let title = engine
            .create_book(new_book("moving", other.id, 1))
            .expect("book");

        let err = engine
            .update_book(
                title.id,
                BookUpdate {
                    author: Some(full.id),
                    ..BookUpdate::default()
                },
            )
            .expect_err("full author");
        assert_eq!(err.kind(), ErrorKind::AuthorLimitExceeded);
        assert_eq!(engine.get_book(title.id).expect("book").author, other.id);
    }

    /// Copy cap: 11 loans reject 101 available copies but accept 100.
    #[test]
    fn copy_update_respects_heavy_borrow_cap() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 20))
            .expect("book");
        for i in 0..11 {
            let reader = engine
                .create_borrower(new_borrower(&format!("r{}", i), MembershipType::Standard))
                .expect("borrower");
            engine.borrow(reader.id, title.id).expect("borrow");
        }

        let err = engine
            .update_book(
                title.id,
                BookUpdate {
                    available_copies: Some(101),
                    ..BookUpdate::default()
                },
            )
            .expect_err("over cap");
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let updated = engine
            .update_book(
                title.id,
                BookUpdate {
                    available_copies: Some(100),
                    ..BookUpdate::default()
                },
            )
            .expect("at cap");
        assert_eq!(updated.available_copies, 100);
        assert_eq!(updated.total_copies, 111);
        assert!(engine.inconsistent_books().expect("drift").is_empty());
    }

    #[test]
    fn membership_downgrade_checks_current_loans() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let other = engine.create_author(new_author("bob")).expect("author");
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Premium))
            .expect("borrower");
        for i in 0..6 {
            let owner = if i < 5 { writer.id } else { other.id };
            let title = engine
                .create_book(new_book(&format!("b{}", i), owner, 1))
                .expect("book");
            engine.borrow(reader.id, title.id).expect("borrow");
        }

        let err = engine
            .update_borrower(
                reader.id,
                BorrowerUpdate {
                    membership_type: Some(MembershipType::Standard),
                    ..BorrowerUpdate::default()
                },
            )
            .expect_err("downgrade");
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }

    #[test]
    fn authors_report_lists_only_overflowing_authors() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        engine
            .create_book(new_book("dune", writer.id, 1))
            .expect("book");
        assert!(engine.authors_exceeding_limit().expect("report").is_empty());
        let listed = engine.list_authors().expect("list");
        assert_eq!(listed[0].book_count, 1);
    }

    fn crowd(engine: &LendingEngine<impl EntityStore>, book: EntityId, readers: usize) {
        for i in 0..readers {
            let reader = engine
                .create_borrower(new_borrower(&format!("r{}", i), MembershipType::Standard))
                .expect("borrower");
            engine.borrow(reader.id, book).expect("borrow");
        }
    }

    fn set_copies(
        engine: &LendingEngine<impl EntityStore>,
        book: EntityId,
        copies: u32,
    ) -> LendingResult<Book> {
        engine.update_book(
            book,
            BookUpdate {
                available_copies: Some(copies),
                ..BookUpdate::default()
            },
        )
    }

    /// The loan that would push a 200-copy book past 10 holders is refused.
    #[test]
    fn borrow_refused_when_new_loan_breaches_copy_cap() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 200))
            .expect("book");
        crowd(&engine, title.id, 10);

        let reader = engine
            .create_borrower(new_borrower("late", MembershipType::Standard))
            .expect("borrower");
        let err = engine.borrow(reader.id, title.id).expect_err("eleventh");
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        assert_eq!(engine.get_book(title.id).expect("book").available_copies, 190);
        assert!(engine.get_borrower(reader.id).expect("borrower").borrowed_books.is_empty());
        assert!(engine.audit().expect("audit").is_empty());
    }

    /// With 12 holders and 100 on the shelf, giving one back would leave
    /// 11 holders and 101 copies; it is refused until the shelf shrinks.
    #[test]
    fn return_refused_when_shelf_would_breach_copy_cap() {
        let engine = engine();
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, 20))
            .expect("book");
        let reader = engine
            .create_borrower(new_borrower("first", MembershipType::Standard))
            .expect("borrower");
        engine.borrow(reader.id, title.id).expect("borrow");
        crowd(&engine, title.id, 11);
        set_copies(&engine, title.id, 100).expect("at cap");

        let book_before: Versioned<Book> = engine.store().get(title.id).expect("book");
        let reader_before: Versioned<Borrower> = engine.store().get(reader.id).expect("borrower");

        let err = engine.return_book(reader.id, title.id).expect_err("over cap");
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let book_after: Versioned<Book> = engine.store().get(title.id).expect("book");
        let reader_after: Versioned<Borrower> = engine.store().get(reader.id).expect("borrower");
        assert_eq!(book_after.version, book_before.version);
        assert_eq!(reader_after.version, reader_before.version);
        assert!(engine.audit().expect("audit").is_empty());

        set_copies(&engine, title.id, 99).expect("below cap");
        let back = engine.return_book(reader.id, title.id).expect("return");
        assert_eq!(back.book.available_copies, 100);
        assert_eq!(back.book.total_copies, 111);
        assert!(engine.audit().expect("audit").is_empty());
    }

    type Interleaved = Box<dyn FnOnce(&Arc<MemoryStore>) + Send>;

    enum Fault {
        Conflict,
        Timeout,
        /// Run a competing writer against the inner store, then write.
        Interleave(Interleaved),
    }

    /// Store that injects queued faults into `conditional_update`. A fault
    /// fires only on a write of the kind it is queued for; other writes and
    /// every read pass straight through.
    struct FaultyStore {
        inner: Arc<MemoryStore>,
        faults: Mutex<VecDeque<(EntityKind, Fault)>>,
    }

    impl FaultyStore {
        fn arm(&self, faults: impl IntoIterator<Item = (EntityKind, Fault)>) {
            self.faults.lock().extend(faults);
        }

        fn next_fault(&self, kind: EntityKind) -> Option<Fault> {
            let mut faults = self.faults.lock();
            if faults.front().is_some_and(|(queued, _)| *queued == kind) {
                faults.pop_front().map(|(_, fault)| fault)
            } else {
                None
            }
        }
    }

    impl EntityStore for FaultyStore {
        fn get<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>> {
            self.inner.get(id)
        }

        fn list<R: Record>(&self) -> StoreResult<Vec<Versioned<R>>> {
            self.inner.list()
        }

        fn create<R: Record>(
            &self,
            record: R,
            preconditions: &[Precondition],
        ) -> StoreResult<Versioned<R>> {
            self.inner.create(record, preconditions)
        }

        fn conditional_update<R: Record>(
            &self,
            id: EntityId,
            expected_version: u64,
            record: R,
            preconditions: &[Precondition],
        ) -> StoreResult<Versioned<R>> {
            match self.next_fault(R::KIND) {
                Some(Fault::Conflict) => Err(StoreError::Conflict {
                    kind: R::KIND,
                    id,
                    expected: expected_version,
                    actual: expected_version + 1,
                }),
                Some(Fault::Timeout) => Err(StoreError::Timeout(0)),
                Some(Fault::Interleave(competitor)) => {
                    competitor(&self.inner);
                    self.inner
                        .conditional_update(id, expected_version, record, preconditions)
                }
                None => self
                    .inner
                    .conditional_update(id, expected_version, record, preconditions),
            }
        }

        fn count(&self, filter: &Filter) -> StoreResult<usize> {
            self.inner.count(filter)
        }

        fn delete<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>> {
            self.inner.delete(id)
        }

        fn snapshot(&self) -> StoreResult<Snapshot> {
            self.inner.snapshot()
        }
    }

    fn faulty_engine() -> LendingEngine<FaultyStore> {
        let config = LendingConfig::default();
        let store = FaultyStore {
            inner: Arc::new(MemoryStore::new(config.lock_timeout())),
            faults: Mutex::new(VecDeque::new()),
        };
        LendingEngine::new(Arc::new(store), &config)
    }

    fn seeded(engine: &LendingEngine<FaultyStore>, copies: u32) -> (Borrower, Book) {
        let writer = engine.create_author(new_author("ada")).expect("author");
        let title = engine
            .create_book(new_book("dune", writer.id, copies))
            .expect("book");
        let reader = engine
            .create_borrower(new_borrower("x", MembershipType::Standard))
            .expect("borrower");
        (reader, title)
    }

    #[test]
    fn failed_loan_write_restocks_the_book() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 2);
        engine.store().arm([(EntityKind::Borrower, Fault::Timeout)]);

        let err = engine.borrow(reader.id, title.id).expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let book: Versioned<Book> = engine.store().get(title.id).expect("book");
        assert_eq!(book.record.available_copies, 2);
        assert_eq!(book.version, 3);
        assert!(engine.get_borrower(reader.id).expect("borrower").borrowed_books.is_empty());
        assert!(engine.audit().expect("audit").is_empty());
    }

    #[test]
    fn failed_shelf_write_reinstates_the_loan() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 2);
        engine.borrow(reader.id, title.id).expect("borrow");
        engine.store().arm([(EntityKind::Book, Fault::Timeout)]);

        let err = engine.return_book(reader.id, title.id).expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        assert_eq!(engine.get_book(title.id).expect("book").available_copies, 1);
        let borrower = engine.get_borrower(reader.id).expect("borrower");
        assert!(borrower.borrowed_books.contains(&title.id));
        assert!(engine.audit().expect("audit").is_empty());
    }

    /// Every attempt loses its second write; each one is undone and the
    /// caller sees `Unavailable` once the retries run out.
    #[test]
    fn repeated_conflicts_exhaust_retries() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 2);
        engine
            .store()
            .arm((0..5).map(|_| (EntityKind::Borrower, Fault::Conflict)));

        let err = engine.borrow(reader.id, title.id).expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let book: Versioned<Book> = engine.store().get(title.id).expect("book");
        assert_eq!(book.record.available_copies, 2);
        assert_eq!(book.version, 11);
        let borrower: Versioned<Borrower> = engine.store().get(reader.id).expect("borrower");
        assert_eq!(borrower.version, 1);
    }

    #[test]
    fn single_conflict_is_retried_once() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 2);
        engine.store().arm([(EntityKind::Borrower, Fault::Conflict)]);

        let lent = engine.borrow(reader.id, title.id).expect("borrow");
        assert_eq!(lent.book.available_copies, 1);
        assert!(lent.borrower.borrowed_books.contains(&title.id));
        assert!(engine.audit().expect("audit").is_empty());
    }

    /// When the undo itself fails the copy stays off the shelf and shows up
    /// in the drift report.
    #[test]
    fn failed_restock_surfaces_as_leaked_copy() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 2);
        engine.store().arm([
            (EntityKind::Borrower, Fault::Timeout),
            (EntityKind::Book, Fault::Timeout),
        ]);

        let err = engine.borrow(reader.id, title.id).expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let drift = engine.inconsistent_books().expect("drift");
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].book, title.id);
        assert_eq!(drift[0].kind, DriftKind::Leaked);
        assert_eq!(drift[0].available_copies, 1);
        assert_eq!(drift[0].borrowed_count, 0);
    }

    /// A copy-count raise that lands between a borrow's two writes is
    /// caught by the loan write; the borrow is re-planned and refused.
    #[test]
    fn copy_raise_during_borrow_cannot_breach_cap() {
        let engine = faulty_engine();
        let (reader, title) = seeded(&engine, 20);
        crowd(&engine, title.id, 10);

        let book_id = title.id;
        engine.store().arm([(
            EntityKind::Borrower,
            Fault::Interleave(Box::new(move |inner: &Arc<MemoryStore>| {
                let other = LendingEngine::new(Arc::clone(inner), &LendingConfig::default());
                set_copies(&other, book_id, 101).expect("raise copies");
            })),
        )]);

        let err = engine.borrow(reader.id, title.id).expect_err("over cap");
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let holders = engine
            .store()
            .count(&Filter::BorrowersHolding(title.id))
            .expect("count");
        assert_eq!(holders, 10);
        let book = engine.get_book(title.id).expect("book");
        assert_eq!(book.available_copies, 102);
        assert_eq!(book.total_copies, 112);
        assert!(engine.audit().expect("audit").is_empty());
    }
}
