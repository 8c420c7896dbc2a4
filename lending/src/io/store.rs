//! Entity store contract and its in-memory implementation.
//!
//! Every record carries a version. Mutations are conditional on the version
//! the caller read (compare-and-swap), and may carry count preconditions
//! that the store re-checks atomically with the write.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::invariants::validate_available_copies;
use crate::core::types::{Author, Book, Borrower, EntityId, EntityKind};
use crate::error::{StoreError, StoreResult};
use crate::io::snapshot::Snapshot;

/// A record as stored, with the version to quote on the next write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<R> {
    pub version: u64,
    pub record: R,
}

/// Relational lookups the store can count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Books whose `author` is the given id.
    BooksByAuthor(EntityId),
    /// Borrowers whose `borrowed_books` contains the given book.
    BorrowersHolding(EntityId),
}

/// Condition checked by the store under its write lock. A write whose
/// condition fails is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Fewer than `limit` records match `filter` before the write.
    FewerThan { filter: Filter, limit: usize },
    /// After the write, `book` is within the heavy-borrow copy cap: with
    /// more than 10 holders it has at most 100 available copies.
    CopyCap { book: EntityId },
}

/// Backing tables of [`MemoryStore`]. Only reachable through [`Record`].
#[derive(Debug, Default)]
pub struct Tables {
    authors: HashMap<EntityId, Versioned<Author>>,
    books: HashMap<EntityId, Versioned<Book>>,
    borrowers: HashMap<EntityId, Versioned<Borrower>>,
}

impl Tables {
    fn count(&self, filter: &Filter) -> usize {
        match filter {
            Filter::BooksByAuthor(author) => self
                .books
                .values()
                .filter(|entry| entry.record.author == *author)
                .count(),
            Filter::BorrowersHolding(book) => self
                .borrowers
                .values()
                .filter(|entry| entry.record.borrowed_books.contains(book))
                .count(),
        }
    }

    /// Conditions evaluated against the tables as they are before the write.
    fn check_before(&self, preconditions: &[Precondition]) -> StoreResult<()> {
        for precondition in preconditions {
            if let Precondition::FewerThan { filter, limit } = precondition {
                let count = self.count(filter);
                if count >= *limit {
                    return Err(StoreError::PreconditionFailed {
                        filter: *filter,
                        count,
                        limit: *limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Conditions evaluated against the tables with the write applied.
    fn check_after(&self, preconditions: &[Precondition]) -> StoreResult<()> {
        for precondition in preconditions {
            if let Precondition::CopyCap { book } = precondition {
                let Some(entry) = self.books.get(book) else {
                    continue;
                };
                let borrowed = self.count(&Filter::BorrowersHolding(*book));
                let available = entry.record.available_copies;
                if validate_available_copies(borrowed, available).is_err() {
                    return Err(StoreError::CopyCapExceeded {
                        book: *book,
                        borrowed,
                        available,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A storable entity.
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> EntityId;

    /// Fields that must be unique across the kind, as `(field, value)`.
    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    #[doc(hidden)]
    fn table(tables: &Tables) -> &HashMap<EntityId, Versioned<Self>>;

    #[doc(hidden)]
    fn table_mut(tables: &mut Tables) -> &mut HashMap<EntityId, Versioned<Self>>;
}

impl Record for Author {
    const KIND: EntityKind = EntityKind::Author;

    fn id(&self) -> EntityId {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("email", self.email.clone())]
    }

    fn table(tables: &Tables) -> &HashMap<EntityId, Versioned<Self>> {
        &tables.authors
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<EntityId, Versioned<Self>> {
        &mut tables.authors
    }
}

impl Record for Book {
    const KIND: EntityKind = EntityKind::Book;

    fn id(&self) -> EntityId {
        self.id
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![("isbn", self.isbn.clone())]
    }

    fn table(tables: &Tables) -> &HashMap<EntityId, Versioned<Self>> {
        &tables.books
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<EntityId, Versioned<Self>> {
        &mut tables.books
    }
}

impl Record for Borrower {
    const KIND: EntityKind = EntityKind::Borrower;

    fn id(&self) -> EntityId {
        self.id
    }

    fn table(tables: &Tables) -> &HashMap<EntityId, Versioned<Self>> {
        &tables.borrowers
    }

    fn table_mut(tables: &mut Tables) -> &mut HashMap<EntityId, Versioned<Self>> {
        &mut tables.borrowers
    }
}

/// Persistence contract used by the lending engine.
pub trait EntityStore: Send + Sync {
    fn get<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>>;

    fn list<R: Record>(&self) -> StoreResult<Vec<Versioned<R>>>;

    /// Insert a new record. Fails with `Duplicate` on a unique-key clash,
    /// `PreconditionFailed` or `CopyCapExceeded` if a precondition does not
    /// hold.
    fn create<R: Record>(
        &self,
        record: R,
        preconditions: &[Precondition],
    ) -> StoreResult<Versioned<R>>;

    /// Replace a record only if its version still equals `expected_version`.
    fn conditional_update<R: Record>(
        &self,
        id: EntityId,
        expected_version: u64,
        record: R,
        preconditions: &[Precondition],
    ) -> StoreResult<Versioned<R>>;

    fn count(&self, filter: &Filter) -> StoreResult<usize>;

    /// Remove a record, returning what was stored.
    fn delete<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>>;

    /// Every table as of a single instant.
    fn snapshot(&self) -> StoreResult<Snapshot>;
}

/// Thread-safe in-memory store. Lock waits are bounded by `lock_timeout`.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            lock_timeout,
        }
    }

    /// Replace all tables with the snapshot contents. Versions are kept.
    pub fn restore(&self, snapshot: Snapshot) -> StoreResult<()> {
        let mut tables = self.write()?;
        tables.authors = index(snapshot.authors);
        tables.books = index(snapshot.books);
        tables.borrowers = index(snapshot.borrowers);
        debug!(
            authors = tables.authors.len(),
            books = tables.books.len(),
            borrowers = tables.borrowers.len(),
            "store restored"
        );
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| StoreError::Timeout(self.timeout_ms()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| StoreError::Timeout(self.timeout_ms()))
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl EntityStore for MemoryStore {
    fn get<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>> {
        let tables = self.read()?;
        R::table(&tables)
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: R::KIND, id })
    }

    fn list<R: Record>(&self) -> StoreResult<Vec<Versioned<R>>> {
        let tables = self.read()?;
        Ok(sorted_values(R::table(&tables)))
    }

    fn create<R: Record>(
        &self,
        record: R,
        preconditions: &[Precondition],
    ) -> StoreResult<Versioned<R>> {
        let mut tables = self.write()?;
        let id = record.id();
        if R::table(&tables).contains_key(&id) {
            return Err(StoreError::Duplicate {
                kind: R::KIND,
                field: "id",
                value: id.to_string(),
            });
        }
        ensure_unique(R::table(&tables), &record)?;
        tables.check_before(preconditions)?;

        let entry = Versioned { version: 1, record };
        R::table_mut(&mut tables).insert(id, entry.clone());
        if let Err(err) = tables.check_after(preconditions) {
            R::table_mut(&mut tables).remove(&id);
            return Err(err);
        }
        debug!(kind = %R::KIND, %id, "record created");
        Ok(entry)
    }

    fn conditional_update<R: Record>(
        &self,
        id: EntityId,
        expected_version: u64,
        record: R,
        preconditions: &[Precondition],
    ) -> StoreResult<Versioned<R>> {
        let mut tables = self.write()?;
        let actual = R::table(&tables)
            .get(&id)
            .map(|entry| entry.version)
            .ok_or(StoreError::NotFound { kind: R::KIND, id })?;
        if actual != expected_version {
            trace!(kind = %R::KIND, %id, expected_version, actual, "version conflict");
            return Err(StoreError::Conflict {
                kind: R::KIND,
                id,
                expected: expected_version,
                actual,
            });
        }
        ensure_unique(R::table(&tables), &record)?;
        tables.check_before(preconditions)?;

        let entry = Versioned {
            version: actual + 1,
            record,
        };
        let previous = R::table_mut(&mut tables).insert(id, entry.clone());
        if let Err(err) = tables.check_after(preconditions) {
            if let Some(previous) = previous {
                R::table_mut(&mut tables).insert(id, previous);
            }
            trace!(kind = %R::KIND, %id, error = %err, "write rolled back");
            return Err(err);
        }
        debug!(kind = %R::KIND, %id, version = entry.version, "record updated");
        Ok(entry)
    }

    fn count(&self, filter: &Filter) -> StoreResult<usize> {
        let tables = self.read()?;
        Ok(tables.count(filter))
    }

    fn delete<R: Record>(&self, id: EntityId) -> StoreResult<Versioned<R>> {
        let mut tables = self.write()?;
        let removed = R::table_mut(&mut tables)
            .remove(&id)
            .ok_or(StoreError::NotFound { kind: R::KIND, id })?;
        debug!(kind = %R::KIND, %id, version = removed.version, "record deleted");
        Ok(removed)
    }

    fn snapshot(&self) -> StoreResult<Snapshot> {
        let tables = self.read()?;
        Ok(Snapshot {
            authors: sorted_values(&tables.authors),
            books: sorted_values(&tables.books),
            borrowers: sorted_values(&tables.borrowers),
        })
    }
}

/// Reject `record` if another record of its kind already holds one of its
/// unique values.
fn ensure_unique<R: Record>(
    table: &HashMap<EntityId, Versioned<R>>,
    record: &R,
) -> StoreResult<()> {
    let id = record.id();
    for (field, value) in record.unique_keys() {
        let taken = table.values().any(|entry| {
            entry.record.id() != id
                && entry
                    .record
                    .unique_keys()
                    .iter()
                    .any(|(other_field, other_value)| *other_field == field && *other_value == value)
        });
        if taken {
            return Err(StoreError::Duplicate {
                kind: R::KIND,
                field,
                value,
            });
        }
    }
    Ok(())
}

fn sorted_values<R: Record>(table: &HashMap<EntityId, Versioned<R>>) -> Vec<Versioned<R>> {
    let mut values: Vec<_> = table.values().cloned().collect();
    values.sort_by_key(|entry| entry.record.id());
    values
}

fn index<R: Record>(entries: Vec<Versioned<R>>) -> HashMap<EntityId, Versioned<R>> {
    entries
        .into_iter()
        .map(|entry| (entry.record.id(), entry))
        .collect()
}
