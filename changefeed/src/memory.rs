//! In-memory tables with change feeds.
//!
//! `MemoryTable` keeps rows keyed by an id field and pushes a
//! `DatabaseChange` to every open change cursor on each write. It is the
//! feed implementation behind the simulator and the end-to-end tests.
//!
//! # Partitions
//!
//! `partitioned_by(field)` exposes the same table as a `PartitionSource`.
//! A partition cursor only sees rows whose `field` equals its key; a row that
//! moves between partitions shows up as a delete in the old partition and an
//! insert in the new one.
//!
//! # Accounting
//!
//! Every cursor handed out (snapshot or change) is counted when opened and
//! when first closed, so tests can check that nothing leaks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::cursor::{BoxChangeCursor, BoxCursor, ChangeCursor, PartitionSource, TableSource, VecCursor};
use crate::error::JoinError;
use crate::types::{DatabaseChange, Row};

type FeedItem<T> = Result<DatabaseChange<T>, JoinError>;

struct Subscriber<T> {
    id: u64,
    /// `(field, key)` for partition cursors, `None` for whole-table cursors.
    partition: Option<(String, String)>,
    sender: mpsc::UnboundedSender<FeedItem<T>>,
}

struct TableState<T> {
    id_field: String,
    rows: BTreeMap<String, T>,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber: u64,
    opened: usize,
    closed: usize,
    fail_snapshots: bool,
    fail_closes: bool,
}

/// A table whose writes are streamed to change cursors.
pub struct MemoryTable<T> {
    state: Arc<Mutex<TableState<T>>>,
}

impl<T> Clone for MemoryTable<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Row> MemoryTable<T> {
    /// Create an empty table keyed by `id_field`.
    #[must_use]
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                id_field: id_field.into(),
                rows: BTreeMap::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                opened: 0,
                closed: 0,
                fail_snapshots: false,
                fail_closes: false,
            })),
        }
    }

    /// Create a table keyed by `id` holding `rows`.
    #[must_use]
    pub fn with_rows(rows: impl IntoIterator<Item = T>) -> Self {
        let table = Self::new("id");
        for row in rows {
            table.insert(row);
        }
        table
    }

    fn lock(&self) -> MutexGuard<'_, TableState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `row`, or replace the row with the same id.
    ///
    /// Rows without an id field are ignored.
    pub fn insert(&self, row: T) {
        let mut state = self.lock();
        let Some(id) = row.field(&state.id_field).map(str::to_owned) else {
            tracing::warn!("ignoring row without an {} field", state.id_field);
            return;
        };
        let old = state.rows.insert(id, row.clone());
        let change = DatabaseChange {
            old_val: old,
            new_val: Some(row),
        };
        state.broadcast(&change);
    }

    /// Replace an existing row. Returns `false` when no row has its id.
    pub fn update(&self, row: T) -> bool {
        let exists = {
            let state = self.lock();
            row.field(&state.id_field)
                .is_some_and(|id| state.rows.contains_key(id))
        };
        if exists {
            self.insert(row);
        }
        exists
    }

    /// Delete the row with `id`, returning it.
    pub fn delete(&self, id: &str) -> Option<T> {
        let mut state = self.lock();
        let old = state.rows.remove(id)?;
        state.broadcast(&DatabaseChange::delete(old.clone()));
        Some(old)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().rows.get(id).cloned()
    }

    /// All rows, ordered by id.
    #[must_use]
    pub fn rows(&self) -> Vec<T> {
        self.lock().rows.values().cloned().collect()
    }

    /// Rows whose `field` equals `key`, ordered by id.
    #[must_use]
    pub fn rows_where(&self, field: &str, key: &str) -> Vec<T> {
        self.lock()
            .rows
            .values()
            .filter(|row| row.field(field) == Some(key))
            .cloned()
            .collect()
    }

    /// Deliver `error` to every open change cursor.
    pub fn inject_error(&self, message: &str) {
        let state = self.lock();
        for subscriber in &state.subscribers {
            let _ = subscriber.sender.send(Err(JoinError::feed_message(message)));
        }
    }

    /// End every open change feed. Their cursors return `Ok(None)` once
    /// drained.
    pub fn end_feeds(&self) {
        self.lock().subscribers.clear();
    }

    /// Make snapshot requests fail.
    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    /// Make change cursors report an error when closed. They still count as
    /// closed.
    pub fn fail_closes(&self, fail: bool) {
        self.lock().fail_closes = fail;
    }

    /// Number of cursors opened so far.
    #[must_use]
    pub fn opened_cursors(&self) -> usize {
        self.lock().opened
    }

    /// Number of cursors opened but not closed yet.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        let state = self.lock();
        state.opened - state.closed
    }

    /// Number of live change subscriptions on partition `key`.
    #[must_use]
    pub fn partition_subscribers(&self, key: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| s.partition.as_ref().is_some_and(|(_, k)| k == key))
            .count()
    }

    /// View this table as right-side partitions keyed by `field`.
    #[must_use]
    pub fn partitioned_by(&self, field: impl Into<String>) -> PartitionedTable<T> {
        PartitionedTable {
            table: self.clone(),
            field: field.into(),
        }
    }

    fn open_snapshot(&self, rows: Vec<T>) -> Result<BoxCursor<T>, JoinError> {
        let mut state = self.lock();
        if state.fail_snapshots {
            return Err(JoinError::feed_message("snapshot unavailable"));
        }
        state.opened += 1;
        let table = self.clone();
        Ok(Box::new(VecCursor::new(rows).with_close_hook(move || {
            table.lock().closed += 1;
        })))
    }

    fn open_changes(&self, partition: Option<(String, String)>) -> BoxChangeCursor<DatabaseChange<T>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.opened += 1;
        state.subscribers.push(Subscriber {
            id,
            partition,
            sender,
        });
        Box::new(MemoryChangeCursor {
            table: self.clone(),
            id,
            receiver,
            closed: false,
        })
    }
}

impl<T: Row> TableState<T> {
    fn broadcast(&mut self, change: &DatabaseChange<T>) {
        self.subscribers.retain(|subscriber| {
            let Some(visible) = subscriber.view(change) else {
                return true;
            };
            subscriber.sender.send(Ok(visible)).is_ok()
        });
    }
}

impl<T: Row> Subscriber<T> {
    /// The part of `change` this subscriber can see.
    fn view(&self, change: &DatabaseChange<T>) -> Option<DatabaseChange<T>> {
        let Some((field, key)) = &self.partition else {
            return Some(change.clone());
        };
        let inside = |row: &Option<T>| {
            row.as_ref()
                .filter(|row| row.field(field) == Some(key.as_str()))
                .cloned()
        };
        let visible = DatabaseChange {
            old_val: inside(&change.old_val),
            new_val: inside(&change.new_val),
        };
        visible.kind().map(|_| visible)
    }
}

impl<T: Row> TableSource<T> for MemoryTable<T> {
    fn snapshot(&self) -> BoxFuture<'static, Result<BoxCursor<T>, JoinError>> {
        let cursor = self.open_snapshot(self.rows());
        Box::pin(async move { cursor })
    }

    fn changes(
        &self,
    ) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<T>>, JoinError>> {
        let cursor = self.open_changes(None);
        Box::pin(async move { Ok(cursor) })
    }
}

/// A `MemoryTable` split into partitions by one field.
pub struct PartitionedTable<T> {
    table: MemoryTable<T>,
    field: String,
}

impl<T: Row> PartitionSource<T> for PartitionedTable<T> {
    fn snapshot(&self, key: &str) -> BoxFuture<'static, Result<BoxCursor<T>, JoinError>> {
        let cursor = self
            .table
            .open_snapshot(self.table.rows_where(&self.field, key));
        Box::pin(async move { cursor })
    }

    fn changes(
        &self,
        key: &str,
    ) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<T>>, JoinError>> {
        let cursor = self
            .table
            .open_changes(Some((self.field.clone(), key.to_owned())));
        Box::pin(async move { Ok(cursor) })
    }
}

/// Change cursor fed by a `MemoryTable`.
struct MemoryChangeCursor<T> {
    table: MemoryTable<T>,
    id: u64,
    receiver: mpsc::UnboundedReceiver<FeedItem<T>>,
    closed: bool,
}

impl<T: Row> ChangeCursor<DatabaseChange<T>> for MemoryChangeCursor<T> {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<DatabaseChange<T>>, JoinError>> {
        Box::pin(async move {
            match self.receiver.recv().await {
                Some(item) => item.map(Some),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        let result = if self.closed {
            Ok(())
        } else {
            self.closed = true;
            self.receiver.close();
            let mut state = self.table.lock();
            state.subscribers.retain(|s| s.id != self.id);
            state.closed += 1;
            if state.fail_closes {
                Err(JoinError::feed_message("close failed"))
            } else {
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record;

    #[tokio::test]
    async fn test_change_cursor_sees_writes() {
        let table = MemoryTable::new("id");
        let mut cursor = TableSource::changes(&table).await.expect("open feed");

        table.insert(record(&[("id", "1"), ("name", "a")]));
        table.update(record(&[("id", "1"), ("name", "b")]));
        table.delete("1");

        let insert = cursor.next().await.expect("pull").expect("insert");
        assert_eq!(insert, DatabaseChange::insert(record(&[("id", "1"), ("name", "a")])));
        let update = cursor.next().await.expect("pull").expect("update");
        assert_eq!(
            update,
            DatabaseChange::update(
                record(&[("id", "1"), ("name", "a")]),
                record(&[("id", "1"), ("name", "b")])
            )
        );
        let delete = cursor.next().await.expect("pull").expect("delete");
        assert_eq!(delete, DatabaseChange::delete(record(&[("id", "1"), ("name", "b")])));

        cursor.close().await.expect("close");
        assert_eq!(table.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_partition_move_splits_into_delete_and_insert() {
        let table = MemoryTable::with_rows([record(&[("id", "r1"), ("group", "a")])]);
        let partitions = table.partitioned_by("group");
        let mut in_a = partitions.changes("a").await.expect("open a");
        let mut in_b = partitions.changes("b").await.expect("open b");

        table.update(record(&[("id", "r1"), ("group", "b")]));

        let left_a = in_a.next().await.expect("pull").expect("delete in a");
        assert_eq!(left_a, DatabaseChange::delete(record(&[("id", "r1"), ("group", "a")])));
        let entered_b = in_b.next().await.expect("pull").expect("insert in b");
        assert_eq!(entered_b, DatabaseChange::insert(record(&[("id", "r1"), ("group", "b")])));

        in_a.close().await.expect("close a");
        in_b.close().await.expect("close b");
        assert_eq!(table.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_counts_as_cursor() {
        let table = MemoryTable::with_rows([
            record(&[("id", "1"), ("group", "a")]),
            record(&[("id", "2"), ("group", "b")]),
        ]);
        let mut snapshot = table
            .partitioned_by("group")
            .snapshot("b")
            .await
            .expect("snapshot");
        assert_eq!(table.open_cursors(), 1);

        let rows = snapshot.to_array().await.expect("rows");
        assert_eq!(rows, vec![record(&[("id", "2"), ("group", "b")])]);
        assert_eq!(table.open_cursors(), 0);
        assert_eq!(table.opened_cursors(), 1);
    }

    #[tokio::test]
    async fn test_end_feeds_and_injected_errors() {
        let table: MemoryTable<crate::types::Record> = MemoryTable::new("id");
        let mut cursor = TableSource::changes(&table).await.expect("open feed");

        table.inject_error("done");
        let error = cursor.next().await.expect_err("injected error");
        assert_eq!(error.to_string(), "done");

        table.end_feeds();
        assert_eq!(cursor.next().await.expect("end"), None);
        cursor.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_failing_snapshot_and_close() {
        let table: MemoryTable<crate::types::Record> = MemoryTable::new("id");
        table.fail_snapshots(true);
        assert!(TableSource::snapshot(&table).await.is_err());

        table.fail_closes(true);
        let mut cursor = TableSource::changes(&table).await.expect("open feed");
        assert!(cursor.close().await.is_err());
        assert!(cursor.close().await.is_ok());
        assert_eq!(table.open_cursors(), 0);
    }
}
