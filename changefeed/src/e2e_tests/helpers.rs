//! Common helpers for end-to-end tests.
//!
//! Scripted sources hand out cursors that replay a fixed list of items.
//! Snapshot cursors end after their rows; change cursors stay pending once
//! their script runs out, like a live feed with no further writes. Every
//! cursor registers with a shared `Cursors` tracker so a test can assert that
//! teardown closed all of them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};

use crate::cursor::{BoxChangeCursor, BoxCursor, ChangeCursor, Cursor, PartitionSource, TableSource};
use crate::error::JoinError;
use crate::types::{DatabaseChange, DatabaseJoinChange, Record, record};

/// One scripted feed item.
pub type Step = Result<DatabaseChange<Record>, JoinError>;

/// A join event over plain records.
pub type Event = DatabaseJoinChange<Record, Record>;

/// The error scripted feeds end with.
pub fn done() -> JoinError {
    JoinError::feed_message("done")
}

pub fn row(fields: &[(&str, &str)]) -> Record {
    record(fields)
}

pub fn insert(fields: &[(&str, &str)]) -> Step {
    Ok(DatabaseChange::insert(record(fields)))
}

pub fn delete(fields: &[(&str, &str)]) -> Step {
    Ok(DatabaseChange::delete(record(fields)))
}

pub fn edit(old: &[(&str, &str)], new: &[(&str, &str)]) -> Step {
    Ok(DatabaseChange::update(record(old), record(new)))
}

/// Every cursor opened by the scripted sources of one test.
#[derive(Clone, Default)]
pub struct Cursors {
    opened: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Cursors {
    fn open(&self, name: String) -> usize {
        let mut opened = self.opened.lock().unwrap();
        opened.push((name, false));
        opened.len() - 1
    }

    fn close(&self, slot: usize) {
        self.opened.lock().unwrap()[slot].1 = true;
    }

    fn scripted<T>(&self, name: String, items: Vec<Result<T, JoinError>>, ends: bool) -> ScriptedCursor<T> {
        ScriptedCursor {
            items: items.into(),
            ends,
            cursors: self.clone(),
            slot: self.open(name),
            closed: false,
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Names of cursors not closed yet.
    pub fn still_open(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, closed)| !closed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Wait for teardown to close every cursor opened so far.
    pub async fn wait_all_closed(&self) {
        let closed = eventually(|| self.still_open().is_empty()).await;
        assert!(closed, "cursors still open: {:?}", self.still_open());
    }
}

/// Cursor replaying a script.
pub struct ScriptedCursor<T> {
    items: VecDeque<Result<T, JoinError>>,
    /// Snapshot cursors end when the script runs out; feeds stay pending.
    ends: bool,
    cursors: Cursors,
    slot: usize,
    closed: bool,
}

impl<T: Send> ChangeCursor<T> for ScriptedCursor<T> {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<T>, JoinError>> {
        let item = self.items.pop_front();
        let ends = self.ends;
        Box::pin(async move {
            match item {
                Some(item) => item.map(Some),
                None if ends => Ok(None),
                None => futures::future::pending().await,
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        if !self.closed {
            self.closed = true;
            self.cursors.close(self.slot);
        }
        Box::pin(async { Ok(()) })
    }
}

impl<T: Send> Cursor<T> for ScriptedCursor<T> {}

/// Left table with a fixed snapshot and a scripted change feed.
pub struct ScriptedTable {
    rows: Vec<Record>,
    changes: Vec<Step>,
    cursors: Cursors,
}

impl ScriptedTable {
    pub fn new(cursors: &Cursors, rows: Vec<Record>, changes: Vec<Step>) -> Self {
        Self {
            rows,
            changes,
            cursors: cursors.clone(),
        }
    }
}

impl TableSource<Record> for ScriptedTable {
    fn snapshot(&self) -> BoxFuture<'static, Result<BoxCursor<Record>, JoinError>> {
        let rows: Vec<Result<Record, JoinError>> = self.rows.iter().cloned().map(Ok).collect();
        let cursor: BoxCursor<Record> = Box::new(self.cursors.scripted("left table".to_string(), rows, true));
        Box::pin(async move { Ok(cursor) })
    }

    fn changes(&self) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<Record>>, JoinError>> {
        let cursor: BoxChangeCursor<DatabaseChange<Record>> = Box::new(self.cursors.scripted(
            "left table changes".to_string(),
            self.changes.clone(),
            false,
        ));
        Box::pin(async move { Ok(cursor) })
    }
}

/// Right table partitions with scripted snapshots and feeds per key.
pub struct ScriptedPartitions {
    rows: HashMap<String, Vec<Record>>,
    changes: HashMap<String, Vec<Step>>,
    cursors: Cursors,
}

impl ScriptedPartitions {
    pub fn new(cursors: &Cursors) -> Self {
        Self {
            rows: HashMap::new(),
            changes: HashMap::new(),
            cursors: cursors.clone(),
        }
    }

    #[must_use]
    pub fn with_rows(mut self, key: &str, rows: Vec<Record>) -> Self {
        self.rows.insert(key.to_string(), rows);
        self
    }

    #[must_use]
    pub fn with_changes(mut self, key: &str, changes: Vec<Step>) -> Self {
        self.changes.insert(key.to_string(), changes);
        self
    }
}

impl PartitionSource<Record> for ScriptedPartitions {
    fn snapshot(&self, key: &str) -> BoxFuture<'static, Result<BoxCursor<Record>, JoinError>> {
        let rows: Vec<Result<Record, JoinError>> = self
            .rows
            .get(key)
            .map(|rows| rows.iter().cloned().map(Ok).collect())
            .unwrap_or_default();
        let cursor: BoxCursor<Record> =
            Box::new(self.cursors.scripted(format!("right table rows (key: {key})"), rows, true));
        Box::pin(async move { Ok(cursor) })
    }

    fn changes(&self, key: &str) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<Record>>, JoinError>> {
        let changes = self.changes.get(key).cloned().unwrap_or_default();
        let cursor: BoxChangeCursor<DatabaseChange<Record>> = Box::new(self.cursors.scripted(
            format!("right table changes (key: {key})"),
            changes,
            false,
        ));
        Box::pin(async move { Ok(cursor) })
    }
}

/// Left table whose change feed is an existing cursor, such as the output
/// of another join. The feed can be opened once.
pub struct CursorTable {
    rows: Vec<Record>,
    feed: Mutex<Option<BoxChangeCursor<DatabaseChange<Record>>>>,
    cursors: Cursors,
}

impl CursorTable {
    pub fn new(cursors: &Cursors, rows: Vec<Record>, feed: impl ChangeCursor<DatabaseChange<Record>> + 'static) -> Self {
        Self {
            rows,
            feed: Mutex::new(Some(Box::new(feed))),
            cursors: cursors.clone(),
        }
    }
}

impl TableSource<Record> for CursorTable {
    fn snapshot(&self) -> BoxFuture<'static, Result<BoxCursor<Record>, JoinError>> {
        let rows: Vec<Result<Record, JoinError>> = self.rows.iter().cloned().map(Ok).collect();
        let cursor: BoxCursor<Record> = Box::new(self.cursors.scripted("joined table".to_string(), rows, true));
        Box::pin(async move { Ok(cursor) })
    }

    fn changes(&self) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<Record>>, JoinError>> {
        let feed = self.feed.lock().unwrap().take();
        Box::pin(async move { feed.ok_or_else(|| JoinError::feed_message("change feed already taken")) })
    }
}

/// Pull one item, failing the test if nothing arrives within five seconds.
pub async fn next_event<S>(stream: &mut S) -> Option<Result<Event, JoinError>>
where
    S: Stream<Item = Result<Event, JoinError>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a join event")
}

/// Pull until the stream fails or ends.
pub async fn drain<S>(stream: &mut S) -> (Vec<Event>, Option<JoinError>)
where
    S: Stream<Item = Result<Event, JoinError>> + Unpin,
{
    let mut events = Vec::new();
    loop {
        match next_event(stream).await {
            Some(Ok(event)) => events.push(event),
            Some(Err(error)) => return (events, Some(error)),
            None => return (events, None),
        }
    }
}

/// Assert nothing else is delivered for a short while.
pub async fn assert_quiet<S>(stream: &mut S)
where
    S: Stream<Item = Result<Event, JoinError>> + Unpin,
{
    let extra = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(extra.is_err(), "unexpected join output: {extra:?}");
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
