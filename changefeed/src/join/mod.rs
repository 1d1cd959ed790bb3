//! Streaming equi-join over a left change feed and per-key right partitions.
//!
//! `JoinChangeListener` keeps exactly one right subscription per distinct
//! left join-key value and turns left and right deltas into
//! `DatabaseJoinChange` events on a single output `Subject`.
//!
//! # Lifecycle
//!
//! `Created -> Running -> Completed | Errored`. `start` moves the engine to
//! `Running`; teardown (consumer disconnect or `complete`) and unrecoverable
//! left-side errors make it terminal. A terminal engine cannot be restarted.
//!
//! # Left deltas
//!
//! | delta | effect |
//! |---|---|
//! | insert | emit one insert per right row of the new key, then follow that partition |
//! | delete | emit one delete per right row of the old key, then close that partition |
//! | update, same key | replace the stored left row, emit nothing |
//! | update, new key | delete for the old key, then insert for the new key |
//! | empty | protocol violation |
//!
//! # Invariants
//!
//! - The key map only holds partitions whose cursors are open or closing.
//! - Every cursor the engine opens is closed exactly once, by the task that
//!   owns it.
//! - The engine never publishes while holding its state lock. A publish can
//!   run the subject's teardown hook, which locks the state again.
//!
//! # Limitations
//!
//! Only one left row is tracked per key. If several left rows share a join
//! key, the last one subscribed wins and a delete of any of them closes the
//! shared partition.
//!
//! A left delete closes the partition's feed before reading its snapshot.
//! A right write landing between the two is not seen as a delta, so the
//! retractions follow the snapshot rather than what was emitted.

mod partition;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;

use crate::cursor::{BoxChangeCursor, PartitionSource, TableSource};
use crate::error::JoinError;
use crate::subject::{Subject, SubjectCursor, SubjectStream};
use crate::types::{DatabaseChange, DatabaseJoinChange, Row};

pub use partition::RowMap;
use partition::{Partition, RowMaps, flatten};

/// Cursor over a join's output, mapped to `U`.
pub type JoinCursor<L, R, U = DatabaseJoinChange<L, R>> = SubjectCursor<DatabaseJoinChange<L, R>, U>;

/// Stream over a join's output, mapped to `U`.
pub type JoinStream<L, R, U = DatabaseJoinChange<L, R>> = SubjectStream<DatabaseJoinChange<L, R>, U>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Completed,
    Errored,
}

struct EngineState<L> {
    phase: Phase,
    /// Cancels the left delta loop.
    left_loop: Option<oneshot::Sender<()>>,
    /// Join-key value -> right subscription.
    partitions: HashMap<String, Partition<L>>,
}

struct Inner<L, R> {
    left_source: Box<dyn TableSource<L>>,
    left_key: String,
    right_source: Box<dyn PartitionSource<R>>,
    right_key: String,
    maps: RowMaps<L, R>,
    subject: Subject<DatabaseJoinChange<L, R>>,
    state: Mutex<EngineState<L>>,
}

/// Builder for a `JoinChangeListener` with optional row maps.
pub struct JoinBuilder<L, R> {
    left_source: Box<dyn TableSource<L>>,
    left_key: String,
    right_source: Box<dyn PartitionSource<R>>,
    right_key: String,
    left_map: Option<RowMap<L>>,
    right_map: Option<RowMap<R>>,
}

impl<L: Row, R: Row> JoinBuilder<L, R> {
    /// Map every left row before it is emitted. Keys are read from the
    /// unmapped row.
    #[must_use]
    pub fn left_map(mut self, map: impl Fn(L) -> L + Send + Sync + 'static) -> Self {
        self.left_map = Some(Arc::new(map));
        self
    }

    /// Map every right row before it is emitted.
    #[must_use]
    pub fn right_map(mut self, map: impl Fn(R) -> R + Send + Sync + 'static) -> Self {
        self.right_map = Some(Arc::new(map));
        self
    }

    #[must_use]
    pub fn build(self) -> JoinChangeListener<L, R> {
        let maps = RowMaps {
            left: self.left_map.unwrap_or_else(|| Arc::new(|row| row)),
            right: self.right_map.unwrap_or_else(|| Arc::new(|row| row)),
        };
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<L, R>>| {
            let weak = Weak::clone(weak);
            let subject = Subject::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!("join output torn down");
                    inner.shutdown(Phase::Completed);
                }
            });
            Inner {
                left_source: self.left_source,
                left_key: self.left_key,
                right_source: self.right_source,
                right_key: self.right_key,
                maps,
                subject,
                state: Mutex::new(EngineState {
                    phase: Phase::Created,
                    left_loop: None,
                    partitions: HashMap::new(),
                }),
            }
        });
        JoinChangeListener { inner }
    }
}

/// Streaming equi-join engine.
///
/// `left.<left_key> == right.<right_key>`. Consume the output through
/// exactly one of `create_cursor` / `create_stream` (or their mapped forms).
pub struct JoinChangeListener<L, R> {
    inner: Arc<Inner<L, R>>,
}

impl<L: Row, R: Row> JoinChangeListener<L, R> {
    pub fn new(
        left_source: impl TableSource<L>,
        left_key: impl Into<String>,
        right_source: impl PartitionSource<R>,
        right_key: impl Into<String>,
    ) -> Self {
        Self::builder(left_source, left_key, right_source, right_key).build()
    }

    pub fn builder(
        left_source: impl TableSource<L>,
        left_key: impl Into<String>,
        right_source: impl PartitionSource<R>,
        right_key: impl Into<String>,
    ) -> JoinBuilder<L, R> {
        JoinBuilder {
            left_source: Box::new(left_source),
            left_key: left_key.into(),
            right_source: Box::new(right_source),
            right_key: right_key.into(),
            left_map: None,
            right_map: None,
        }
    }

    /// Load the left snapshot, follow the right partition of every left row
    /// (without emitting it), then follow the left change feed.
    ///
    /// A failure is delivered on the output stream and also returned.
    ///
    /// # Pre-conditions
    ///
    /// - Called inside a tokio runtime
    /// - The output consumer is created first if the start error should be
    ///   observed on it
    ///
    /// # Post-conditions
    ///
    /// - On success every left row's partition is followed and the left loop
    ///   is running
    /// - On failure the engine is terminal and every opened cursor is being
    ///   closed
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call, otherwise the first snapshot or
    /// feed error.
    pub async fn start(&self) -> Result<(), JoinError> {
        {
            let mut state = self.inner.lock();
            if state.phase != Phase::Created {
                return Err(JoinError::AlreadyStarted);
            }
            state.phase = Phase::Running;
        }

        match Inner::start(&self.inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!("join listener failed to start: {e}");
                self.inner.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Close every subscription and make the engine terminal. Idempotent.
    pub fn complete(&self) {
        self.inner.shutdown(Phase::Completed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().phase == Phase::Running
    }

    /// Join-key values with an open right subscription, sorted.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().partitions.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn create_cursor(&self) -> JoinCursor<L, R> {
        self.inner.subject.create_cursor()
    }

    #[must_use]
    pub fn create_mapped_cursor<U: 'static>(
        &self,
        map: impl Fn(DatabaseJoinChange<L, R>) -> U + Send + Sync + 'static,
    ) -> JoinCursor<L, R, U> {
        self.inner.subject.create_mapped_cursor(map)
    }

    #[must_use]
    pub fn create_stream(&self) -> JoinStream<L, R> {
        self.inner.subject.create_stream()
    }

    #[must_use]
    pub fn create_mapped_stream<U: 'static>(
        &self,
        map: impl Fn(DatabaseJoinChange<L, R>) -> U + Send + Sync + 'static,
    ) -> JoinStream<L, R, U> {
        self.inner.subject.create_mapped_stream(map)
    }
}

impl<L: Row, R: Row> Inner<L, R> {
    fn lock(&self) -> MutexGuard<'_, EngineState<L>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    fn key_of<T: Row>(row: &T, field: &str) -> Result<String, JoinError> {
        row.field(field)
            .map(str::to_owned)
            .ok_or_else(|| JoinError::MissingKey {
                field: field.to_owned(),
            })
    }

    async fn start(this: &Arc<Self>) -> Result<(), JoinError> {
        let rows = this.left_source.snapshot().await?.to_array().await?;
        tracing::debug!("join listener starting with {} left rows", rows.len());

        for row in rows {
            let key = Self::key_of(&row, &this.left_key);
            match key {
                Ok(key) => this.subscribe(key, row, false).await?,
                Err(e) => this.subject.error(e),
            }
        }

        let cursor = this.left_source.changes().await?;
        let (cancel, cancelled) = oneshot::channel();
        let running = {
            let mut state = this.lock();
            if state.phase == Phase::Running {
                state.left_loop = Some(cancel);
                true
            } else {
                false
            }
        };
        if running {
            tokio::spawn(Arc::clone(this).run_left(cursor, cancelled));
        } else {
            this.close_left(cursor).await;
        }
        Ok(())
    }

    async fn run_left(
        self: Arc<Self>,
        mut cursor: BoxChangeCursor<DatabaseChange<L>>,
        mut cancelled: oneshot::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut cancelled => break,
                next = cursor.next() => next,
            };
            match next {
                Ok(Some(change)) => {
                    if !self.is_running() {
                        break;
                    }
                    if let Err(e) = self.apply(change).await {
                        if e.is_protocol_violation() {
                            tracing::debug!("left delta rejected: {e}");
                            self.subject.error(e);
                        } else {
                            self.fail(e);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!("left feed ended");
                    self.subject.complete();
                    break;
                }
                Err(e) => {
                    tracing::debug!("left feed failed: {e}");
                    self.fail(e);
                    break;
                }
            }
        }
        self.close_left(cursor).await;
    }

    async fn close_left(&self, mut cursor: BoxChangeCursor<DatabaseChange<L>>) {
        if let Err(e) = cursor.close().await {
            tracing::warn!("failed to close left change cursor: {e}");
            self.subject.error(JoinError::close(e));
        }
    }

    async fn apply(&self, change: DatabaseChange<L>) -> Result<(), JoinError> {
        match (change.old_val, change.new_val) {
            (None, Some(new)) => {
                let key = Self::key_of(&new, &self.left_key)?;
                tracing::trace!("left insert on {key}");
                self.subscribe(key, new, true).await
            }
            (Some(old), None) => {
                let key = Self::key_of(&old, &self.left_key)?;
                tracing::trace!("left delete on {key}");
                self.unsubscribe(&key, old).await
            }
            (Some(old), Some(new)) => {
                let old_key = Self::key_of(&old, &self.left_key)?;
                let new_key = Self::key_of(&new, &self.left_key)?;
                if old_key == new_key {
                    self.refresh(&new_key, new);
                    return Ok(());
                }
                tracing::trace!("left rekey {old_key} -> {new_key}");
                if let Err(e) = self.unsubscribe(&old_key, old).await {
                    if !e.is_protocol_violation() {
                        return Err(e);
                    }
                    self.subject.error(e);
                }
                self.subscribe(new_key, new, true).await
            }
            (None, None) => Err(JoinError::EmptyChange),
        }
    }

    /// Follow the partition `key` joined with `left`, optionally emitting an
    /// insert for every right row already in it.
    async fn subscribe(&self, key: String, left: L, include_initial: bool) -> Result<(), JoinError> {
        let reused = {
            let state = self.lock();
            if let Some(partition) = state.partitions.get(&key) {
                partition.set_left(left.clone());
                true
            } else {
                false
            }
        };
        if reused {
            tracing::debug!("reusing right subscription for {}={key}", self.right_key);
            if include_initial {
                let rows = self.partition_rows(&key).await?;
                self.emit_inserts(&left, rows);
            }
            return Ok(());
        }

        // Open the feed before reading the snapshot so no delta falls in
        // between; anything that lands meanwhile waits in the cursor.
        let mut cursor = self.right_source.changes(&key).await?;
        if include_initial {
            match self.partition_rows(&key).await {
                Ok(rows) => self.emit_inserts(&left, rows),
                Err(e) => {
                    if let Err(close_error) = cursor.close().await {
                        tracing::warn!("failed to close right cursor for {key}: {close_error}");
                    }
                    return Err(e);
                }
            }
        }

        let rejected = {
            let mut state = self.lock();
            if state.phase == Phase::Running {
                let partition = Partition::spawn(
                    key.clone(),
                    cursor,
                    left,
                    self.subject.clone(),
                    self.maps.clone(),
                );
                state.partitions.insert(key, partition);
                None
            } else {
                Some(cursor)
            }
        };
        if let Some(mut cursor) = rejected {
            if let Err(e) = cursor.close().await {
                self.subject.error(JoinError::close(e));
            }
        }
        Ok(())
    }

    /// Stop following `key`, emitting a delete for every right row in it.
    async fn unsubscribe(&self, key: &str, left: L) -> Result<(), JoinError> {
        let partition = self.lock().partitions.remove(key);
        let Some(partition) = partition else {
            return Err(JoinError::UnknownKey {
                field: self.right_key.clone(),
                key: key.to_owned(),
            });
        };

        // Stop the partition first so no right delta joined with `left` is
        // published after the retractions.
        if let Err(e) = partition.close().await {
            self.subject.error(e);
        }
        let rows = self.partition_rows(key).await?;
        self.emit_deletes(&left, rows);
        Ok(())
    }

    fn refresh(&self, key: &str, left: L) {
        let state = self.lock();
        match state.partitions.get(key) {
            Some(partition) => partition.set_left(left),
            None => tracing::debug!("left update for {key} without a right subscription"),
        }
    }

    async fn partition_rows(&self, key: &str) -> Result<Vec<R>, JoinError> {
        self.right_source.snapshot(key).await?.to_array().await
    }

    fn emit_inserts(&self, left: &L, rows: Vec<R>) {
        for right in rows {
            let joined = self.maps.joined(left.clone(), right);
            self.subject.publish(DatabaseJoinChange {
                old_val: None,
                new_val: Some(joined),
            });
        }
    }

    fn emit_deletes(&self, left: &L, rows: Vec<R>) {
        for right in rows {
            let joined = self.maps.joined(left.clone(), right);
            self.subject.publish(DatabaseJoinChange {
                old_val: Some(joined),
                new_val: None,
            });
        }
    }

    /// Report an unrecoverable error, then release everything.
    fn fail(&self, error: JoinError) {
        self.subject.error(error);
        self.shutdown(Phase::Errored);
    }

    /// Cancel the left loop and every partition. Partition cursors are
    /// closed in the background; close failures go to the output stream.
    fn shutdown(&self, phase: Phase) {
        let (left_loop, partitions) = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Created | Phase::Running) {
                state.phase = phase;
            }
            let partitions: Vec<(String, Partition<L>)> = state.partitions.drain().collect();
            (state.left_loop.take(), partitions)
        };

        if let Some(cancel) = left_loop {
            let _ = cancel.send(());
        }
        if partitions.is_empty() {
            return;
        }
        tracing::debug!("closing {} right subscriptions", partitions.len());

        let closing: Vec<_> = partitions
            .into_iter()
            .map(|(key, partition)| (key, partition.cancel()))
            .collect();
        // Without a runtime the tasks still close their cursors; only the
        // close errors go unreported.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let subject = self.subject.clone();
        runtime.spawn(async move {
            for (key, task) in closing {
                if let Err(e) = flatten(task.await) {
                    tracing::warn!("failed to close right subscription {key}: {e}");
                    subject.error(e);
                }
            }
        });
    }
}
