//! One live right-table subscription per join-key value.
//!
//! A partition task owns its change cursor and pulls right deltas until it
//! is cancelled, the feed ends, or the feed fails. Each delta is joined with
//! the left row currently stored in the partition's cell, so right-side
//! events always carry the latest known left row.
//!
//! The task holds no reference to the engine: only the output subject, the
//! left cell and the row maps. Dropping the `Partition` handle cancels it.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cursor::BoxChangeCursor;
use crate::error::JoinError;
use crate::subject::Subject;
use crate::types::{DatabaseChange, DatabaseJoinChange, JoinedRow, Row};

pub type RowMap<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Left/right row maps applied to every emitted join delta.
pub struct RowMaps<L, R> {
    pub left: RowMap<L>,
    pub right: RowMap<R>,
}

impl<L, R> Clone for RowMaps<L, R> {
    fn clone(&self) -> Self {
        Self {
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
        }
    }
}

impl<L: Row, R: Row> RowMaps<L, R> {
    pub fn joined(&self, left: L, right: R) -> JoinedRow<L, R> {
        JoinedRow {
            left: (self.left)(left),
            right: (self.right)(right),
        }
    }

    /// Join a right delta with `left`. `None` when the delta is empty.
    pub fn join_change(
        &self,
        left: &L,
        change: DatabaseChange<R>,
    ) -> Option<DatabaseJoinChange<L, R>> {
        if change.kind().is_none() {
            return None;
        }
        Some(DatabaseJoinChange {
            old_val: change.old_val.map(|right| self.joined(left.clone(), right)),
            new_val: change.new_val.map(|right| self.joined(left.clone(), right)),
        })
    }
}

/// Handle to a running partition task.
pub struct Partition<L> {
    /// Left row the partition's deltas are joined with.
    left: Arc<RwLock<L>>,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<Result<(), JoinError>>,
}

impl<L: Row> Partition<L> {
    /// Spawn the pull loop for `key` over an already opened cursor.
    pub fn spawn<R: Row>(
        key: String,
        cursor: BoxChangeCursor<DatabaseChange<R>>,
        left: L,
        subject: Subject<DatabaseJoinChange<L, R>>,
        maps: RowMaps<L, R>,
    ) -> Self {
        let left = Arc::new(RwLock::new(left));
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(run(
            key,
            cursor,
            Arc::clone(&left),
            subject,
            maps,
            cancelled,
        ));
        Self { left, cancel, task }
    }

    /// Replace the stored left row.
    pub fn set_left(&self, row: L) {
        *self.left.write().unwrap_or_else(PoisonError::into_inner) = row;
    }

    /// Signal the task to stop and close its cursor.
    ///
    /// The returned handle resolves to the result of closing the cursor.
    pub fn cancel(self) -> JoinHandle<Result<(), JoinError>> {
        // The task may already have stopped on its own.
        let _ = self.cancel.send(());
        self.task
    }

    /// Cancel and wait for the cursor to be closed.
    pub async fn close(self) -> Result<(), JoinError> {
        flatten(self.cancel().await)
    }
}

/// Fold a task panic or abort into a close error.
pub fn flatten(
    result: Result<Result<(), JoinError>, tokio::task::JoinError>,
) -> Result<(), JoinError> {
    result.unwrap_or_else(|task_error| Err(JoinError::close(task_error)))
}

async fn run<L: Row, R: Row>(
    key: String,
    mut cursor: BoxChangeCursor<DatabaseChange<R>>,
    left: Arc<RwLock<L>>,
    subject: Subject<DatabaseJoinChange<L, R>>,
    maps: RowMaps<L, R>,
    mut cancelled: oneshot::Receiver<()>,
) -> Result<(), JoinError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut cancelled => break,
            next = cursor.next() => next,
        };
        match next {
            Ok(Some(change)) => {
                let current = left.read().unwrap_or_else(PoisonError::into_inner).clone();
                match maps.join_change(&current, change) {
                    Some(event) => {
                        tracing::trace!("right delta on partition {key}");
                        subject.publish(event);
                    }
                    None => subject.error(JoinError::EmptyChange),
                }
            }
            Ok(None) => {
                tracing::debug!("right feed for partition {key} ended");
                break;
            }
            Err(e) => {
                tracing::debug!("right feed for partition {key} failed: {e}");
                subject.error(e);
                break;
            }
        }
    }

    cursor.close().await.map_err(|e| {
        tracing::warn!("failed to close right cursor for partition {key}: {e}");
        JoinError::close(e)
    })
}
