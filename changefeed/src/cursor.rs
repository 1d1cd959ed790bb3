//! Cursor and feed-source contracts.
//!
//! A change feed is consumed through a pull cursor: each `next()` resolves to
//! one item, `Ok(None)` once the feed has ended. Cursors own an upstream
//! resource and must be closed exactly once by whoever owns them.
//!
//! # Cancellation
//!
//! Dropping an outstanding `next()` future must be safe. The join engine
//! relies on this to close a cursor while a pull is in flight: it drops the
//! pending pull, then awaits `close()`.

use std::collections::VecDeque;

use futures::future::BoxFuture;

use crate::error::JoinError;
use crate::types::DatabaseChange;

/// Pull-driven, closeable change feed.
pub trait ChangeCursor<T>: Send {
    /// Pull the next item. `Ok(None)` means the feed has ended.
    fn next(&mut self) -> BoxFuture<'_, Result<Option<T>, JoinError>>;

    /// Release the underlying resource.
    fn close(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// A snapshot cursor: all current rows of a table or partition.
pub trait Cursor<T: Send>: ChangeCursor<T> {
    /// Drain every remaining row, then close the cursor.
    ///
    /// The cursor is closed on failure as well; the pull error wins over a
    /// close error.
    fn to_array(&mut self) -> BoxFuture<'_, Result<Vec<T>, JoinError>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            loop {
                match self.next().await {
                    Ok(Some(row)) => rows.push(row),
                    Ok(None) => break,
                    Err(e) => {
                        if let Err(close_error) = self.close().await {
                            tracing::warn!("failed to close snapshot cursor: {close_error}");
                        }
                        return Err(e);
                    }
                }
            }
            self.close().await?;
            Ok(rows)
        })
    }
}

pub type BoxChangeCursor<T> = Box<dyn ChangeCursor<T>>;
pub type BoxCursor<T> = Box<dyn Cursor<T>>;

/// Feed factories for the left table.
pub trait TableSource<T>: Send + Sync + 'static {
    /// Open a snapshot of every current row.
    fn snapshot(&self) -> BoxFuture<'static, Result<BoxCursor<T>, JoinError>>;

    /// Open the delta stream for the whole table.
    fn changes(&self)
    -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<T>>, JoinError>>;
}

/// Feed factories for right-table partitions, one per join-key value.
pub trait PartitionSource<T>: Send + Sync + 'static {
    /// Open a snapshot of the rows whose join key equals `key`.
    fn snapshot(&self, key: &str) -> BoxFuture<'static, Result<BoxCursor<T>, JoinError>>;

    /// Open the delta stream of the partition `key`.
    fn changes(
        &self,
        key: &str,
    ) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<T>>, JoinError>>;
}

/// Snapshot cursor over rows already in memory.
///
/// The optional close hook runs once, on the first `close()`.
pub struct VecCursor<T> {
    rows: VecDeque<T>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> VecCursor<T> {
    #[must_use]
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows: rows.into(),
            on_close: None,
        }
    }

    #[must_use]
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl<T: Send> ChangeCursor<T> for VecCursor<T> {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<T>, JoinError>> {
        let row = self.rows.pop_front();
        Box::pin(async move { Ok(row) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        self.rows.clear();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
        Box::pin(async { Ok(()) })
    }
}

impl<T: Send> Cursor<T> for VecCursor<T> {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_to_array_drains_and_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let mut cursor = VecCursor::new(vec![1, 2, 3])
            .with_close_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let rows = cursor.to_array().await.expect("snapshot should drain");
        assert_eq!(rows, vec![1, 2, 3]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        cursor.close().await.expect("second close is a no-op");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_next_after_end_keeps_returning_none() {
        let mut cursor = VecCursor::new(vec!["a"]);
        assert_eq!(cursor.next().await.expect("pull"), Some("a"));
        assert_eq!(cursor.next().await.expect("pull"), None);
        assert_eq!(cursor.next().await.expect("pull"), None);
    }
}
