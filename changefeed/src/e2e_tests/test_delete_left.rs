//! Left deletes retract every pair of the old key. Protocol violations are
//! reported without stopping the left loop.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::cursor::{BoxChangeCursor, BoxCursor, PartitionSource};
use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, delete, done, drain, eventually, insert, next_event, row};
use crate::error::JoinError;
use crate::join::JoinChangeListener;
use crate::memory::{MemoryTable, PartitionedTable};
use crate::types::{DatabaseChange, DatabaseJoinChange, Record, record};

/// Partitions of a `MemoryTable` that record, whenever a snapshot is opened,
/// how many change feeds were live on that partition.
struct FeedCountingPartitions {
    table: MemoryTable<Record>,
    partitions: PartitionedTable<Record>,
    live_feeds: Arc<Mutex<Vec<usize>>>,
}

impl PartitionSource<Record> for FeedCountingPartitions {
    fn snapshot(&self, key: &str) -> BoxFuture<'static, Result<BoxCursor<Record>, JoinError>> {
        self.live_feeds.lock().unwrap().push(self.table.partition_subscribers(key));
        self.partitions.snapshot(key)
    }

    fn changes(
        &self,
        key: &str,
    ) -> BoxFuture<'static, Result<BoxChangeCursor<DatabaseChange<Record>>, JoinError>> {
        self.partitions.changes(key)
    }
}

#[tokio::test]
async fn test_delete_left_retracts_right_rows() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")])], vec![delete(&[("id", "6")]), Err(done())]),
        "id",
        ScriptedPartitions::new(&cursors).with_rows("6", vec![row(&[("id", "2"), ("userId", "6"), ("name", "nr2")])]),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(
        events,
        vec![DatabaseJoinChange::deleted(
            row(&[("id", "6")]),
            row(&[("id", "2"), ("userId", "6"), ("name", "nr2")]),
        )]
    );
    assert_eq!(error.unwrap().to_string(), "done");
    assert!(engine.subscribed_keys().is_empty());

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_delete_unknown_key_reports_error_and_keeps_going() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(
            &cursors,
            vec![],
            vec![insert(&[("id", "7")]), delete(&[("id", "9")]), insert(&[("id", "8")])],
        ),
        "id",
        ScriptedPartitions::new(&cursors).with_rows("7", vec![row(&[("id", "r7"), ("userId", "7")])]),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let first = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        first,
        DatabaseJoinChange::inserted(row(&[("id", "7")]), row(&[("id", "r7"), ("userId", "7")]))
    );

    let error = next_event(&mut stream).await.unwrap().unwrap_err();
    assert!(matches!(error, JoinError::UnknownKey { ref key, .. } if key == "9"));
    assert_eq!(
        error.to_string(),
        "unknown row in destination table with userId: \"9\""
    );

    // The stream is finished for the consumer but the engine is not.
    assert!(next_event(&mut stream).await.is_none());
    assert!(engine.is_running());
    assert!(
        eventually(|| engine.subscribed_keys() == vec!["7".to_string(), "8".to_string()]).await
    );

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_empty_left_change_is_a_protocol_violation() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(
            &cursors,
            vec![],
            vec![
                insert(&[("id", "7")]),
                Ok(DatabaseChange {
                    old_val: None,
                    new_val: None,
                }),
                insert(&[("id", "8")]),
            ],
        ),
        "id",
        ScriptedPartitions::new(&cursors).with_rows("7", vec![row(&[("id", "r7"), ("userId", "7")])]),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(error, Some(JoinError::EmptyChange)));
    assert!(eventually(|| engine.subscribed_keys().len() == 2).await);

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_left_row_without_key_is_reported() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("name", "no key")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert!(events.is_empty());
    assert_eq!(error.unwrap().to_string(), "row has no join key field \"id\"");

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_delete_left_stops_partition_before_reading_rows() {
    let users = MemoryTable::new("id");
    let members = MemoryTable::with_rows([record(&[("id", "m1"), ("team", "a")])]);
    let live_feeds = Arc::new(Mutex::new(Vec::new()));
    let engine = JoinChangeListener::new(
        users.clone(),
        "team",
        FeedCountingPartitions {
            table: members.clone(),
            partitions: members.partitioned_by("team"),
            live_feeds: Arc::clone(&live_feeds),
        },
        "team",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    users.insert(record(&[("id", "u1"), ("team", "a")]));
    let inserted = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        inserted,
        DatabaseJoinChange::inserted(record(&[("id", "u1"), ("team", "a")]), record(&[("id", "m1"), ("team", "a")]))
    );

    users.delete("u1");
    let deleted = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        deleted,
        DatabaseJoinChange::deleted(record(&[("id", "u1"), ("team", "a")]), record(&[("id", "m1"), ("team", "a")]))
    );

    // The insert read its rows with the feed already open; the delete read
    // them only after the feed was closed.
    assert_eq!(*live_feeds.lock().unwrap(), vec![1, 0]);
    assert_eq!(members.partition_subscribers("a"), 0);

    drop(stream);
    assert!(eventually(|| users.open_cursors() == 0 && members.open_cursors() == 0).await);
}
