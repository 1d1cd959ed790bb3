//! Engine lifecycle: start, completion, consumer disconnect and close
//! failures.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;

use crate::cursor::ChangeCursor;
use crate::e2e_tests::helpers::{eventually, next_event};
use crate::error::JoinError;
use crate::join::JoinChangeListener;
use crate::memory::{MemoryTable, PartitionedTable};
use crate::types::{DatabaseJoinChange, Record, record};

fn tables() -> (MemoryTable<Record>, MemoryTable<Record>) {
    let users = MemoryTable::with_rows([
        record(&[("id", "u1"), ("team", "a")]),
        record(&[("id", "u2"), ("team", "b")]),
    ]);
    let members = MemoryTable::with_rows([
        record(&[("id", "m1"), ("team", "a")]),
        record(&[("id", "m2"), ("team", "c")]),
    ]);
    (users, members)
}

fn join(users: &MemoryTable<Record>, members: &MemoryTable<Record>) -> JoinChangeListener<Record, Record> {
    let partitions: PartitionedTable<Record> = members.partitioned_by("team");
    JoinChangeListener::new(users.clone(), "team", partitions, "team")
}

async fn all_closed(users: &MemoryTable<Record>, members: &MemoryTable<Record>) -> bool {
    eventually(|| users.open_cursors() == 0 && members.open_cursors() == 0).await
}

#[tokio::test]
async fn test_dropping_stream_closes_every_cursor() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let stream = engine.create_stream();
    engine.start().await.unwrap();
    assert_eq!(engine.subscribed_keys(), vec!["a".to_string(), "b".to_string()]);
    assert!(users.open_cursors() > 0);

    drop(stream);
    assert!(!engine.is_running());
    assert!(engine.subscribed_keys().is_empty());
    assert!(all_closed(&users, &members).await);
}

#[tokio::test]
async fn test_cursor_close_is_idempotent() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let mut cursor = engine.create_cursor();
    engine.start().await.unwrap();

    cursor.close().await.unwrap();
    cursor.close().await.unwrap();
    // Nobody was waiting, so teardown waits for the end marker to drain.
    assert!(engine.is_running());

    assert!(cursor.next().await.unwrap().is_none());
    assert!(!engine.is_running());
    assert!(all_closed(&users, &members).await);

    cursor.close().await.unwrap();
    drop(cursor);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_cursor_close_while_waiting_tears_down() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let mut cursor = engine.create_cursor();
    engine.start().await.unwrap();

    let (tx, rx) = oneshot::channel();
    cursor.next_with(move |result| {
        let _ = tx.send(result.is_ok());
    });
    cursor.close().await.unwrap();

    assert!(!engine.is_running());
    assert!(all_closed(&users, &members).await);
    // The end marker never reaches the callback.
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_callback_cursor_receives_left_insert() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let cursor = engine.create_cursor();
    engine.start().await.unwrap();

    let (tx, rx) = oneshot::channel();
    cursor.next_with(move |result| {
        let _ = tx.send(result);
    });
    users.insert(record(&[("id", "u3"), ("team", "c")]));

    let event = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DatabaseJoinChange::inserted(
            record(&[("id", "u3"), ("team", "c")]),
            record(&[("id", "m2"), ("team", "c")]),
        )
    );

    drop(cursor);
    assert!(all_closed(&users, &members).await);
}

#[tokio::test]
async fn test_complete_is_idempotent_and_final() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    engine.start().await.unwrap();

    engine.complete();
    engine.complete();
    assert!(!engine.is_running());
    assert!(all_closed(&users, &members).await);
    assert!(matches!(engine.start().await, Err(JoinError::AlreadyStarted)));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let _stream = engine.create_stream();
    engine.start().await.unwrap();
    assert!(matches!(engine.start().await, Err(JoinError::AlreadyStarted)));
    assert!(engine.is_running());
}

#[tokio::test]
async fn test_start_failure_is_returned_and_streamed() {
    let (users, members) = tables();
    users.fail_snapshots(true);
    let engine = join(&users, &members);
    let mut stream = engine.create_stream();

    let error = engine.start().await.unwrap_err();
    assert_eq!(error.to_string(), "snapshot unavailable");

    let streamed = next_event(&mut stream).await.unwrap().unwrap_err();
    assert_eq!(streamed.to_string(), "snapshot unavailable");
    assert!(!engine.is_running());
    assert!(all_closed(&users, &members).await);
}

#[tokio::test]
async fn test_close_failures_are_reported_without_stopping_the_sweep() {
    let (users, members) = tables();
    members.fail_closes(true);
    let engine = join(&users, &members);
    let mut cursor = engine.create_cursor();
    engine.start().await.unwrap();

    engine.complete();
    let error = tokio::time::timeout(Duration::from_secs(5), cursor.next())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(error, JoinError::Close(_)));
    assert_eq!(error.to_string(), "failed to close cursor: close failed");
    assert!(all_closed(&users, &members).await);
}

#[tokio::test]
async fn test_left_feed_end_completes_output() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    users.end_feeds();
    let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap();
    assert!(end.is_none());
    assert!(!engine.is_running());
    assert!(all_closed(&users, &members).await);
}

#[tokio::test]
async fn test_right_feed_error_only_stops_its_partition() {
    let (users, members) = tables();
    let engine = join(&users, &members);
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    users.insert(record(&[("id", "u3"), ("team", "c")]));
    let first = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(first.new_val.map(|joined| joined.right), Some(record(&[("id", "m2"), ("team", "c")])));

    members.inject_error("partition lost");
    let error = next_event(&mut stream).await.unwrap().unwrap_err();
    assert_eq!(error.to_string(), "partition lost");
    assert!(engine.is_running());

    drop(stream);
    assert!(all_closed(&users, &members).await);
}
