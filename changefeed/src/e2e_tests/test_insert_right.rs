//! Right inserts are joined with the partition's left row.

use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, done, drain, insert, row};
use crate::join::JoinChangeListener;
use crate::types::DatabaseJoinChange;

#[tokio::test]
async fn test_insert_right_emits_joined_insert() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors).with_changes(
            "6",
            vec![insert(&[("id", "2"), ("userId", "6"), ("name", "nr2")]), Err(done())],
        ),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(
        events,
        vec![DatabaseJoinChange::inserted(
            row(&[("id", "6")]),
            row(&[("id", "2"), ("userId", "6"), ("name", "nr2")]),
        )]
    );
    assert_eq!(error.unwrap().to_string(), "done");

    // A right feed error only stops that partition.
    assert!(engine.is_running());

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_start_does_not_emit_existing_pairs() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")]), row(&[("id", "7")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors)
            .with_rows("6", vec![row(&[("id", "1"), ("userId", "6")])])
            .with_rows("7", vec![row(&[("id", "2"), ("userId", "7")])])
            .with_changes("7", vec![Err(done())]),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();
    assert_eq!(engine.subscribed_keys(), vec!["6".to_string(), "7".to_string()]);

    let (events, error) = drain(&mut stream).await;
    assert!(events.is_empty());
    assert_eq!(error.unwrap().to_string(), "done");

    drop(stream);
    cursors.wait_all_closed().await;
}
