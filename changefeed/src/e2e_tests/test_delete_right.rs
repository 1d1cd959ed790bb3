//! Right deletes become joined deletes.

use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, delete, done, drain, row};
use crate::error::JoinError;
use crate::join::JoinChangeListener;
use crate::types::{DatabaseChange, DatabaseJoinChange};

#[tokio::test]
async fn test_delete_right_emits_joined_delete() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors)
            .with_rows("6", vec![row(&[("id", "2"), ("userId", "6"), ("name", "nr2")])])
            .with_changes(
                "6",
                vec![delete(&[("id", "2"), ("userId", "6"), ("name", "nr2")]), Err(done())],
            ),
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

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_empty_right_change_is_reported_and_partition_continues() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors).with_changes(
            "6",
            vec![
                delete(&[("id", "1"), ("userId", "6")]),
                Ok(DatabaseChange {
                    old_val: None,
                    new_val: None,
                }),
                delete(&[("id", "2"), ("userId", "6")]),
            ],
        ),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(error, Some(JoinError::EmptyChange)));
    assert!(engine.is_running());

    drop(stream);
    cursors.wait_all_closed().await;
}
