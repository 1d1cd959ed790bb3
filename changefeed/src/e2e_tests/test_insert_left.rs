//! Left inserts fan out over the right rows of the new key.

use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, done, drain, eventually, insert, row};
use crate::join::JoinChangeListener;
use crate::types::DatabaseJoinChange;

#[tokio::test]
async fn test_insert_left_emits_existing_right_row() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![], vec![insert(&[("id", "6")])]),
        "id",
        ScriptedPartitions::new(&cursors)
            .with_rows("6", vec![row(&[("id", "2"), ("userId", "6"), ("name", "nr2")])])
            .with_changes("6", vec![Err(done())]),
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

    drop(stream);
    cursors.wait_all_closed().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_insert_left_emits_one_event_per_right_row_in_order() {
    let cursors = Cursors::default();
    let right = vec![
        row(&[("id", "a"), ("userId", "6")]),
        row(&[("id", "b"), ("userId", "6")]),
        row(&[("id", "c"), ("userId", "6")]),
    ];
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![], vec![insert(&[("id", "6")]), Err(done())]),
        "id",
        ScriptedPartitions::new(&cursors).with_rows("6", right.clone()),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    let expected: Vec<_> = right
        .into_iter()
        .map(|r| DatabaseJoinChange::inserted(row(&[("id", "6")]), r))
        .collect();
    assert_eq!(events, expected);
    assert_eq!(error.unwrap().to_string(), "done");

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_insert_left_without_right_rows_still_subscribes() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![], vec![insert(&[("id", "6")])]),
        "id",
        ScriptedPartitions::new(&cursors),
        "userId",
    );
    let stream = engine.create_stream();
    engine.start().await.unwrap();

    assert!(eventually(|| engine.subscribed_keys() == vec!["6".to_string()]).await);
    // left snapshot, left feed, right feed and right snapshot for key 6
    assert_eq!(cursors.opened(), 4);

    drop(stream);
    cursors.wait_all_closed().await;
    assert!(engine.subscribed_keys().is_empty());
}
