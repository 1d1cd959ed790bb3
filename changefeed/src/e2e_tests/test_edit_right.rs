//! Right updates become joined updates.

use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, done, drain, edit, row};
use crate::join::JoinChangeListener;
use crate::types::{DatabaseJoinChange, JoinedRow};

#[tokio::test]
async fn test_edit_right_emits_joined_update() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors)
            .with_rows("6", vec![row(&[("userId", "6"), ("name", "nr2")])])
            .with_changes(
                "6",
                vec![
                    edit(&[("userId", "6"), ("name", "nr2")], &[("userId", "6"), ("name", "nr3")]),
                    Err(done()),
                ],
            ),
        "userId",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(
        events,
        vec![DatabaseJoinChange {
            old_val: Some(JoinedRow {
                left: row(&[("id", "6")]),
                right: row(&[("userId", "6"), ("name", "nr2")]),
            }),
            new_val: Some(JoinedRow {
                left: row(&[("id", "6")]),
                right: row(&[("userId", "6"), ("name", "nr3")]),
            }),
        }]
    );
    assert_eq!(error.unwrap().to_string(), "done");

    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_row_maps_apply_to_emitted_rows() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::builder(
        ScriptedTable::new(&cursors, vec![row(&[("id", "6"), ("secret", "x")])], vec![]),
        "id",
        ScriptedPartitions::new(&cursors).with_changes(
            "6",
            vec![
                edit(&[("userId", "6"), ("name", "a")], &[("userId", "6"), ("name", "b")]),
                Err(done()),
            ],
        ),
        "userId",
    )
    .left_map(|mut left| {
        left.remove("secret");
        left
    })
    .right_map(|mut right| {
        right.remove("userId");
        right
    })
    .build();
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, _) = drain(&mut stream).await;
    assert_eq!(
        events,
        vec![DatabaseJoinChange {
            old_val: Some(JoinedRow {
                left: row(&[("id", "6")]),
                right: row(&[("name", "a")]),
            }),
            new_val: Some(JoinedRow {
                left: row(&[("id", "6")]),
                right: row(&[("name", "b")]),
            }),
        }]
    );

    drop(stream);
    cursors.wait_all_closed().await;
}
