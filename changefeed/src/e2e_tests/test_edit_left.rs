//! Left updates: rekeys move the row between partitions, same-key updates
//! only refresh the stored left row.

use crate::e2e_tests::helpers::{Cursors, ScriptedPartitions, ScriptedTable, done, drain, edit, next_event, row};
use crate::join::JoinChangeListener;
use crate::memory::MemoryTable;
use crate::types::{DatabaseJoinChange, JoinedRow, record};

#[tokio::test]
async fn test_rekey_deletes_old_pairs_before_inserting_new_ones() {
    let cursors = Cursors::default();
    let engine = JoinChangeListener::new(
        ScriptedTable::new(
            &cursors,
            vec![row(&[("id", "6"), ("userId", "2")])],
            vec![
                edit(&[("id", "6"), ("userId", "2")], &[("id", "6"), ("userId", "3")]),
                Err(done()),
            ],
        ),
        "userId",
        ScriptedPartitions::new(&cursors)
            .with_rows("2", vec![row(&[("id", "2"), ("name", "nr2")])])
            .with_rows("3", vec![row(&[("id", "3"), ("name", "nr3")])]),
        "id",
    );
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    let (events, error) = drain(&mut stream).await;
    assert_eq!(
        events,
        vec![
            DatabaseJoinChange::deleted(
                row(&[("id", "6"), ("userId", "2")]),
                row(&[("id", "2"), ("name", "nr2")]),
            ),
            DatabaseJoinChange::inserted(
                row(&[("id", "6"), ("userId", "3")]),
                row(&[("id", "3"), ("name", "nr3")]),
            ),
        ]
    );
    assert_eq!(error.unwrap().to_string(), "done");

    // A left feed error is fatal for the engine.
    assert!(!engine.is_running());
    drop(stream);
    cursors.wait_all_closed().await;
}

#[tokio::test]
async fn test_same_key_update_refreshes_left_row() {
    let users = MemoryTable::with_rows([
        record(&[("id", "u1"), ("team", "a"), ("name", "old")]),
    ]);
    let members = MemoryTable::with_rows([
        record(&[("id", "m1"), ("team", "b")]),
    ]);
    let engine = JoinChangeListener::new(users.clone(), "team", members.partitioned_by("team"), "team");
    let mut stream = engine.create_stream();
    engine.start().await.unwrap();

    users.update(record(&[("id", "u1"), ("team", "a"), ("name", "new")]));
    // The next left insert produces an event, so the refresh is done once it
    // arrives.
    users.insert(record(&[("id", "u2"), ("team", "b")]));
    let synced = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        synced,
        DatabaseJoinChange::inserted(
            record(&[("id", "u2"), ("team", "b")]),
            record(&[("id", "m1"), ("team", "b")]),
        )
    );

    members.insert(record(&[("id", "m2"), ("team", "a")]));
    let joined = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        joined.new_val,
        Some(JoinedRow {
            left: record(&[("id", "u1"), ("team", "a"), ("name", "new")]),
            right: record(&[("id", "m2"), ("team", "a")]),
        })
    );

    drop(stream);
    assert!(
        crate::e2e_tests::helpers::eventually(|| users.open_cursors() == 0 && members.open_cursors() == 0)
            .await
    );
}
