//! One join's output feeding another join as its left table.

use crate::e2e_tests::helpers::{Cursors, CursorTable, ScriptedPartitions, ScriptedTable, assert_quiet, insert, next_event, row};
use crate::join::JoinChangeListener;
use crate::types::{DatabaseJoinChange, Record};

#[tokio::test]
async fn test_nested_joins() {
    let cursors = Cursors::default();

    // users JOIN memberships ON users.id = memberships.userId
    let memberships = JoinChangeListener::new(
        ScriptedTable::new(&cursors, vec![row(&[("id", "u1")])], vec![insert(&[("id", "u2")])]),
        "id",
        ScriptedPartitions::new(&cursors)
            .with_rows("u1", vec![row(&[("id", "m1"), ("userId", "u1"), ("roleId", "r1")])])
            .with_rows("u2", vec![row(&[("id", "m2"), ("userId", "u2"), ("roleId", "r2")])]),
        "userId",
    );
    memberships.start().await.unwrap();
    let membership_changes = memberships.create_mapped_cursor(DatabaseJoinChange::<Record, Record>::into_right);

    // memberships JOIN roles ON memberships.roleId = roles.id
    let roles = JoinChangeListener::new(
        CursorTable::new(
            &cursors,
            vec![row(&[("id", "m1"), ("userId", "u1"), ("roleId", "r1")])],
            membership_changes,
        ),
        "roleId",
        ScriptedPartitions::new(&cursors)
            .with_rows("r1", vec![row(&[("id", "r1"), ("name", "admin")])])
            .with_rows("r2", vec![row(&[("id", "r2"), ("name", "editor")])]),
        "id",
    );
    let mut stream = roles.create_stream();
    roles.start().await.unwrap();

    let event = next_event(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        event,
        DatabaseJoinChange::inserted(
            row(&[("id", "m2"), ("userId", "u2"), ("roleId", "r2")]),
            row(&[("id", "r2"), ("name", "editor")]),
        )
    );
    assert_quiet(&mut stream).await;
    assert_eq!(roles.subscribed_keys(), vec!["r1".to_string(), "r2".to_string()]);

    // Dropping the outer output closes the inner join's cursor, which tears
    // the inner join down as well.
    drop(stream);
    cursors.wait_all_closed().await;
    assert!(!roles.is_running());
    assert!(!memberships.is_running());
}
