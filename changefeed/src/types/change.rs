//! Change notification types for table feeds and join output.
//!
//! A `DatabaseChange` is one delta coming out of a table change feed. A
//! `DatabaseJoinChange` is one delta of the joined result, pairing a left row
//! with a right row on either side of the change.

use serde::{Deserialize, Serialize};

// =============================================================================
// Table deltas
// =============================================================================

/// Type of change carried by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Only `new_val` is present.
    Insert,
    /// Both `old_val` and `new_val` are present.
    Update,
    /// Only `old_val` is present.
    Delete,
}

/// A single delta from a change feed.
///
/// Both sides absent is invalid; `kind()` returns `None` for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseChange<T> {
    /// The row before the change. `None` for inserts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_val: Option<T>,
    /// The row after the change. `None` for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_val: Option<T>,
}

impl<T> DatabaseChange<T> {
    #[must_use]
    pub const fn insert(row: T) -> Self {
        Self {
            old_val: None,
            new_val: Some(row),
        }
    }

    #[must_use]
    pub const fn update(old: T, new: T) -> Self {
        Self {
            old_val: Some(old),
            new_val: Some(new),
        }
    }

    #[must_use]
    pub const fn delete(row: T) -> Self {
        Self {
            old_val: Some(row),
            new_val: None,
        }
    }

    /// Classify this delta. Returns `None` when both sides are absent.
    #[must_use]
    pub const fn kind(&self) -> Option<ChangeKind> {
        match (&self.old_val, &self.new_val) {
            (None, Some(_)) => Some(ChangeKind::Insert),
            (Some(_), Some(_)) => Some(ChangeKind::Update),
            (Some(_), None) => Some(ChangeKind::Delete),
            (None, None) => None,
        }
    }
}

// =============================================================================
// Join deltas
// =============================================================================

/// A left row paired with one matching right row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedRow<L, R> {
    pub left: L,
    pub right: R,
}

/// A single delta of the joined result set.
///
/// The engine never emits an event with both sides absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseJoinChange<L, R> {
    /// The joined pair that left the result set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_val: Option<JoinedRow<L, R>>,
    /// The joined pair that entered the result set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_val: Option<JoinedRow<L, R>>,
}

impl<L, R> DatabaseJoinChange<L, R> {
    #[must_use]
    pub const fn inserted(left: L, right: R) -> Self {
        Self {
            old_val: None,
            new_val: Some(JoinedRow { left, right }),
        }
    }

    #[must_use]
    pub const fn deleted(left: L, right: R) -> Self {
        Self {
            old_val: Some(JoinedRow { left, right }),
            new_val: None,
        }
    }

    /// Classify this delta. Returns `None` when both sides are absent.
    #[must_use]
    pub const fn kind(&self) -> Option<ChangeKind> {
        match (&self.old_val, &self.new_val) {
            (None, Some(_)) => Some(ChangeKind::Insert),
            (Some(_), Some(_)) => Some(ChangeKind::Update),
            (Some(_), None) => Some(ChangeKind::Delete),
            (None, None) => None,
        }
    }

    /// Drop the left side, keeping the right rows as a plain table delta.
    ///
    /// This is what makes one join's output usable as the left change feed
    /// of another join.
    #[must_use]
    pub fn into_right(self) -> DatabaseChange<R> {
        DatabaseChange {
            old_val: self.old_val.map(|joined| joined.right),
            new_val: self.new_val.map(|joined| joined.right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table_deltas() {
        assert_eq!(DatabaseChange::insert(1).kind(), Some(ChangeKind::Insert));
        assert_eq!(DatabaseChange::update(1, 2).kind(), Some(ChangeKind::Update));
        assert_eq!(DatabaseChange::delete(1).kind(), Some(ChangeKind::Delete));

        let empty: DatabaseChange<i32> = DatabaseChange {
            old_val: None,
            new_val: None,
        };
        assert_eq!(empty.kind(), None);
    }

    #[test]
    fn test_join_change_into_right() {
        let change = DatabaseJoinChange::deleted("user-1", "role-2");
        assert_eq!(change.kind(), Some(ChangeKind::Delete));

        let right = change.into_right();
        assert_eq!(right, DatabaseChange::delete("role-2"));
    }

    #[test]
    fn test_join_change_update_into_right() {
        let change = DatabaseJoinChange {
            old_val: Some(JoinedRow {
                left: 6,
                right: "nr2",
            }),
            new_val: Some(JoinedRow {
                left: 6,
                right: "nr3",
            }),
        };
        assert_eq!(change.kind(), Some(ChangeKind::Update));
        assert_eq!(change.into_right(), DatabaseChange::update("nr2", "nr3"));
    }
}
