//! Invariant checking for the join simulation.
//!
//! The simulator applies every join event to a `MaterializedView` and
//! compares the view with a join recomputed from the tables themselves.

use std::collections::BTreeMap;

use crate::types::{DatabaseJoinChange, JoinedRow, Record, Row};

/// `(left id, right id)` of a joined pair.
pub type PairKey = (String, String);

/// An invariant violation detected during a simulation.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Operation index where it was detected.
    pub operation_index: usize,
    /// Additional context.
    pub context: String,
}

/// Join output rebuilt from events.
#[derive(Debug, Default)]
pub struct MaterializedView {
    pairs: BTreeMap<PairKey, JoinedRow<Record, Record>>,
}

impl MaterializedView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already known join result.
    #[must_use]
    pub const fn from_pairs(pairs: BTreeMap<PairKey, JoinedRow<Record, Record>>) -> Self {
        Self { pairs }
    }

    #[must_use]
    pub const fn pairs(&self) -> &BTreeMap<PairKey, JoinedRow<Record, Record>> {
        &self.pairs
    }

    /// Apply one join event.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the event does not fit the
    /// view: deleting a pair that is absent or differs, or inserting a pair
    /// that is already present.
    pub fn apply(&mut self, change: DatabaseJoinChange<Record, Record>) -> Result<(), String> {
        if let Some(old) = change.old_val {
            let key = pair_key(&old)?;
            match self.pairs.remove(&key) {
                Some(stored) if stored == old => {}
                Some(stored) => {
                    return Err(format!("removed {key:?} as {old:?} but the view held {stored:?}"));
                }
                None => return Err(format!("removed {key:?} which is not in the view")),
            }
        }
        if let Some(new) = change.new_val {
            let key = pair_key(&new)?;
            if self.pairs.contains_key(&key) {
                return Err(format!("added {key:?} which is already in the view"));
            }
            self.pairs.insert(key, new);
        }
        Ok(())
    }
}

fn pair_key(row: &JoinedRow<Record, Record>) -> Result<PairKey, String> {
    let left = row.left.field("id").ok_or("joined left row without id")?;
    let right = row.right.field("id").ok_or("joined right row without id")?;
    Ok((left.to_owned(), right.to_owned()))
}

/// Equi-join of `left` and `right` on `group`, computed directly.
#[must_use]
pub fn expected_join(left: &[Record], right: &[Record]) -> BTreeMap<PairKey, JoinedRow<Record, Record>> {
    let mut pairs = BTreeMap::new();
    for l in left {
        for r in right {
            let (Some(left_group), Some(right_group)) = (l.field("group"), r.field("group")) else {
                continue;
            };
            if left_group != right_group {
                continue;
            }
            let row = JoinedRow {
                left: l.clone(),
                right: r.clone(),
            };
            if let Ok(key) = pair_key(&row) {
                pairs.insert(key, row);
            }
        }
    }
    pairs
}

/// Collects violations over a run.
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
}

impl Default for InvariantChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantChecker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub fn into_violations(self) -> Vec<InvariantViolation> {
        self.violations
    }

    pub fn add_violation(&mut self, violation: InvariantViolation) {
        tracing::warn!(
            "invariant violated at operation {}: {} ({})",
            violation.operation_index,
            violation.description,
            violation.context
        );
        self.violations.push(violation);
    }

    pub fn violate(&mut self, operation_index: usize, description: impl Into<String>, context: impl Into<String>) {
        self.add_violation(InvariantViolation {
            description: description.into(),
            operation_index,
            context: context.into(),
        });
    }

    /// The view must hold exactly the recomputed join.
    pub fn check_view(
        &mut self,
        operation_index: usize,
        view: &MaterializedView,
        expected: &BTreeMap<PairKey, JoinedRow<Record, Record>>,
    ) {
        for key in expected.keys() {
            if !view.pairs().contains_key(key) {
                self.violate(operation_index, "joined pair missing from the output", format!("{key:?}"));
            }
        }
        for (key, row) in view.pairs() {
            match expected.get(key) {
                None => self.violate(operation_index, "stale joined pair in the output", format!("{key:?}")),
                Some(want) if want != row => self.violate(
                    operation_index,
                    "joined pair out of date",
                    format!("{key:?}: got {row:?}, want {want:?}"),
                ),
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record;

    fn left(id: &str, group: &str) -> Record {
        record(&[("id", id), ("group", group)])
    }

    fn right(id: &str, group: &str) -> Record {
        record(&[("id", id), ("group", group)])
    }

    #[test]
    fn test_expected_join_matches_groups() {
        let pairs = expected_join(
            &[left("l1", "a"), left("l2", "b")],
            &[right("r1", "a"), right("r2", "a"), right("r3", "c")],
        );
        let keys: Vec<_> = pairs.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                ("l1".to_string(), "r1".to_string()),
                ("l1".to_string(), "r2".to_string()),
            ]
        );
    }

    #[test]
    fn test_view_rejects_duplicate_insert_and_missing_delete() {
        let mut view = MaterializedView::new();
        view.apply(DatabaseJoinChange::inserted(left("l1", "a"), right("r1", "a")))
            .unwrap();
        assert!(
            view.apply(DatabaseJoinChange::inserted(left("l1", "a"), right("r1", "a")))
                .is_err()
        );
        assert!(
            view.apply(DatabaseJoinChange::deleted(left("l1", "a"), right("r9", "a")))
                .is_err()
        );
    }

    #[test]
    fn test_view_update_replaces_pair() {
        let mut view = MaterializedView::new();
        view.apply(DatabaseJoinChange::inserted(left("l1", "a"), right("r1", "a")))
            .unwrap();
        let renamed = record(&[("id", "r1"), ("group", "a"), ("name", "x")]);
        view.apply(DatabaseJoinChange {
            old_val: Some(JoinedRow {
                left: left("l1", "a"),
                right: right("r1", "a"),
            }),
            new_val: Some(JoinedRow {
                left: left("l1", "a"),
                right: renamed.clone(),
            }),
        })
        .unwrap();

        let mut checker = InvariantChecker::new();
        checker.check_view(0, &view, &expected_join(&[left("l1", "a")], &[renamed]));
        assert!(checker.violations().is_empty());
    }

    #[test]
    fn test_check_view_reports_stale_pairs() {
        let mut view = MaterializedView::new();
        view.apply(DatabaseJoinChange::inserted(left("l1", "a"), right("r1", "a")))
            .unwrap();
        let mut checker = InvariantChecker::new();
        checker.check_view(3, &view, &BTreeMap::new());
        assert_eq!(checker.violations().len(), 1);
        assert_eq!(checker.violations()[0].operation_index, 3);
    }
}
