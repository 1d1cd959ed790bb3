//! Random but reproducible table operations.
//!
//! The generator only proposes operations whose effect on the join output
//! is observable: every left-side operation produces at least one event, so
//! the simulator can wait for those events before moving on. Right-side
//! operations on groups with no left row produce none, which is fine because
//! no engine task reacts to them.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{Record, Row};

/// One write against the simulated tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert a left row into a group that has right rows.
    LeftInsert { id: String, group: String },
    /// Delete a left row whose group has right rows.
    LeftDelete { id: String },
    /// Move a left row to another group that has right rows.
    LeftRekey { id: String, group: String },
    RightInsert { id: String, group: String },
    /// Rename a right row in place.
    RightUpdate { id: String, name: String },
    /// Move a right row to another group.
    RightMove { id: String, group: String },
    RightDelete { id: String },
}

impl Operation {
    #[must_use]
    pub const fn is_left(&self) -> bool {
        matches!(
            self,
            Self::LeftInsert { .. } | Self::LeftDelete { .. } | Self::LeftRekey { .. }
        )
    }
}

/// Seeded operation generator.
pub struct OperationGenerator {
    rng: StdRng,
    groups: usize,
    next_left: u64,
    next_right: u64,
    next_name: u64,
}

impl OperationGenerator {
    #[must_use]
    pub fn new(seed: u64, groups: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            groups: groups.max(1),
            next_left: 0,
            next_right: 0,
            next_name: 0,
        }
    }

    pub fn group(&mut self) -> String {
        format!("g{}", self.rng.random_range(0..self.groups))
    }

    pub fn left_id(&mut self) -> String {
        self.next_left += 1;
        format!("l{}", self.next_left)
    }

    pub fn right_id(&mut self) -> String {
        self.next_right += 1;
        format!("r{}", self.next_right)
    }

    pub fn name(&mut self) -> String {
        self.next_name += 1;
        format!("n{}", self.next_name)
    }

    pub fn chance(&mut self, probability: f64) -> bool {
        self.rng.random_bool(probability)
    }

    fn pick<T: Clone>(&mut self, items: &[T]) -> Option<T> {
        if items.is_empty() {
            return None;
        }
        Some(items[self.rng.random_range(0..items.len())].clone())
    }

    /// Propose the next operation given the current table contents.
    ///
    /// Left rows never share a group.
    pub fn next_operation(&mut self, left: &[Record], right: &[Record]) -> Operation {
        let populated: BTreeSet<&str> = right.iter().filter_map(|row| row.field("group")).collect();
        let taken: BTreeSet<&str> = left.iter().filter_map(|row| row.field("group")).collect();
        let free: Vec<String> = (0..self.groups)
            .map(|g| format!("g{g}"))
            .filter(|g| populated.contains(g.as_str()) && !taken.contains(g.as_str()))
            .collect();
        let deletable: Vec<String> = left
            .iter()
            .filter(|row| row.field("group").is_some_and(|g| populated.contains(g)))
            .filter_map(|row| row.field("id").map(str::to_owned))
            .collect();
        let left_ids: Vec<String> = left.iter().filter_map(|row| row.field("id").map(str::to_owned)).collect();
        let right_rows: Vec<(String, String)> = right
            .iter()
            .filter_map(|row| Some((row.field("id")?.to_owned(), row.field("group")?.to_owned())))
            .collect();

        loop {
            match self.rng.random_range(0..7) {
                0 => {
                    if let Some(group) = self.pick(&free) {
                        let id = self.left_id();
                        return Operation::LeftInsert { id, group };
                    }
                }
                1 => {
                    if let Some(id) = self.pick(&deletable) {
                        return Operation::LeftDelete { id };
                    }
                }
                2 => {
                    if let (Some(id), Some(group)) = (self.pick(&left_ids), self.pick(&free)) {
                        return Operation::LeftRekey { id, group };
                    }
                }
                3 => {
                    let id = self.right_id();
                    let group = self.group();
                    return Operation::RightInsert { id, group };
                }
                4 => {
                    if let Some((id, _)) = self.pick(&right_rows) {
                        let name = self.name();
                        return Operation::RightUpdate { id, name };
                    }
                }
                5 => {
                    if let Some((id, current)) = self.pick(&right_rows) {
                        let group = self.group();
                        if group != current {
                            return Operation::RightMove { id, group };
                        }
                    }
                }
                _ => {
                    if let Some((id, _)) = self.pick(&right_rows) {
                        return Operation::RightDelete { id };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record;

    #[test]
    fn test_same_seed_same_operations() {
        let right = vec![record(&[("id", "r0"), ("group", "g0")])];
        let mut a = OperationGenerator::new(7, 4);
        let mut b = OperationGenerator::new(7, 4);
        for _ in 0..50 {
            assert_eq!(a.next_operation(&[], &right), b.next_operation(&[], &right));
        }
    }

    #[test]
    fn test_left_operations_target_populated_free_groups() {
        let left = vec![record(&[("id", "l0"), ("group", "g0")])];
        let right = vec![
            record(&[("id", "r0"), ("group", "g0")]),
            record(&[("id", "r1"), ("group", "g1")]),
        ];
        let mut generator = OperationGenerator::new(99, 3);
        for _ in 0..200 {
            match generator.next_operation(&left, &right) {
                Operation::LeftInsert { group, .. } | Operation::LeftRekey { group, .. } => {
                    assert_eq!(group, "g1");
                }
                Operation::LeftDelete { id } => assert_eq!(id, "l0"),
                _ => {}
            }
        }
    }

    #[test]
    fn test_empty_tables_only_insert_right_rows() {
        let mut generator = OperationGenerator::new(1, 2);
        for _ in 0..20 {
            assert!(matches!(
                generator.next_operation(&[], &[]),
                Operation::RightInsert { .. }
            ));
        }
    }
}
