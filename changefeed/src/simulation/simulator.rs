//! Main simulator harness.
//!
//! Drives a `JoinChangeListener` over two `MemoryTable`s with seeded random
//! writes, folds the join output into a `MaterializedView` and checks it
//! against the join recomputed from the tables after every operation.

use std::time::Duration;

use futures::StreamExt;

use crate::config::SimulationConfig;
use crate::join::{JoinChangeListener, JoinStream};
use crate::memory::MemoryTable;
use crate::types::{Record, Row, record};

use super::invariants::{InvariantChecker, InvariantViolation, MaterializedView, expected_join};
use super::operations::{Operation, OperationGenerator};

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Number of operations to run.
    pub steps: usize,
    /// Number of distinct join-key values.
    pub groups: usize,
    /// Right rows present before the join starts.
    pub initial_right: usize,
    /// How long to wait for each expected join event.
    pub event_timeout: Duration,
}

impl SimulatorConfig {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            steps: SimulationConfig::DEFAULT_STEPS,
            groups: SimulationConfig::DEFAULT_GROUPS,
            initial_right: SimulationConfig::DEFAULT_GROUPS * 2,
            event_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub const fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Set the number of groups; the initial right rows scale with it.
    #[must_use]
    pub const fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self.initial_right = groups * 2;
        self
    }

    #[must_use]
    pub const fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }
}

impl From<&SimulationConfig> for SimulatorConfig {
    fn from(config: &SimulationConfig) -> Self {
        Self::new(config.seed)
            .with_steps(config.steps)
            .with_groups(config.groups)
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations applied to the tables.
    pub operations_run: usize,
    /// Operations on the left table.
    pub left_operations: usize,
    /// Join events received.
    pub events_received: usize,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    /// Whether every expected event arrived.
    pub completed_successfully: bool,
    /// Why the run stopped early, if it did.
    pub error: Option<String>,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    generator: OperationGenerator,
    left: MemoryTable<Record>,
    right: MemoryTable<Record>,
    checker: InvariantChecker,
    operations_run: usize,
    left_operations: usize,
    events_received: usize,
}

/// Why a run stopped before its last operation.
struct Abort(String);

impl Simulator {
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let generator = OperationGenerator::new(config.seed, config.groups);
        Self {
            config,
            generator,
            left: MemoryTable::new("id"),
            right: MemoryTable::new("id"),
            checker: InvariantChecker::new(),
            operations_run: 0,
            left_operations: 0,
            events_received: 0,
        }
    }

    /// Run the configured number of operations against fresh tables.
    pub async fn run(mut self) -> SimulationResult {
        self.populate();

        let engine = JoinChangeListener::new(
            self.left.clone(),
            "group",
            self.right.partitioned_by("group"),
            "group",
        );
        let mut stream = engine.create_stream();
        if let Err(e) = engine.start().await {
            return self.finish(Some(format!("join failed to start: {e}")));
        }
        tracing::debug!(
            "simulation {} started with {} left and {} right rows",
            self.config.seed,
            self.left.rows().len(),
            self.right.rows().len()
        );

        let mut view = MaterializedView::from_pairs(expected_join(&self.left.rows(), &self.right.rows()));
        let mut abort = None;
        for index in 0..self.config.steps {
            if let Err(Abort(reason)) = self.step(index, &mut stream, &mut view).await {
                abort = Some(reason);
                break;
            }
        }

        if abort.is_none() {
            self.check_quiet(&mut stream).await;
            self.check_subscriptions(&engine).await;
        }

        drop(stream);
        if engine.is_running() {
            self.checker
                .violate(self.operations_run, "join still running after its output was dropped", "");
        }
        self.check_cursors_closed().await;

        self.finish(abort)
    }

    /// Seed both tables. Left rows get distinct groups.
    fn populate(&mut self) {
        for _ in 0..self.config.initial_right {
            let id = self.generator.right_id();
            let group = self.generator.group();
            let name = self.generator.name();
            self.right
                .insert(record(&[("id", id.as_str()), ("group", group.as_str()), ("name", name.as_str())]));
        }
        for g in 0..self.config.groups {
            if self.generator.chance(0.5) {
                let id = self.generator.left_id();
                let group = format!("g{g}");
                let name = self.generator.name();
                self.left
                    .insert(record(&[("id", id.as_str()), ("group", group.as_str()), ("name", name.as_str())]));
            }
        }
    }

    async fn step(
        &mut self,
        index: usize,
        stream: &mut JoinStream<Record, Record>,
        view: &mut MaterializedView,
    ) -> Result<(), Abort> {
        let operation = self
            .generator
            .next_operation(&self.left.rows(), &self.right.rows());
        let expected = self.expected_events(&operation);
        tracing::trace!("operation {index}: {operation:?}, expecting {expected} events");

        self.apply(&operation);
        self.operations_run += 1;
        if operation.is_left() {
            self.left_operations += 1;
        }

        for _ in 0..expected {
            match tokio::time::timeout(self.config.event_timeout, stream.next()).await {
                Ok(Some(Ok(change))) => {
                    self.events_received += 1;
                    if let Err(description) = view.apply(change) {
                        self.checker.violate(index, description, format!("{operation:?}"));
                    }
                }
                Ok(Some(Err(e))) => {
                    self.checker
                        .violate(index, "join reported an error", format!("{operation:?}: {e}"));
                    return Err(Abort(format!("join failed: {e}")));
                }
                Ok(None) => {
                    self.checker
                        .violate(index, "join output ended early", format!("{operation:?}"));
                    return Err(Abort("join output ended".to_string()));
                }
                Err(_) => {
                    self.checker.violate(
                        index,
                        "timed out waiting for a join event",
                        format!("{operation:?}"),
                    );
                    return Err(Abort("timed out".to_string()));
                }
            }
        }

        let expected_pairs = expected_join(&self.left.rows(), &self.right.rows());
        self.checker.check_view(index, view, &expected_pairs);
        Ok(())
    }

    fn group_of(table: &MemoryTable<Record>, id: &str) -> Option<String> {
        table.get(id)?.field("group").map(str::to_owned)
    }

    fn has_left(&self, group: &str) -> usize {
        usize::from(!self.left.rows_where("group", group).is_empty())
    }

    fn right_rows(&self, group: &str) -> usize {
        self.right.rows_where("group", group).len()
    }

    /// Join events `operation` must produce, computed before it is applied.
    fn expected_events(&self, operation: &Operation) -> usize {
        let group_right = |id: &str| Self::group_of(&self.right, id).unwrap_or_default();
        let group_left = |id: &str| Self::group_of(&self.left, id).unwrap_or_default();
        match operation {
            Operation::LeftInsert { group, .. } => self.right_rows(group),
            Operation::LeftDelete { id } => self.right_rows(&group_left(id)),
            Operation::LeftRekey { id, group } => {
                self.right_rows(&group_left(id)) + self.right_rows(group)
            }
            Operation::RightInsert { group, .. } => self.has_left(group),
            Operation::RightUpdate { id, .. } | Operation::RightDelete { id } => {
                self.has_left(&group_right(id))
            }
            Operation::RightMove { id, group } => {
                self.has_left(&group_right(id)) + self.has_left(group)
            }
        }
    }

    fn apply(&self, operation: &Operation) {
        match operation {
            Operation::LeftInsert { id, group } => {
                self.left.insert(record(&[("id", id.as_str()), ("group", group.as_str()), ("name", id.as_str())]));
            }
            Operation::LeftDelete { id } => {
                self.left.delete(id);
            }
            Operation::LeftRekey { id, group } => {
                Self::set(&self.left, id, "group", group);
            }
            Operation::RightInsert { id, group } => {
                self.right.insert(record(&[("id", id.as_str()), ("group", group.as_str()), ("name", id.as_str())]));
            }
            Operation::RightUpdate { id, name } => Self::set(&self.right, id, "name", name),
            Operation::RightMove { id, group } => Self::set(&self.right, id, "group", group),
            Operation::RightDelete { id } => {
                self.right.delete(id);
            }
        }
    }

    fn set(table: &MemoryTable<Record>, id: &str, field: &str, value: &str) {
        if let Some(mut row) = table.get(id) {
            row.insert(field.to_string(), value.to_string());
            table.update(row);
        }
    }

    /// No event may arrive after the last expected one.
    async fn check_quiet(&mut self, stream: &mut JoinStream<Record, Record>) {
        if let Ok(extra) = tokio::time::timeout(Duration::from_millis(20), stream.next()).await {
            self.checker.violate(
                self.operations_run,
                "unexpected join output after the last operation",
                format!("{extra:?}"),
            );
        }
    }

    /// The engine follows exactly the groups of the left rows.
    async fn check_subscriptions(&mut self, engine: &JoinChangeListener<Record, Record>) {
        let mut groups: Vec<String> = self
            .left
            .rows()
            .iter()
            .filter_map(|row| row.field("group").map(str::to_owned))
            .collect();
        groups.sort();
        let settled = eventually(|| engine.subscribed_keys() == groups).await;
        if !settled {
            self.checker.violate(
                self.operations_run,
                "subscribed keys differ from the left groups",
                format!("{:?} vs {groups:?}", engine.subscribed_keys()),
            );
        }

        let right = &self.right;
        let single = eventually(|| groups.iter().all(|group| right.partition_subscribers(group) == 1)).await;
        if !single {
            self.checker.violate(
                self.operations_run,
                "subscribed group without exactly one right feed",
                format!("{groups:?}"),
            );
        }
    }

    async fn check_cursors_closed(&mut self) {
        let closed = eventually(|| self.left.open_cursors() == 0 && self.right.open_cursors() == 0).await;
        if !closed {
            self.checker.violate(
                self.operations_run,
                "cursors left open after teardown",
                format!(
                    "left: {}, right: {}",
                    self.left.open_cursors(),
                    self.right.open_cursors()
                ),
            );
        }
    }

    fn finish(self, error: Option<String>) -> SimulationResult {
        SimulationResult {
            seed: self.config.seed,
            operations_run: self.operations_run,
            left_operations: self.left_operations,
            events_received: self.events_received,
            invariant_violations: self.checker.into_violations(),
            completed_successfully: error.is_none(),
            error,
        }
    }
}

/// Poll `condition` for up to a second.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulation_passes() {
        let result = Simulator::new(SimulatorConfig::new(12345).with_steps(150)).run().await;
        assert!(result.passed(), "violations: {:?}, error: {:?}", result.invariant_violations, result.error);
        assert_eq!(result.operations_run, 150);
        assert!(result.events_received > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simulation_passes_on_multi_thread_runtime() {
        for seed in [1, 2, 3] {
            let config = SimulatorConfig::new(seed).with_steps(100).with_groups(3);
            let result = Simulator::new(config).run().await;
            assert!(result.passed(), "seed {seed}: {:?} {:?}", result.invariant_violations, result.error);
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_run() {
        let a = Simulator::new(SimulatorConfig::new(77).with_steps(60)).run().await;
        let b = Simulator::new(SimulatorConfig::new(77).with_steps(60)).run().await;
        assert_eq!(a.events_received, b.events_received);
        assert_eq!(a.left_operations, b.left_operations);
    }

    #[tokio::test]
    async fn test_single_group() {
        let config = SimulatorConfig::new(5).with_steps(80).with_groups(1);
        let result = Simulator::new(config).run().await;
        assert!(result.passed(), "{:?} {:?}", result.invariant_violations, result.error);
    }
}
