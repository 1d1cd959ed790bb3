// Life of a change:
// 1. A table write lands in a change feed (left table or one right partition)
// 2. The join engine pulls it through a `ChangeCursor`
// 3. Left deltas:
//     - Open / close right partitions keyed by the join field
//     - Emit one joined event per right row of the affected partition
//    Right deltas:
//     - Join with the partition's current left row and emit
// 4. Events are pushed into a `Subject`
// 5. The consumer pulls them through a cursor or a stream
//
// Teardown runs the other way: the consumer disconnects, the subject's
// teardown hook completes the engine, and every task closes its own cursor.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod cursor;
mod e2e_tests;
pub mod error;
pub mod join;
pub mod memory;
pub mod simulation;
pub mod subject;
pub mod types;

pub use cursor::{BoxChangeCursor, BoxCursor, ChangeCursor, Cursor, PartitionSource, TableSource, VecCursor};
pub use error::JoinError;
pub use join::{JoinBuilder, JoinChangeListener, JoinCursor, JoinStream};
pub use memory::{MemoryTable, PartitionedTable};
pub use subject::{Subject, SubjectCursor, SubjectStream};
pub use types::{DatabaseChange, DatabaseJoinChange, JoinedRow, Record, Row, record};
