pub mod change;
pub mod row;

pub use change::{ChangeKind, DatabaseChange, DatabaseJoinChange, JoinedRow};
pub use row::{Record, Row, record};
