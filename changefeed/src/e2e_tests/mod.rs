//! End-to-end tests for the join engine.
//!
//! Each test file covers one kind of delta or one lifecycle concern, driving
//! a `JoinChangeListener` through scripted or in-memory feeds and checking
//! both the emitted events and that every cursor is closed afterwards.

#![cfg(test)]

mod helpers;

mod test_delete_left;
mod test_delete_right;
mod test_edit_left;
mod test_edit_right;
mod test_insert_left;
mod test_insert_right;
mod test_lifecycle;
mod test_nested_joins;
