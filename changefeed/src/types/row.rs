//! Row access for join keys.
//!
//! The engine only needs to read one named field from each row to find its
//! join key. Everything else about a row is opaque.

use std::collections::{BTreeMap, HashMap};

/// A row with named string fields.
pub trait Row: Clone + Send + Sync + 'static {
    /// Value of the field `name`, if present.
    fn field(&self, name: &str) -> Option<&str>;
}

/// The row type used by the in-memory tables and tests.
pub type Record = BTreeMap<String, String>;

impl Row for BTreeMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Row for HashMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// Build a `Record` from `(field, value)` pairs.
#[must_use]
pub fn record(fields: &[(&str, &str)]) -> Record {
    fields
        .iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_field_lookup() {
        let row = record(&[("id", "2"), ("userId", "6")]);
        assert_eq!(row.field("userId"), Some("6"));
        assert_eq!(row.field("roleId"), None);
    }

    #[test]
    fn test_hash_map_row() {
        let mut row = HashMap::new();
        row.insert("id".to_owned(), "6".to_owned());
        assert_eq!(Row::field(&row, "id"), Some("6"));
    }
}
