//! Columnar event data handed from event sources to the profile filler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Named columns of per-event values. All columns have the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HashMap<String, Vec<f64>>", into = "HashMap<String, Vec<f64>>")]
pub struct Columns {
    columns: HashMap<String, Vec<f64>>,
    n_entries: usize,
}

impl Columns {
    /// Create an empty set of columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a map, checking that all columns have the same length.
    pub fn from_map(columns: HashMap<String, Vec<f64>>) -> Result<Self> {
        let mut out = Self::new();
        for (name, values) in columns {
            out.insert(name, values)?;
        }
        Ok(out)
    }

    /// Add a column. Its length must match the columns already present.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if !self.columns.is_empty() && values.len() != self.n_entries {
            return Err(Error::Validation(format!(
                "column '{name}' has {} entries, expected {}",
                values.len(),
                self.n_entries
            )));
        }
        self.n_entries = values.len();
        self.columns.insert(name, values);
        Ok(())
    }

    /// Number of events.
    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    /// Whether there are no events.
    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// Access a column by name.
    pub fn get(&self, name: &str) -> Result<&[f64]> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::NotFound(format!("missing column: '{name}'")))
    }

    /// Whether a column is present.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Append the events of `other`.
    ///
    /// Only columns present in both sets survive, which mirrors how chained
    /// tuples expose the common branches.
    pub fn append(&mut self, other: &Columns) {
        if self.columns.is_empty() {
            *self = other.clone();
            return;
        }
        self.columns.retain(|name, _| other.columns.contains_key(name));
        for (name, values) in self.columns.iter_mut() {
            values.extend_from_slice(&other.columns[name]);
        }
        self.n_entries += other.n_entries;
        if self.columns.is_empty() {
            self.n_entries = 0;
        }
    }
}

impl TryFrom<HashMap<String, Vec<f64>>> for Columns {
    type Error = Error;

    fn try_from(map: HashMap<String, Vec<f64>>) -> Result<Self> {
        Self::from_map(map)
    }
}

impl From<Columns> for HashMap<String, Vec<f64>> {
    fn from(columns: Columns) -> Self {
        columns.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_checks_lengths() {
        let mut cols = Columns::new();
        cols.insert("PtJ1", vec![1.0, 2.0]).unwrap();
        let err = cols.insert("PtBal", vec![1.0]).unwrap_err();
        assert!(err.to_string().contains("PtBal"));
        assert_eq!(cols.n_entries(), 2);
    }

    #[test]
    fn missing_column_is_not_found() {
        let cols = Columns::new();
        assert!(matches!(cols.get("MPF"), Err(Error::NotFound(_))));
    }

    #[test]
    fn append_keeps_common_columns() {
        let mut a = Columns::new();
        a.insert("x", vec![1.0]).unwrap();
        a.insert("y", vec![2.0]).unwrap();
        let mut b = Columns::new();
        b.insert("x", vec![3.0, 4.0]).unwrap();
        a.append(&b);
        assert_eq!(a.get("x").unwrap(), &[1.0, 3.0, 4.0]);
        assert!(!a.contains("y"));
        assert_eq!(a.n_entries(), 3);
    }

    #[test]
    fn deserialize_rejects_ragged_columns() {
        let bad = r#"{"x": [1.0, 2.0], "y": [1.0]}"#;
        assert!(serde_json::from_str::<Columns>(bad).is_err());
        let good: Columns = serde_json::from_str(r#"{"x": [1.0, 2.0]}"#).unwrap();
        assert_eq!(good.n_entries(), 2);
    }
}
