//! Core traits for multijet JEC
//!
//! Event storage is an external collaborator: the aggregation code only sees
//! "a source yielding per-event columns for a trigger bin". Concrete storage
//! (JSON columns, columnar files, databases) lives behind these traits.

use std::path::PathBuf;

use crate::{Columns, Result};

/// Source of per-event columns, organized by trigger bin.
pub trait EventSource: Send + Sync {
    /// Columns of all events recorded for the given trigger bin.
    fn events(&self, trigger: &str) -> Result<Columns>;

    /// Source name used in log messages.
    fn name(&self) -> &str;
}

/// Opens event sources from a list of input files.
pub trait SourceProvider: Send + Sync {
    /// Open the given files as one chained source.
    fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn EventSource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummySource;

    impl EventSource for DummySource {
        fn events(&self, _trigger: &str) -> Result<Columns> {
            let mut cols = Columns::new();
            cols.insert("PtJ1", vec![100.0])?;
            Ok(cols)
        }

        fn name(&self) -> &str {
            "Dummy"
        }
    }

    #[test]
    fn test_dummy_source() {
        let source = DummySource;
        assert_eq!(source.name(), "Dummy");
        assert_eq!(source.events("HLT_PFJet60").unwrap().n_entries(), 1);
    }
}
