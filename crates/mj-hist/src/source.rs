//! JSON-backed event sources and stored profile accumulators.
//!
//! Event files have the layout `{"<trigger>": {"<column>": [f64, ...]}}`.
//! Profile stores have the layout `{"<trigger>": {"<name>": accumulator}}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mj_core::{Columns, Error, EventSource, Result, SourceProvider};

use crate::accumulator::ProfileAccumulator;

/// Events of one JSON file, keyed by trigger bin.
#[derive(Debug, Clone, Default)]
pub struct JsonEventSource {
    name: String,
    triggers: BTreeMap<String, Columns>,
}

impl JsonEventSource {
    /// Read a JSON event file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let triggers: BTreeMap<String, Columns> = serde_json::from_str(&json)?;
        log::debug!("loaded {} trigger bins from {}", triggers.len(), path.display());
        Ok(Self { name: path.display().to_string(), triggers })
    }

    /// Build in memory.
    pub fn from_map(name: impl Into<String>, triggers: BTreeMap<String, Columns>) -> Self {
        Self { name: name.into(), triggers }
    }

    /// Trigger bins present in the file.
    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.triggers.keys().map(String::as_str)
    }
}

impl EventSource for JsonEventSource {
    fn events(&self, trigger: &str) -> Result<Columns> {
        self.triggers.get(trigger).cloned().ok_or_else(|| {
            Error::NotFound(format!("trigger bin '{trigger}' not found in '{}'", self.name))
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Several sources read as one: events of a trigger bin are concatenated in
/// source order.
pub struct ChainedSource {
    name: String,
    sources: Vec<Box<dyn EventSource>>,
}

impl ChainedSource {
    /// Chain the given sources.
    pub fn new(sources: Vec<Box<dyn EventSource>>) -> Self {
        let name = sources.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ");
        Self { name, sources }
    }

    /// Number of chained sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl EventSource for ChainedSource {
    fn events(&self, trigger: &str) -> Result<Columns> {
        let mut out = Columns::new();
        for source in &self.sources {
            out.append(&source.events(trigger)?);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens JSON event files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSourceProvider;

impl SourceProvider for JsonSourceProvider {
    fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn EventSource>> {
        if paths.is_empty() {
            return Err(Error::Config("no input files given".into()));
        }
        let sources = paths
            .iter()
            .map(|p| JsonEventSource::load(p).map(|s| Box::new(s) as Box<dyn EventSource>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(ChainedSource::new(sources)))
    }
}

/// Access to precomputed profile accumulators, keyed by trigger bin and name.
pub trait ProfileSource: Send + Sync {
    /// The accumulator stored under `name` for `trigger`.
    fn profile(&self, trigger: &str, name: &str) -> Result<ProfileAccumulator>;
}

/// Opens stored profile accumulators from a list of input files.
pub trait ProfileSourceProvider: Send + Sync {
    /// Open the given files as one source, summing identical entries.
    fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn ProfileSource>>;
}

/// Profile accumulators stored in a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonProfileStore {
    triggers: BTreeMap<String, BTreeMap<String, ProfileAccumulator>>,
}

impl JsonProfileStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a store from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Read several stores and sum accumulators with the same trigger and name.
    pub fn load_merged(paths: &[PathBuf]) -> Result<Self> {
        let mut total = Self::new();
        for path in paths {
            total.merge(&Self::load(path)?)?;
        }
        Ok(total)
    }

    /// Write the store as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Add or replace an accumulator.
    pub fn insert(&mut self, trigger: &str, name: &str, acc: ProfileAccumulator) {
        self.triggers.entry(trigger.to_string()).or_default().insert(name.to_string(), acc);
    }

    /// Sum the accumulators of `other` into this store.
    pub fn merge(&mut self, other: &JsonProfileStore) -> Result<()> {
        for (trigger, profiles) in &other.triggers {
            let dst = self.triggers.entry(trigger.clone()).or_default();
            for (name, acc) in profiles {
                match dst.get_mut(name) {
                    Some(existing) => existing.merge(acc)?,
                    None => {
                        dst.insert(name.clone(), acc.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Trigger bins present in the store.
    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.triggers.keys().map(String::as_str)
    }
}

impl ProfileSource for JsonProfileStore {
    fn profile(&self, trigger: &str, name: &str) -> Result<ProfileAccumulator> {
        self.triggers
            .get(trigger)
            .and_then(|p| p.get(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile '{name}' for trigger bin '{trigger}'")))
    }
}

/// Opens JSON profile stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProfileProvider;

impl ProfileSourceProvider for JsonProfileProvider {
    fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn ProfileSource>> {
        if paths.is_empty() {
            return Err(Error::Config("no input files given".into()));
        }
        Ok(Box::new(JsonProfileStore::load_merged(paths)?))
    }
}
