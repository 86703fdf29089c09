//! Stitching of per-trigger histograms into one array over the combined
//! binning, and the inverse split.

use std::collections::BTreeMap;

use mj_core::{Error, Result};
use mj_hist::{Profile1D, validate_edges};

/// Profiles keyed by trigger bin, then by name.
pub type TriggerProfiles = BTreeMap<String, BTreeMap<String, Profile1D>>;

/// Maps between per-trigger histograms and arrays over the combined binning.
///
/// Trigger bins are ordered by their first edge and must be contiguous: the
/// last edge of one trigger bin is the first edge of the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerStitcher {
    triggers: Vec<String>,
    boundaries: Vec<usize>,
    binning: Vec<f64>,
}

impl TriggerStitcher {
    /// Build from the binning of every trigger bin.
    pub fn new(binnings: impl IntoIterator<Item = (String, Vec<f64>)>) -> Result<Self> {
        let mut binnings: Vec<(String, Vec<f64>)> = binnings.into_iter().collect();
        if binnings.is_empty() {
            return Err(Error::Validation("no trigger bins to stitch".into()));
        }
        for (name, edges) in &binnings {
            validate_edges(edges)
                .map_err(|e| Error::Validation(format!("binning of trigger bin '{name}': {e}")))?;
        }
        binnings.sort_by(|a, b| a.1[0].total_cmp(&b.1[0]));

        let mut triggers = Vec::with_capacity(binnings.len());
        let mut boundaries = vec![0];
        let mut binning = Vec::new();
        for (i, (name, edges)) in binnings.iter().enumerate() {
            if let Some((prev, prev_edges)) = i.checked_sub(1).map(|j| &binnings[j])
                && prev_edges[prev_edges.len() - 1] != edges[0]
            {
                return Err(Error::Validation(format!(
                    "trigger bins '{prev}' and '{name}' are not contiguous ({} vs {})",
                    prev_edges[prev_edges.len() - 1],
                    edges[0]
                )));
            }
            binning.extend_from_slice(&edges[..edges.len() - 1]);
            boundaries.push(boundaries[i] + edges.len() - 1);
            triggers.push(name.clone());
        }
        let last = &binnings[binnings.len() - 1].1;
        binning.push(last[last.len() - 1]);

        if binning.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(Error::Validation("combined binning is not ordered".into()));
        }
        Ok(Self { triggers, boundaries, binning })
    }

    /// Use the binnings of the profiles named `reference` in every trigger bin.
    pub fn from_profiles(profiles: &TriggerProfiles, reference: &str) -> Result<Self> {
        let binnings = profiles
            .iter()
            .map(|(trigger, named)| {
                named
                    .get(reference)
                    .map(|p| (trigger.clone(), p.binning.clone()))
                    .ok_or_else(|| Error::NotFound(format!("'{reference}' in trigger bin '{trigger}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(binnings)
    }

    /// Combined bin edges.
    pub fn binning(&self) -> &[f64] {
        &self.binning
    }

    /// Trigger bins in ascending pt.
    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Number of bins of the combined binning.
    pub fn num_bins(&self) -> usize {
        self.binning.len() - 1
    }

    fn edges(&self, index: usize) -> &[f64] {
        &self.binning[self.boundaries[index]..=self.boundaries[index + 1]]
    }

    /// Regular-bin contents and errors of the profiles named `name`, stitched
    /// over all trigger bins.
    pub fn stitch(&self, profiles: &TriggerProfiles, name: &str) -> Result<Profile1D> {
        let mut contents = Vec::with_capacity(self.num_bins());
        let mut errors = Vec::with_capacity(self.num_bins());
        for (i, trigger) in self.triggers.iter().enumerate() {
            let profile = profiles
                .get(trigger)
                .and_then(|named| named.get(name))
                .ok_or_else(|| Error::NotFound(format!("'{name}' in trigger bin '{trigger}'")))?;
            if profile.binning != self.edges(i) {
                return Err(Error::Validation(format!(
                    "binning of '{name}' in trigger bin '{trigger}' differs from the reference"
                )));
            }
            contents.extend_from_slice(profile.interior_contents());
            errors.extend_from_slice(profile.interior_errors());
        }
        Profile1D::from_parts(self.binning.clone(), Some(contents), Some(errors))
    }

    /// Split an array over the combined binning into one profile per trigger
    /// bin, with zero errors.
    pub fn split(&self, values: &[f64]) -> Result<BTreeMap<String, Profile1D>> {
        if values.len() != self.num_bins() {
            return Err(Error::Validation(format!(
                "unexpected length of the array: {} (expected {})",
                values.len(),
                self.num_bins()
            )));
        }
        let mut out = BTreeMap::new();
        for (i, trigger) in self.triggers.iter().enumerate() {
            let part = &values[self.boundaries[i]..self.boundaries[i + 1]];
            let profile = Profile1D::from_parts(
                self.edges(i).to_vec(),
                Some(part.to_vec()),
                Some(vec![0.0; part.len()]),
            )?;
            out.insert(trigger.clone(), profile);
        }
        Ok(out)
    }
}
