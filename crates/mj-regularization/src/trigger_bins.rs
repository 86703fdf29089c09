//! Trigger bins: named ranges in pt of the leading jet where a trigger is
//! fully efficient.
//!
//! Configuration format:
//!
//! ```json
//! {
//!   "PFJet60": {"filter": "HLT_PFJet60", "ptRange": [100, 200], "ptRangeMargined": [90, 220]},
//!   "PFJet450": {"filter": "HLT_PFJet450", "ptRange": [200, "inf"], "ptRangeMargined": [180, "inf"]}
//! }
//! ```
//!
//! Bounds are numbers or one of the strings `"inf"`, `"+inf"`, `"-inf"`,
//! `"Infinity"`, `"-Infinity"`.

use std::collections::BTreeMap;
use std::ops::Index;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mj_core::{Error, Result};
use mj_hist::validate_edges;

/// Environment variable pointing to the installation with standard configs.
pub const INSTALL_ENV: &str = "MULTIJET_JEC_INSTALL";

/// A single trigger bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerBin {
    /// Name of the trigger bin.
    pub name: String,
    /// Name of the trigger filter.
    pub filter_name: String,
    /// Range in pt where the trigger is used, `(lo, hi)`.
    pub pt_range: (f64, f64),
    /// Range extended with a margin, `(lo', hi')` with `lo' <= lo < hi <= hi'`.
    pub pt_range_margined: (f64, f64),
}

impl TriggerBin {
    /// Construct and validate a trigger bin.
    pub fn new(
        name: impl Into<String>,
        filter_name: impl Into<String>,
        pt_range: (f64, f64),
        pt_range_margined: (f64, f64),
    ) -> Result<Self> {
        let name = name.into();
        for (field, r) in [("ptRange", pt_range), ("ptRangeMargined", pt_range_margined)] {
            if r.0.is_nan() || r.1.is_nan() {
                return Err(Error::Config(format!(
                    "range \"{field}\" for trigger \"{name}\" contains NaN"
                )));
            }
            if r.0 >= r.1 {
                return Err(Error::Config(format!(
                    "range \"{field}\" for trigger \"{name}\" is not ordered: ({}, {})",
                    r.0, r.1
                )));
            }
        }
        if pt_range.0 < pt_range_margined.0 || pt_range.1 > pt_range_margined.1 {
            return Err(Error::Config(format!(
                "in trigger \"{name}\" range \"ptRange\" is not contained within \"ptRangeMargined\""
            )));
        }
        Ok(Self { name, filter_name: filter_name.into(), pt_range, pt_range_margined })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBound {
    Number(f64),
    Text(String),
}

impl RawBound {
    fn value(&self, trigger: &str) -> Result<f64> {
        match self {
            RawBound::Number(v) => Ok(*v),
            RawBound::Text(s) => match s.trim() {
                "inf" | "+inf" | "Infinity" | "+Infinity" => Ok(f64::INFINITY),
                "-inf" | "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(Error::Config(format!(
                    "unrecognized bound \"{other}\" in trigger \"{trigger}\""
                ))),
            },
        }
    }
}

#[derive(Deserialize)]
struct RawTriggerBin {
    filter: String,
    #[serde(rename = "ptRange")]
    pt_range: Vec<RawBound>,
    #[serde(rename = "ptRangeMargined")]
    pt_range_margined: Vec<RawBound>,
}

fn parse_range(name: &str, field: &str, raw: &[RawBound]) -> Result<(f64, f64)> {
    if raw.len() != 2 {
        return Err(Error::Config(format!(
            "range \"{field}\" for trigger \"{name}\" consists of {} elements, while 2 are expected",
            raw.len()
        )));
    }
    Ok((raw[0].value(name)?, raw[1].value(name)?))
}

/// Collection of trigger bins sorted by the lower edge of `pt_range`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TriggerBinSet {
    bins: Vec<TriggerBin>,
}

impl TriggerBinSet {
    /// Build from individual bins. The bins are sorted in pt.
    pub fn from_bins(bins: impl IntoIterator<Item = TriggerBin>) -> Self {
        let mut bins: Vec<TriggerBin> = bins.into_iter().collect();
        bins.sort_by(|a, b| a.pt_range.0.total_cmp(&b.pt_range.0));
        Self { bins }
    }

    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawTriggerBin> = serde_json::from_str(json)?;
        let bins = raw
            .into_iter()
            .map(|(name, r)| {
                let pt_range = parse_range(&name, "ptRange", &r.pt_range)?;
                let margined = parse_range(&name, "ptRangeMargined", &r.pt_range_margined)?;
                TriggerBin::new(name, r.filter, pt_range, margined)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_bins(bins))
    }

    /// Read a JSON configuration file.
    ///
    /// If `path` does not exist, it is also looked up under
    /// `$MULTIJET_JEC_INSTALL/config`.
    pub fn load(path: &Path) -> Result<Self> {
        let resolved = resolve_config_path(path)?;
        log::debug!("reading trigger bins from {}", resolved.display());
        let json = std::fs::read_to_string(&resolved)?;
        Self::from_json_str(&json)
    }

    /// Read a configuration file and clip it at `clip`.
    pub fn load_clipped(path: &Path, clip: f64) -> Result<Self> {
        let mut set = Self::load(path)?;
        set.clip(clip);
        Ok(set)
    }

    /// Drop bins with `pt_range.lo >= upper_bound` and truncate `pt_range.hi`
    /// of the remaining ones to `upper_bound`. Margined ranges are left as is.
    pub fn clip(&mut self, upper_bound: f64) {
        self.bins.retain(|b| b.pt_range.0 < upper_bound);
        for b in &mut self.bins {
            if b.pt_range.1 > upper_bound {
                b.pt_range.1 = upper_bound;
            }
        }
    }

    /// Keep only bins with `pt_range.lo < max_pt`.
    pub fn below(&self, max_pt: f64) -> Self {
        Self { bins: self.bins.iter().filter(|b| b.pt_range.0 < max_pt).cloned().collect() }
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Whether there are no bins.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Iterate in ascending pt.
    pub fn iter(&self) -> std::slice::Iter<'_, TriggerBin> {
        self.bins.iter()
    }

    /// Names in ascending pt.
    pub fn names(&self) -> Vec<&str> {
        self.bins.iter().map(|b| b.name.as_str()).collect()
    }

    /// Bin with the lowest pt.
    pub fn first(&self) -> Option<&TriggerBin> {
        self.bins.first()
    }

    /// Bin with the highest pt.
    pub fn last(&self) -> Option<&TriggerBin> {
        self.bins.last()
    }

    /// Look up a bin by name.
    pub fn find(&self, name: &str) -> Result<&TriggerBin> {
        self.bins
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::NotFound(format!("trigger bin \"{name}\"")))
    }

    /// Check that every `pt_range` boundary appears in `binning`.
    ///
    /// A misalignment is reported as [`Error::Alignment`] listing the
    /// offending edges, or as `Ok(false)` if `silent` is set. A binning that
    /// is not strictly increasing is an error unless `silent` is set, in
    /// which case it is not aligned either.
    pub fn check_alignment(&self, binning: &[f64], silent: bool) -> Result<bool> {
        if let Err(e) = validate_edges(binning) {
            if silent {
                log::debug!("binning cannot be aligned with trigger bins: {e}");
                return Ok(false);
            }
            return Err(e);
        }
        let mismatched: Vec<f64> = self
            .bins
            .iter()
            .flat_map(|b| [b.pt_range.0, b.pt_range.1])
            .filter(|edge| !binning.contains(edge))
            .collect();

        if mismatched.is_empty() {
            Ok(true)
        } else if silent {
            Ok(false)
        } else {
            Err(Error::Alignment { edges: mismatched })
        }
    }

    /// Check that adjacent bins share their `pt_range` boundary.
    pub fn check_contiguous(&self) -> Result<()> {
        for pair in self.bins.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.pt_range.1 != b.pt_range.0 {
                return Err(Error::Config(format!(
                    "trigger bins \"{}\" and \"{}\" are not contiguous: {} != {}",
                    a.name, b.name, a.pt_range.1, b.pt_range.0
                )));
            }
        }
        Ok(())
    }

    /// Check that `binning` can serve as the analysis binning: its last edge
    /// is finite, its first edge coincides with the lower boundary of the
    /// first trigger bin, and all trigger-bin boundaries are aligned with it.
    pub fn validate_analysis_binning(&self, binning: &[f64]) -> Result<()> {
        validate_edges(binning)?;
        let first = self
            .first()
            .ok_or_else(|| Error::Config("no trigger bins defined".into()))?;
        let last_edge = binning[binning.len() - 1];
        if !last_edge.is_finite() {
            return Err(Error::Config(format!("last edge of the binning is not finite: {last_edge}")));
        }
        if binning[0] != first.pt_range.0 {
            return Err(Error::Config(format!(
                "first edge of the binning ({}) differs from the lower boundary of trigger bin \"{}\" ({})",
                binning[0], first.name, first.pt_range.0
            )));
        }
        self.check_alignment(binning, false)?;
        Ok(())
    }
}

impl Index<usize> for TriggerBinSet {
    type Output = TriggerBin;

    fn index(&self, index: usize) -> &TriggerBin {
        &self.bins[index]
    }
}

impl<'a> IntoIterator for &'a TriggerBinSet {
    type Item = &'a TriggerBin;
    type IntoIter = std::slice::Iter<'a, TriggerBin>;

    fn into_iter(self) -> Self::IntoIter {
        self.bins.iter()
    }
}

fn resolve_config_path(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(install) = std::env::var_os(INSTALL_ENV) {
        let candidate = PathBuf::from(install).join("config").join(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::Config(format!("failed to find file \"{}\"", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bins() -> TriggerBinSet {
        TriggerBinSet::from_bins([
            TriggerBin::new("B", "HLT_B", (200.0, 500.0), (180.0, 520.0)).unwrap(),
            TriggerBin::new("A", "HLT_A", (100.0, 200.0), (90.0, 220.0)).unwrap(),
        ])
    }

    #[test]
    fn bins_are_sorted_in_pt() {
        let set = two_bins();
        assert_eq!(set.names(), vec!["A", "B"]);
        assert_eq!(set[1].filter_name, "HLT_B");
    }

    #[test]
    fn parse_config_with_infinite_bound() {
        let json = r#"{
            "Jet60": {"filter": "HLT_PFJet60", "ptRange": [100, 200], "ptRangeMargined": [90, 220]},
            "Jet140": {"filter": "HLT_PFJet140", "ptRange": [200, "inf"], "ptRangeMargined": [180, "Infinity"]}
        }"#;
        let set = TriggerBinSet::from_json_str(json).unwrap();
        assert_eq!(set.names(), vec!["Jet60", "Jet140"]);
        assert_eq!(set[1].pt_range.1, f64::INFINITY);
    }

    #[test]
    fn parse_config_errors() {
        let arity = r#"{"A": {"filter": "f", "ptRange": [1, 2, 3], "ptRangeMargined": [0, 4]}}"#;
        assert!(matches!(TriggerBinSet::from_json_str(arity), Err(Error::Config(_))));
        let inverted = r#"{"A": {"filter": "f", "ptRange": [2, 1], "ptRangeMargined": [0, 4]}}"#;
        assert!(matches!(TriggerBinSet::from_json_str(inverted), Err(Error::Config(_))));
        let not_nested = r#"{"A": {"filter": "f", "ptRange": [1, 5], "ptRangeMargined": [0, 4]}}"#;
        assert!(matches!(TriggerBinSet::from_json_str(not_nested), Err(Error::Config(_))));
        let bad_text = r#"{"A": {"filter": "f", "ptRange": [1, "lots"], "ptRangeMargined": [0, 4]}}"#;
        assert!(matches!(TriggerBinSet::from_json_str(bad_text), Err(Error::Config(_))));
    }

    #[test]
    fn clip_drops_and_truncates() {
        let mut set = TriggerBinSet::from_bins([
            TriggerBin::new("A", "a", (100.0, 200.0), (90.0, 220.0)).unwrap(),
            TriggerBin::new("B", "b", (200.0, f64::INFINITY), (180.0, f64::INFINITY)).unwrap(),
            TriggerBin::new("C", "c", (3000.0, f64::INFINITY), (2900.0, f64::INFINITY)).unwrap(),
        ]);
        set.clip(1500.0);
        assert_eq!(set.names(), vec!["A", "B"]);
        assert_eq!(set[1].pt_range, (200.0, 1500.0));
        assert_eq!(set[1].pt_range_margined.1, f64::INFINITY);
        assert_eq!(set[0].pt_range, (100.0, 200.0));
    }

    #[test]
    fn alignment_scenario() {
        let set = two_bins();
        // Repeated edge: not a valid binning
        assert!(set.check_alignment(&[100.0, 200.0, 200.0, 500.0], false).is_err());
        assert!(!set.check_alignment(&[100.0, 200.0, 200.0, 500.0], true).unwrap());
        assert!(!set.check_alignment(&[100.0], true).unwrap());
        assert!(set.check_alignment(&[100.0, 200.0, 500.0], false).unwrap());
        assert!(set.check_alignment(&[90.0, 100.0, 150.0, 200.0, 300.0, 500.0, 520.0], false).unwrap());
    }

    #[test]
    fn misalignment_lists_edges() {
        let set = two_bins();
        assert!(!set.check_alignment(&[100.0, 250.0, 500.0], true).unwrap());
        match set.check_alignment(&[100.0, 250.0, 500.0], false) {
            Err(Error::Alignment { edges }) => assert_eq!(edges, vec![200.0, 200.0]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn alignment_holds_for_concatenated_edges() {
        let set = TriggerBinSet::from_bins([
            TriggerBin::new("A", "a", (50.0, 75.0), (45.0, 80.0)).unwrap(),
            TriggerBin::new("B", "b", (75.0, 130.0), (70.0, 140.0)).unwrap(),
            TriggerBin::new("C", "c", (130.0, 900.0), (120.0, 1000.0)).unwrap(),
        ]);
        let mut edges: Vec<f64> = set.iter().map(|b| b.pt_range.0).collect();
        edges.push(set.last().unwrap().pt_range.1);
        assert!(set.check_alignment(&edges, false).unwrap());
        set.check_contiguous().unwrap();
    }

    #[test]
    fn find_missing_is_not_found() {
        let set = two_bins();
        assert_eq!(set.find("B").unwrap().pt_range, (200.0, 500.0));
        assert!(matches!(set.find("Z"), Err(Error::NotFound(_))));
    }

    #[test]
    fn analysis_binning_checks() {
        let set = two_bins();
        set.validate_analysis_binning(&[100.0, 150.0, 200.0, 500.0]).unwrap();
        assert!(set.validate_analysis_binning(&[90.0, 100.0, 200.0, 500.0]).is_err());
        assert!(set.validate_analysis_binning(&[100.0, 200.0, 500.0, f64::INFINITY]).is_err());
        assert!(matches!(
            set.validate_analysis_binning(&[100.0, 210.0, 500.0]),
            Err(Error::Alignment { .. })
        ));
    }

    #[test]
    fn gap_is_not_contiguous() {
        let set = TriggerBinSet::from_bins([
            TriggerBin::new("A", "a", (100.0, 190.0), (90.0, 220.0)).unwrap(),
            TriggerBin::new("B", "b", (200.0, 500.0), (180.0, 520.0)).unwrap(),
        ]);
        assert!(set.check_contiguous().is_err());
    }
}
