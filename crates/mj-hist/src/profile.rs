//! Binned mean/uncertainty representation with under- and overflow bins.

use serde::{Deserialize, Serialize};

use mj_core::{Error, Result};

use crate::binning::validate_edges;

/// A 1D profile (or histogram) including under- and overflow bins.
///
/// `contents[0]` is the underflow, `contents[1..=n]` the regular bins and
/// `contents[n + 1]` the overflow, where `n = binning.len() - 1`. `errors`
/// has the same layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProfile")]
pub struct Profile1D {
    /// Bin edges (length = n_bins + 1, strictly increasing).
    pub binning: Vec<f64>,
    /// Bin contents (length = n_bins + 2).
    pub contents: Vec<f64>,
    /// Standard errors of the contents (length = n_bins + 2).
    pub errors: Vec<f64>,
}

#[derive(Deserialize)]
struct RawProfile {
    binning: Vec<f64>,
    contents: Vec<f64>,
    #[serde(default)]
    errors: Option<Vec<f64>>,
}

impl TryFrom<RawProfile> for Profile1D {
    type Error = Error;

    fn try_from(raw: RawProfile) -> Result<Self> {
        Profile1D::from_parts(raw.binning, Some(raw.contents), raw.errors)
    }
}

impl Profile1D {
    /// Empty profile with the given binning.
    pub fn new(binning: Vec<f64>) -> Result<Self> {
        validate_edges(&binning)?;
        let n = binning.len() + 1;
        Ok(Self { binning, contents: vec![0.0; n], errors: vec![0.0; n] })
    }

    /// Build from a binning and optional contents and errors.
    ///
    /// Contents and errors may be given either with under/overflow
    /// (`n_bins + 2` values) or without (`n_bins` values, flows set to zero).
    /// When contents are given without errors, the errors default to
    /// `sqrt(contents)` (Poisson-like, as for plain histograms).
    pub fn from_parts(
        binning: Vec<f64>,
        contents: Option<Vec<f64>>,
        errors: Option<Vec<f64>>,
    ) -> Result<Self> {
        let mut profile = Self::new(binning)?;
        let full = profile.contents.len();

        if let (Some(c), Some(e)) = (&contents, &errors)
            && c.len() != e.len()
        {
            return Err(Error::Validation(format!(
                "inconsistent arrays of bin contents ({}) and errors ({})",
                c.len(),
                e.len()
            )));
        }

        if let Some(contents) = contents {
            place_values(&mut profile.contents, &contents, "contents")?;
            if errors.is_none() {
                profile.errors = profile.contents.iter().map(|c| c.abs().sqrt()).collect();
            }
        }
        if let Some(errors) = errors {
            place_values(&mut profile.errors, &errors, "errors")?;
        }

        debug_assert_eq!(profile.contents.len(), full);
        Ok(profile)
    }

    /// Number of regular bins (under/overflow excluded).
    pub fn num_bins(&self) -> usize {
        self.binning.len() - 1
    }

    /// Contents of the regular bins.
    pub fn interior_contents(&self) -> &[f64] {
        &self.contents[1..=self.num_bins()]
    }

    /// Errors of the regular bins.
    pub fn interior_errors(&self) -> &[f64] {
        &self.errors[1..=self.num_bins()]
    }

    /// Content and error of bin `index` (0 = underflow, `n_bins + 1` = overflow).
    pub fn bin(&self, index: usize) -> (f64, f64) {
        (self.contents[index], self.errors[index])
    }

    /// Whether `other` has exactly the same bin edges.
    pub fn same_binning(&self, other: &Profile1D) -> bool {
        self.binning == other.binning
    }

    /// Check the shape invariant `contents.len() == errors.len() == binning.len() + 1`.
    pub fn check_shape(&self) -> Result<()> {
        validate_edges(&self.binning)?;
        let expected = self.binning.len() + 1;
        if self.contents.len() != expected || self.errors.len() != expected {
            return Err(Error::Validation(format!(
                "profile shape mismatch: {} edges, {} contents, {} errors",
                self.binning.len(),
                self.contents.len(),
                self.errors.len()
            )));
        }
        Ok(())
    }
}

fn place_values(target: &mut [f64], values: &[f64], what: &str) -> Result<()> {
    let full = target.len();
    if values.len() == full {
        target.copy_from_slice(values);
    } else if values.len() + 2 == full {
        // Under- and overflows are missing
        target[1..full - 1].copy_from_slice(values);
    } else {
        return Err(Error::Validation(format!(
            "unexpected length of array of bin {what}: {} (expected {} or {})",
            values.len(),
            full - 2,
            full
        )));
    }
    Ok(())
}
