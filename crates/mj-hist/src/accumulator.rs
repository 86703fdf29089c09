//! Weighted sums behind a profile, kept separate from the finalized means so
//! that partial fills can be merged and rebinned without loss.

use serde::{Deserialize, Serialize};

use mj_core::{Error, Result};

use crate::binning::{find_bin, validate_edges};
use crate::profile::Profile1D;

/// Per-bin sums Σw, Σw², Σw·y, Σw·y² of a profile, under/overflow included.
///
/// All sum vectors have length `n_bins + 2` with the same layout as
/// [`Profile1D`]. Merging is associative and commutative up to floating-point
/// rounding, so accumulators filled on separate threads can be combined in
/// any grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAccumulator")]
pub struct ProfileAccumulator {
    binning: Vec<f64>,
    sumw: Vec<f64>,
    sumw2: Vec<f64>,
    sumwy: Vec<f64>,
    sumwy2: Vec<f64>,
    entries: u64,
}

#[derive(Deserialize)]
struct RawAccumulator {
    binning: Vec<f64>,
    sumw: Vec<f64>,
    sumw2: Vec<f64>,
    sumwy: Vec<f64>,
    sumwy2: Vec<f64>,
    #[serde(default)]
    entries: u64,
}

impl TryFrom<RawAccumulator> for ProfileAccumulator {
    type Error = Error;

    fn try_from(raw: RawAccumulator) -> Result<Self> {
        validate_edges(&raw.binning)?;
        let expected = raw.binning.len() + 1;
        for (name, v) in [
            ("sumw", &raw.sumw),
            ("sumw2", &raw.sumw2),
            ("sumwy", &raw.sumwy),
            ("sumwy2", &raw.sumwy2),
        ] {
            if v.len() != expected {
                return Err(Error::Validation(format!(
                    "accumulator array '{name}' has length {}, expected {expected}",
                    v.len()
                )));
            }
        }
        Ok(Self {
            binning: raw.binning,
            sumw: raw.sumw,
            sumw2: raw.sumw2,
            sumwy: raw.sumwy,
            sumwy2: raw.sumwy2,
            entries: raw.entries,
        })
    }
}

impl ProfileAccumulator {
    /// Empty accumulator over the given bin edges.
    pub fn new(binning: Vec<f64>) -> Result<Self> {
        validate_edges(&binning)?;
        let n = binning.len() + 1;
        Ok(Self {
            binning,
            sumw: vec![0.0; n],
            sumw2: vec![0.0; n],
            sumwy: vec![0.0; n],
            sumwy2: vec![0.0; n],
            entries: 0,
        })
    }

    /// Bin edges.
    pub fn binning(&self) -> &[f64] {
        &self.binning
    }

    /// Number of regular bins.
    pub fn num_bins(&self) -> usize {
        self.binning.len() - 1
    }

    /// Number of filled entries.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Σw per bin, flows included.
    pub fn sumw(&self) -> &[f64] {
        &self.sumw
    }

    /// Σw² per bin, flows included.
    pub fn sumw2(&self) -> &[f64] {
        &self.sumw2
    }

    /// Σw·y per bin, flows included.
    pub fn sumwy(&self) -> &[f64] {
        &self.sumwy
    }

    /// Σw·y² per bin, flows included.
    pub fn sumwy2(&self) -> &[f64] {
        &self.sumwy2
    }

    /// Record one entry with abscissa `x`, value `y` and weight `w`.
    #[inline]
    pub fn fill(&mut self, x: f64, y: f64, w: f64) {
        let bin = find_bin(&self.binning, x);
        self.fill_bin(bin, y, w);
    }

    /// Record one entry directly into bin `bin` (ROOT indexing).
    #[inline]
    pub fn fill_bin(&mut self, bin: usize, y: f64, w: f64) {
        self.sumw[bin] += w;
        self.sumw2[bin] += w * w;
        self.sumwy[bin] += w * y;
        self.sumwy2[bin] += w * y * y;
        self.entries += 1;
    }

    /// Add the sums of `other`, which must have the same binning.
    pub fn merge(&mut self, other: &ProfileAccumulator) -> Result<()> {
        if self.binning != other.binning {
            return Err(Error::Validation(format!(
                "cannot merge accumulators with different binnings ({} vs {} edges)",
                self.binning.len(),
                other.binning.len()
            )));
        }
        for (dst, src) in [
            (&mut self.sumw, &other.sumw),
            (&mut self.sumw2, &other.sumw2),
            (&mut self.sumwy, &other.sumwy),
            (&mut self.sumwy2, &other.sumwy2),
        ] {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Sum a sequence of accumulators sharing one binning.
    pub fn merge_all<'a, I>(items: I) -> Result<Option<ProfileAccumulator>>
    where
        I: IntoIterator<Item = &'a ProfileAccumulator>,
    {
        let mut iter = items.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        let mut total = first.clone();
        for acc in iter {
            total.merge(acc)?;
        }
        Ok(Some(total))
    }

    /// Rebin to `new_edges`, each of which must coincide with an edge of the
    /// current binning.
    ///
    /// Regular bins below the new first edge go to the underflow and bins
    /// above the new last edge to the overflow.
    pub fn rebin(&self, new_edges: &[f64]) -> Result<ProfileAccumulator> {
        validate_edges(new_edges)?;
        let misaligned: Vec<f64> =
            new_edges.iter().copied().filter(|e| !self.binning.contains(e)).collect();
        if !misaligned.is_empty() {
            return Err(Error::Validation(format!(
                "cannot rebin: edges {misaligned:?} are not present in the source binning"
            )));
        }

        let mut out = ProfileAccumulator::new(new_edges.to_vec())?;
        let n_old = self.num_bins();
        for old in 0..n_old + 2 {
            let target = match old {
                0 => 0,
                i if i == n_old + 1 => out.num_bins() + 1,
                // Left edge of a regular bin identifies its new bin
                i => find_bin(new_edges, self.binning[i - 1]),
            };
            out.sumw[target] += self.sumw[old];
            out.sumw2[target] += self.sumw2[old];
            out.sumwy[target] += self.sumwy[old];
            out.sumwy2[target] += self.sumwy2[old];
        }
        out.entries = self.entries;
        Ok(out)
    }

    /// Mean and its standard error per bin, as a ROOT profile computes them.
    ///
    /// Mean is Σwy/Σw; the error is the weighted spread divided by the square
    /// root of the effective entry count (Σw)²/Σw². Bins with Σw = 0 get
    /// content and error 0.
    pub fn finalize(&self) -> Profile1D {
        let n = self.sumw.len();
        let mut contents = vec![0.0; n];
        let mut errors = vec![0.0; n];
        for i in 0..n {
            let sw = self.sumw[i];
            if sw == 0.0 {
                continue;
            }
            let mean = self.sumwy[i] / sw;
            let spread2 = (self.sumwy2[i] / sw - mean * mean).max(0.0);
            let n_eff = sw * sw / self.sumw2[i];
            contents[i] = mean;
            errors[i] = (spread2 / n_eff).sqrt();
        }
        Profile1D { binning: self.binning.clone(), contents, errors }
    }
}
