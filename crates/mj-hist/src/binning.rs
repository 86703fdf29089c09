//! Bin-edge helpers shared by profiles and accumulators.

use mj_core::{Error, Result};

/// Check that `edges` describes a valid binning: at least two edges, no NaN,
/// strictly increasing.
pub fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::Config(format!(
            "binning requires at least 2 edges, got {}",
            edges.len()
        )));
    }
    if let Some(i) = edges.iter().position(|e| e.is_nan()) {
        return Err(Error::Config(format!("binning edge {i} is NaN")));
    }
    if let Some(i) = edges.windows(2).position(|w| w[0] >= w[1]) {
        return Err(Error::Config(format!(
            "binning is not strictly increasing: edges[{i}]={} >= edges[{}]={}",
            edges[i],
            i + 1,
            edges[i + 1]
        )));
    }
    Ok(())
}

/// `num` edges spaced evenly on a log scale from `start` to `stop` inclusive.
///
/// The end points are reproduced exactly.
pub fn geomspace(start: f64, stop: f64, num: usize) -> Result<Vec<f64>> {
    if !(start > 0.0 && stop > start && stop.is_finite()) {
        return Err(Error::Config(format!(
            "logarithmic binning requires 0 < start < stop < inf, got start={start}, stop={stop}"
        )));
    }
    if num < 2 {
        return Err(Error::Config(format!("logarithmic binning requires at least 2 edges, got {num}")));
    }

    let log_start = start.ln();
    let step = (stop.ln() - log_start) / (num - 1) as f64;
    let mut edges: Vec<f64> = (0..num).map(|i| (log_start + step * i as f64).exp()).collect();
    edges[0] = start;
    edges[num - 1] = stop;
    Ok(edges)
}

/// Index of the bin containing `x`, counting underflow as 0 and overflow as
/// `n_bins + 1`, as ROOT does. Bins are closed on the left.
///
/// NaN lands in the underflow.
#[inline]
pub fn find_bin(edges: &[f64], x: f64) -> usize {
    // Number of edges <= x is exactly the ROOT bin index for in-range values.
    edges.partition_point(|&e| e <= x)
}
