//! LOWESS smoothing of systematic variations.
//!
//! The up and down variations are assumed to be mirror images of one shape
//! that differ only by a scale. [`Smoother`] averages them into that shape,
//! smooths it with a locally linear fit over bin indices and rescales it to
//! each variation with a closed-form least-squares fit.

use serde::{Deserialize, Serialize};

use mj_core::{Error, Result};

#[inline]
fn tricube(u: f64) -> f64 {
    let t = 1.0 - u.abs().powi(3);
    if t > 0.0 { t * t * t } else { 0.0 }
}

/// Locally weighted linear regression over bin indices.
///
/// For every index `i` the kernel weights are `tricube((k − i) / bandwidth)`
/// times `external_weights[k]`, normalized to unit sum. The smoothed value is
/// the intercept of the weighted linear fit at `x = 0`. If fewer than two
/// points have a positive weight, the kernel of that index is widened to
/// reach the second-nearest point with a positive external weight.
pub fn lowess(y: &[f64], external_weights: &[f64], bandwidth: f64) -> Result<Vec<f64>> {
    let n = y.len();
    if external_weights.len() != n {
        return Err(Error::Validation(format!(
            "lowess: {} values but {} weights",
            n,
            external_weights.len()
        )));
    }
    if !(bandwidth.is_finite() && bandwidth > 0.0) {
        return Err(Error::Validation(format!("lowess: invalid bandwidth {bandwidth}")));
    }
    if let Some(bad) = external_weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
        return Err(Error::Validation(format!("lowess: invalid external weight {bad}")));
    }
    let support: Vec<usize> = (0..n).filter(|&k| external_weights[k] > 0.0).collect();
    if support.is_empty() {
        return Err(Error::Validation("lowess: all external weights are zero".into()));
    }
    let non_finite = support.iter().filter(|&&k| !y[k].is_finite()).count();
    if non_finite > 0 {
        log::warn!("lowess: {non_finite} input values with positive weight are not finite");
    }

    let mut smoothed = Vec::with_capacity(n);
    let mut weights = vec![0.0; n];
    for i in 0..n {
        if support.len() == 1 {
            smoothed.push(y[support[0]]);
            continue;
        }

        let mut bw = bandwidth;
        if fill_kernel(&mut weights, external_weights, i, bw) < 2 {
            let mut distances: Vec<usize> = support.iter().map(|&k| k.abs_diff(i)).collect();
            distances.sort_unstable();
            bw = distances[1] as f64 + 1.0;
            log::debug!("lowess: kernel at index {i} widened from {bandwidth} to {bw}");
            fill_kernel(&mut weights, external_weights, i, bw);
        }

        let total: f64 = weights.iter().sum();
        let (mut mean_x, mut mean_y, mut mean_x2, mut mean_xy) = (0.0, 0.0, 0.0, 0.0);
        for (k, w) in weights.iter().enumerate() {
            if *w == 0.0 {
                continue;
            }
            let w = w / total;
            let x = k as f64 - i as f64;
            mean_x += w * x;
            mean_y += w * y[k];
            mean_x2 += w * x * x;
            mean_xy += w * x * y[k];
        }
        smoothed.push((mean_x2 * mean_y - mean_x * mean_xy) / (mean_x2 - mean_x * mean_x));
    }
    Ok(smoothed)
}

/// Combined kernel and external weights around `i`; returns the number of
/// positive entries.
fn fill_kernel(weights: &mut [f64], external: &[f64], i: usize, bandwidth: f64) -> usize {
    let mut positive = 0;
    for (k, w) in weights.iter_mut().enumerate() {
        *w = tricube((k as f64 - i as f64) / bandwidth) * external[k];
        if *w > 0.0 {
            positive += 1;
        }
    }
    positive
}

/// Smoothed up and down variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedVariation {
    /// Smoothed up variation.
    pub up: Vec<f64>,
    /// Smoothed down variation.
    pub down: Vec<f64>,
    /// Smoothed relative shape shared by both directions.
    pub shape: Vec<f64>,
    /// Scale applied to the shape for the up variation.
    pub scale_up: f64,
    /// Scale applied to the shape for the down variation.
    pub scale_down: f64,
}

/// Smooths a pair of systematic variations.
///
/// With a nominal template the variations are absolute and the shape is
/// relative to the nominal; without one they are relative deviations already.
#[derive(Debug, Clone)]
pub struct Smoother {
    nominal: Option<Vec<f64>>,
    up: Vec<f64>,
    down: Vec<f64>,
    weights: Vec<f64>,
}

impl Smoother {
    /// Absolute templates.
    pub fn new(nominal: Vec<f64>, up: Vec<f64>, down: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        check_lengths(nominal.len(), &up, &down, &weights)?;
        Ok(Self { nominal: Some(nominal), up, down, weights })
    }

    /// Relative deviations (nominal treated as zero).
    pub fn from_relative(up: Vec<f64>, down: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        check_lengths(up.len(), &up, &down, &weights)?;
        Ok(Self { nominal: None, up, down, weights })
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.up.len()
    }

    /// Whether there are no bins.
    pub fn is_empty(&self) -> bool {
        self.up.is_empty()
    }

    /// Half the difference between up and down, relative to the nominal in
    /// absolute mode.
    pub fn averaged_deviation(&self) -> Vec<f64> {
        let half: Vec<f64> = self.up.iter().zip(&self.down).map(|(u, d)| 0.5 * (u - d)).collect();
        match &self.nominal {
            Some(nominal) => half.iter().zip(nominal).map(|(h, n)| h / n).collect(),
            None => half,
        }
    }

    /// Smooth the averaged deviation with a LOWESS of the given bandwidth (in
    /// bins) and rescale it to each variation. `symmetric` fixes the scales
    /// to +1 and −1.
    pub fn smooth(&self, bandwidth: f64, symmetric: bool) -> Result<SmoothedVariation> {
        let shape = lowess(&self.averaged_deviation(), &self.weights, bandwidth)?;

        let (scale_up, scale_down) = if symmetric {
            (1.0, -1.0)
        } else {
            let fit = |template: &[f64], fallback: f64, label: &str| {
                self.scale_factor(&shape, template).unwrap_or_else(|| {
                    log::warn!("scale factor for {label} variation is undefined, using {fallback}");
                    fallback
                })
            };
            (fit(&self.up, 1.0, "up"), fit(&self.down, -1.0, "down"))
        };

        let apply = |scale: f64| -> Vec<f64> {
            match &self.nominal {
                Some(nominal) => {
                    shape.iter().zip(nominal).map(|(s, n)| n * (1.0 + scale * s)).collect()
                }
                None => shape.iter().map(|s| scale * s).collect(),
            }
        };
        let up = apply(scale_up);
        let down = apply(scale_down);
        Ok(SmoothedVariation { up, down, shape, scale_up, scale_down })
    }

    /// Scale `k` minimizing `Σ w (template − nominal − k · shape_abs)²`, where
    /// `shape_abs` is the relative `shape` converted to absolute units.
    ///
    /// Returns `None` when the denominator vanishes or the result is not
    /// finite.
    pub fn scale_factor(&self, shape: &[f64], template: &[f64]) -> Option<f64> {
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..self.len() {
            let (shape_abs, base) = match &self.nominal {
                Some(nominal) => (shape[i] * nominal[i], nominal[i]),
                None => (shape[i], 0.0),
            };
            num += shape_abs * (template[i] - base) * self.weights[i];
            den += shape_abs * shape_abs * self.weights[i];
        }
        let scale = num / den;
        (den != 0.0 && scale.is_finite()).then_some(scale)
    }
}

fn check_lengths(n: usize, up: &[f64], down: &[f64], weights: &[f64]) -> Result<()> {
    if up.len() != n || down.len() != n || weights.len() != n {
        return Err(Error::Validation(format!(
            "smoother inputs differ in length: nominal={n}, up={}, down={}, weights={}",
            up.len(),
            down.len(),
            weights.len()
        )));
    }
    Ok(())
}
