//! Single-pass profile filling from column data with a pt window and weights.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use mj_core::{Columns, Error, Result};

use crate::accumulator::ProfileAccumulator;
use crate::weight::WeightExpr;

/// Half-open interval `[lo, hi)` of the profile abscissa.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    /// Inclusive lower bound.
    pub lo: f64,
    /// Exclusive upper bound (may be `+inf`).
    pub hi: f64,
}

impl Window {
    /// Create a window.
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    /// Window accepting every finite value.
    pub fn unbounded() -> Self {
        Self { lo: f64::NEG_INFINITY, hi: f64::INFINITY }
    }

    /// Whether `x` lies in `[lo, hi)`.
    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        x >= self.lo && x < self.hi
    }
}

/// Negative weight handling policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeWeightPolicy {
    /// Keep negative weights as-is.
    #[default]
    Allow,
    /// Clamp negative weights to 0.
    ClampToZero,
    /// Error on the first negative weight encountered.
    Error,
}

/// What to fill: one profile per observable column versus `x_column`.
#[derive(Debug, Clone)]
pub struct FillSpec {
    /// Column used as the profile abscissa.
    pub x_column: String,
    /// Observable columns, one accumulator each.
    pub y_columns: Vec<String>,
    /// Per-event weight.
    pub weight: WeightExpr,
    /// Events with the abscissa outside this window are skipped.
    pub window: Window,
    /// Policy for negative event weights.
    pub negative_weight_policy: NegativeWeightPolicy,
}

impl FillSpec {
    /// Unit-weight, unbounded spec.
    pub fn new(x_column: impl Into<String>, y_columns: Vec<String>) -> Self {
        Self {
            x_column: x_column.into(),
            y_columns,
            weight: WeightExpr::unit(),
            window: Window::unbounded(),
            negative_weight_policy: NegativeWeightPolicy::Allow,
        }
    }

    /// Set the weight expression.
    pub fn weight(mut self, weight: WeightExpr) -> Self {
        self.weight = weight;
        self
    }

    /// Set the abscissa window.
    pub fn window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Set the negative weight policy.
    pub fn negative_weight_policy(mut self, policy: NegativeWeightPolicy) -> Self {
        self.negative_weight_policy = policy;
        self
    }
}

/// Counters collected while filling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillSummary {
    /// Events inside the window with a finite abscissa and weight.
    pub entries: u64,
    /// Events skipped because the abscissa is outside the window.
    pub outside_window: u64,
    /// Events skipped because of a non-finite abscissa or weight.
    pub non_finite: u64,
    /// Observable values skipped because they are not finite. The event still
    /// fills the profiles of its other observables.
    pub non_finite_observables: u64,
    /// Recorded events with negative weights (before applying the policy).
    pub negative_weight_entries: u64,
}

impl AddAssign for FillSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.entries += rhs.entries;
        self.outside_window += rhs.outside_window;
        self.non_finite += rhs.non_finite;
        self.non_finite_observables += rhs.non_finite_observables;
        self.negative_weight_entries += rhs.negative_weight_entries;
    }
}

/// Fill `accumulators` (one per `spec.y_columns` entry) from `columns` in a
/// single pass.
pub fn fill_profiles(
    columns: &Columns,
    spec: &FillSpec,
    accumulators: &mut [ProfileAccumulator],
) -> Result<FillSummary> {
    if accumulators.len() != spec.y_columns.len() {
        return Err(Error::Validation(format!(
            "{} accumulators supplied for {} observables",
            accumulators.len(),
            spec.y_columns.len()
        )));
    }

    let x = columns.get(&spec.x_column)?;
    let ys: Vec<&[f64]> =
        spec.y_columns.iter().map(|name| columns.get(name)).collect::<Result<_>>()?;
    let weights = spec.weight.eval(columns)?;

    let mut summary = FillSummary::default();
    for entry in 0..columns.n_entries() {
        let xv = x[entry];
        let mut w = weights[entry];
        if !xv.is_finite() || !w.is_finite() {
            summary.non_finite += 1;
            continue;
        }
        if !spec.window.contains(xv) {
            summary.outside_window += 1;
            continue;
        }

        if w < 0.0 {
            match spec.negative_weight_policy {
                NegativeWeightPolicy::Allow => {
                    summary.negative_weight_entries += 1;
                }
                NegativeWeightPolicy::ClampToZero => {
                    summary.negative_weight_entries += 1;
                    w = 0.0;
                }
                NegativeWeightPolicy::Error => {
                    return Err(Error::Validation(format!(
                        "negative weight (x_column='{}', entry={entry}, weight={w})",
                        spec.x_column
                    )));
                }
            }
        }

        for (acc, y) in accumulators.iter_mut().zip(&ys) {
            let yv = y[entry];
            if yv.is_finite() {
                acc.fill(xv, yv, w);
            } else {
                summary.non_finite_observables += 1;
            }
        }
        summary.entries += 1;
    }

    Ok(summary)
}
