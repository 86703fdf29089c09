//! Weighted cubic smoothing splines in log(pt).
//!
//! The fitted spline is the natural cubic spline `f` with knots at the data
//! abscissae that minimizes `∫ f''(x)² dx` subject to
//! `Σ (w_i (y_i − f(x_i)))² ≤ s`. The penalized problem for a fixed
//! Lagrange parameter is solved with Reinsch's algorithm (a banded
//! pentadiagonal system); the parameter itself is found by bisection in
//! log-space so that the constraint holds with equality.
//!
//! Evaluation outside the knot range continues the cubic polynomial of the
//! first or last interval.

use serde::{Deserialize, Serialize};

use mj_core::{Error, Result};
use mj_hist::Profile1D;

/// Minimal number of distinct points for a cubic smoothing spline.
pub const MIN_POINTS: usize = 4;

const MAX_BRACKET_STEPS: usize = 60;
const MAX_BISECTION_STEPS: usize = 200;

/// How to treat points with a non-finite abscissa, value or weight, or a
/// non-positive weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Reject the input with a validation error.
    #[default]
    Error,
    /// Drop such points and fit the remaining ones.
    Skip,
}

/// Piecewise cubic function.
///
/// On interval `i` (`knots[i] <= x < knots[i + 1]`) the value is
/// `c0 + c1 t + c2 t² + c3 t³` with `t = x − knots[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spline {
    knots: Vec<f64>,
    coeffs: Vec<[f64; 4]>,
}

impl Spline {
    /// C² cubic spline through `values` at `knots` with second derivatives
    /// `second` at the knots.
    fn from_values_and_curvatures(knots: Vec<f64>, values: &[f64], second: &[f64]) -> Self {
        let coeffs = knots
            .windows(2)
            .enumerate()
            .map(|(i, k)| {
                let h = k[1] - k[0];
                let (g0, g1) = (values[i], values[i + 1]);
                let (m0, m1) = (second[i], second[i + 1]);
                [g0, (g1 - g0) / h - h * (2.0 * m0 + m1) / 6.0, m0 / 2.0, (m1 - m0) / (6.0 * h)]
            })
            .collect();
        Self { knots, coeffs }
    }

    /// Knot positions (the fit abscissae).
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// `(first knot, last knot)`.
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    #[inline]
    fn interval(&self, x: f64) -> usize {
        let last = self.coeffs.len() - 1;
        self.knots.partition_point(|&k| k <= x).saturating_sub(1).min(last)
    }

    /// Value at `x` (in log(pt)).
    pub fn eval(&self, x: f64) -> f64 {
        let i = self.interval(x);
        let t = x - self.knots[i];
        let [c0, c1, c2, c3] = self.coeffs[i];
        c0 + t * (c1 + t * (c2 + t * c3))
    }

    /// Values at each of `xs` (in log(pt)).
    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }

    /// Values at each pt, i.e. at `log(pt)`.
    pub fn evaluate(&self, pt: &[f64]) -> Vec<f64> {
        pt.iter().map(|&p| self.eval(p.ln())).collect()
    }

    /// Value at a single pt.
    pub fn evaluate_pt(&self, pt: f64) -> f64 {
        self.eval(pt.ln())
    }

    /// Derivative of the given order (order 0 returns a copy).
    pub fn derivative(&self, order: usize) -> Spline {
        let mut coeffs = self.coeffs.clone();
        for _ in 0..order.min(4) {
            for c in &mut coeffs {
                *c = [c[1], 2.0 * c[2], 3.0 * c[3], 0.0];
            }
        }
        Spline { knots: self.knots.clone(), coeffs }
    }

    /// Knots, values and boundary second derivatives.
    pub fn to_stored(&self) -> StoredSpline {
        let values = self.eval_many(&self.knots);
        let second = self.derivative(2);
        let (lo, hi) = self.domain();
        StoredSpline { knots: self.knots.clone(), values, b2: second.eval(lo), e2: second.eval(hi) }
    }
}

/// Persisted form of a spline: values at the knots plus the second
/// derivatives at the two ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSpline {
    /// Knot positions.
    pub knots: Vec<f64>,
    /// Values at the knots.
    pub values: Vec<f64>,
    /// Second derivative at the first knot.
    pub b2: f64,
    /// Second derivative at the last knot.
    pub e2: f64,
}

impl StoredSpline {
    /// Rebuild the C² cubic spline with the stored values and end second
    /// derivatives.
    pub fn to_spline(&self) -> Result<Spline> {
        let n = self.knots.len();
        if n < 2 || self.values.len() != n {
            return Err(Error::Validation(format!(
                "stored spline needs at least 2 knots and one value per knot (knots={n}, values={})",
                self.values.len()
            )));
        }
        if self.knots.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(Error::Validation("stored spline knots are not strictly increasing".into()));
        }

        let (x, y) = (&self.knots, &self.values);
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        let m = n - 2;
        let mut second = vec![0.0; n];
        second[0] = self.b2;
        second[n - 1] = self.e2;

        // Tridiagonal system for the interior second derivatives (Thomas algorithm)
        let mut c_prime = vec![0.0; m];
        let mut d_prime = vec![0.0; m];
        for j in 0..m {
            let i = j + 1;
            let sub = if j > 0 { h[i - 1] } else { 0.0 };
            let sup = if j + 1 < m { h[i] } else { 0.0 };
            let mut rhs = 6.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
            if j == 0 {
                rhs -= h[0] * self.b2;
            }
            if j + 1 == m {
                rhs -= h[n - 2] * self.e2;
            }
            let (prev_c, prev_d) = if j > 0 { (c_prime[j - 1], d_prime[j - 1]) } else { (0.0, 0.0) };
            let denom = 2.0 * (h[i - 1] + h[i]) - sub * prev_c;
            c_prime[j] = sup / denom;
            d_prime[j] = (rhs - sub * prev_d) / denom;
        }
        for j in (0..m).rev() {
            let next = if j + 1 < m { second[j + 2] } else { 0.0 };
            second[j + 1] = d_prime[j] - c_prime[j] * next;
        }

        Ok(Spline::from_values_and_curvatures(x.clone(), y, &second))
    }
}

/// Fits weighted cubic smoothing splines.
#[derive(Debug, Clone, Default)]
pub struct SplineRegressor {
    smoothing: Option<f64>,
    non_finite: NonFinitePolicy,
}

impl SplineRegressor {
    /// Regressor with the default smoothing (`s` = number of points).
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit smoothing condition `s`. `s <= 0` interpolates.
    pub fn with_smoothing(mut self, s: f64) -> Self {
        self.smoothing = Some(s);
        self
    }

    /// Set the policy for non-finite inputs.
    pub fn with_non_finite_policy(mut self, policy: NonFinitePolicy) -> Self {
        self.non_finite = policy;
        self
    }

    /// Fit points `(log_x[i], y[i])` with weights `weight[i]` (inverse errors).
    pub fn fit(&self, log_x: &[f64], y: &[f64], weight: &[f64]) -> Result<Spline> {
        if log_x.len() != y.len() || y.len() != weight.len() {
            return Err(Error::Validation(format!(
                "spline inputs differ in length: x={}, y={}, w={}",
                log_x.len(),
                y.len(),
                weight.len()
            )));
        }

        let mut points: Vec<(f64, f64, f64)> = Vec::with_capacity(y.len());
        let mut skipped = 0usize;
        for i in 0..y.len() {
            let (xi, yi, wi) = (log_x[i], y[i], weight[i]);
            if xi.is_finite() && yi.is_finite() && wi.is_finite() && wi > 0.0 {
                points.push((xi, yi, wi));
                continue;
            }
            match self.non_finite {
                NonFinitePolicy::Error => {
                    return Err(Error::Validation(format!(
                        "unusable spline input at index {i}: x={xi}, y={yi}, w={wi}"
                    )));
                }
                NonFinitePolicy::Skip => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("{skipped} points with non-finite inputs or non-positive weights skipped in spline fit");
        }

        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let distinct = 1 + points.windows(2).filter(|w| w[0].0 != w[1].0).count();
        if points.is_empty() || distinct < MIN_POINTS {
            return Err(Error::InsufficientData {
                needed: MIN_POINTS,
                got: if points.is_empty() { 0 } else { distinct },
            });
        }
        if distinct != points.len() {
            return Err(Error::Validation("duplicate abscissae in spline input".into()));
        }

        let system = ReinschSystem::new(&points);
        let s = self.smoothing.unwrap_or(points.len() as f64);
        system.fit(s)
    }

    /// Fit `profile` against the mean pt given by `pt_profile`, using the
    /// regular bins only and weights `1 / error`.
    pub fn fit_profile(&self, pt_profile: &Profile1D, profile: &Profile1D) -> Result<Spline> {
        if !pt_profile.same_binning(profile) {
            return Err(Error::Validation("pt profile and fitted profile have different binnings".into()));
        }
        self.fit_profile_at(pt_profile.interior_contents(), profile)
    }

    /// Fit the regular bins of `profile` at abscissae `log(mean_pt)`.
    pub fn fit_profile_at(&self, mean_pt: &[f64], profile: &Profile1D) -> Result<Spline> {
        if mean_pt.len() != profile.num_bins() {
            return Err(Error::Validation(format!(
                "{} mean pt values given for a profile with {} bins",
                mean_pt.len(),
                profile.num_bins()
            )));
        }
        let log_x: Vec<f64> = mean_pt.iter().map(|p| p.ln()).collect();
        let weight: Vec<f64> = profile.interior_errors().iter().map(|e| 1.0 / e).collect();
        self.fit(&log_x, profile.interior_contents(), &weight)
    }
}

/// Penalized least-squares system of Reinsch's algorithm.
///
/// With `Q` the n×(n−2) second-difference matrix, `R` the (n−2)×(n−2)
/// tridiagonal Gram matrix and `D² = diag(1/w²)`, the smoothing spline for
/// parameter `α` has interior second derivatives `γ` solving
/// `(R + α QᵀD²Q) γ = Qᵀy` and values `g = y − α D² Q γ`.
struct ReinschSystem {
    x: Vec<f64>,
    y: Vec<f64>,
    w2: Vec<f64>,
    h: Vec<f64>,
}

struct Solution {
    values: Vec<f64>,
    second: Vec<f64>,
    chi2: f64,
}

impl ReinschSystem {
    fn new(points: &[(f64, f64, f64)]) -> Self {
        let x: Vec<f64> = points.iter().map(|p| p.0).collect();
        let y = points.iter().map(|p| p.1).collect();
        let w2 = points.iter().map(|p| p.2 * p.2).collect();
        let h = x.windows(2).map(|w| w[1] - w[0]).collect();
        Self { x, y, w2, h }
    }

    fn n(&self) -> usize {
        self.x.len()
    }

    /// Entries of column `k` of `Q` at rows `k`, `k + 1`, `k + 2`.
    #[inline]
    fn q(&self, k: usize) -> [f64; 3] {
        let (h0, h1) = (self.h[k], self.h[k + 1]);
        [1.0 / h0, -1.0 / h0 - 1.0 / h1, 1.0 / h1]
    }

    fn fit(&self, s: f64) -> Result<Spline> {
        if s <= 0.0 {
            return Ok(self.spline(self.solve(0.0)?));
        }

        let (line, chi2_line) = self.linear_fit();
        if s >= chi2_line {
            log::debug!("smoothing condition {s} exceeds straight-line chi2 {chi2_line}");
            return Ok(line);
        }

        // Bracket the Lagrange parameter, then bisect in log(alpha)
        let mut alpha = self.initial_alpha();
        let first = self.solve(alpha)?;
        let (mut lo, mut hi);
        if first.chi2 < s {
            lo = alpha;
            let mut steps = 0;
            loop {
                alpha *= 10.0;
                if self.solve(alpha)?.chi2 >= s {
                    hi = alpha;
                    break;
                }
                lo = alpha;
                steps += 1;
                if steps == MAX_BRACKET_STEPS {
                    return Err(Error::Computation("failed to bracket the smoothing parameter".into()));
                }
            }
        } else {
            hi = alpha;
            let mut steps = 0;
            loop {
                alpha /= 10.0;
                if self.solve(alpha)?.chi2 < s {
                    lo = alpha;
                    break;
                }
                hi = alpha;
                steps += 1;
                if steps == MAX_BRACKET_STEPS {
                    return Err(Error::Computation("failed to bracket the smoothing parameter".into()));
                }
            }
        }

        let mut best = self.solve((lo * hi).sqrt())?;
        for _ in 0..MAX_BISECTION_STEPS {
            let mid = (lo * hi).sqrt();
            best = self.solve(mid)?;
            if (best.chi2 - s).abs() <= 1e-12 * s || hi / lo - 1.0 <= 1e-14 {
                break;
            }
            if best.chi2 < s {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(self.spline(best))
    }

    fn spline(&self, sol: Solution) -> Spline {
        Spline::from_values_and_curvatures(self.x.clone(), &sol.values, &sol.second)
    }

    /// Ratio of the traces of `R` and `QᵀD²Q`: a scale where both terms matter.
    fn initial_alpha(&self) -> f64 {
        let m = self.n() - 2;
        let mut tr_r = 0.0;
        let mut tr_q = 0.0;
        for k in 0..m {
            tr_r += (self.h[k] + self.h[k + 1]) / 3.0;
            let [a, b, c] = self.q(k);
            tr_q += a * a / self.w2[k] + b * b / self.w2[k + 1] + c * c / self.w2[k + 2];
        }
        tr_r / tr_q
    }

    fn linear_fit(&self) -> (Spline, f64) {
        let (mut sw, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..self.n() {
            let (w, x, y) = (self.w2[i], self.x[i], self.y[i]);
            sw += w;
            sx += w * x;
            sy += w * y;
            sxx += w * x * x;
            sxy += w * x * y;
        }
        let slope = (sw * sxy - sx * sy) / (sw * sxx - sx * sx);
        let intercept = (sy - slope * sx) / sw;
        let values: Vec<f64> = self.x.iter().map(|x| intercept + slope * x).collect();
        let chi2 = (0..self.n()).map(|i| self.w2[i] * (self.y[i] - values[i]).powi(2)).sum();
        let second = vec![0.0; self.n()];
        (Spline::from_values_and_curvatures(self.x.clone(), &values, &second), chi2)
    }

    fn solve(&self, alpha: f64) -> Result<Solution> {
        let n = self.n();
        let m = n - 2;
        let d2: Vec<f64> = self.w2.iter().map(|w| 1.0 / w).collect();

        // Pentadiagonal matrix: main diagonal and the two upper diagonals
        let mut diag0 = vec![0.0; m];
        let mut diag1 = vec![0.0; m];
        let mut diag2 = vec![0.0; m];
        let mut rhs = vec![0.0; m];
        for k in 0..m {
            let [a, b, c] = self.q(k);
            diag0[k] = (self.h[k] + self.h[k + 1]) / 3.0
                + alpha * (a * a * d2[k] + b * b * d2[k + 1] + c * c * d2[k + 2]);
            if k + 1 < m {
                let [a1, b1, _] = self.q(k + 1);
                diag1[k] = self.h[k + 1] / 6.0 + alpha * (b * a1 * d2[k + 1] + c * b1 * d2[k + 2]);
            }
            if k + 2 < m {
                let [a2, _, _] = self.q(k + 2);
                diag2[k] = alpha * c * a2 * d2[k + 2];
            }
            rhs[k] = a * self.y[k] + b * self.y[k + 1] + c * self.y[k + 2];
        }
        let gamma = solve_pentadiagonal(&diag0, &diag1, &diag2, rhs)?;

        // Q γ, then g = y − α D² Q γ
        let mut q_gamma = vec![0.0; n];
        for (k, gk) in gamma.iter().enumerate() {
            let [a, b, c] = self.q(k);
            q_gamma[k] += a * gk;
            q_gamma[k + 1] += b * gk;
            q_gamma[k + 2] += c * gk;
        }
        let values: Vec<f64> =
            (0..n).map(|i| self.y[i] - alpha * d2[i] * q_gamma[i]).collect();
        let chi2 = (0..n).map(|i| alpha * alpha * q_gamma[i] * q_gamma[i] * d2[i]).sum();

        let mut second = vec![0.0; n];
        second[1..n - 1].copy_from_slice(&gamma);
        Ok(Solution { values, second, chi2 })
    }
}

/// Solve a symmetric positive definite pentadiagonal system with an LDLᵀ
/// factorization. `d0` is the main diagonal, `d1[k]` the entry `(k, k+1)` and
/// `d2[k]` the entry `(k, k+2)`.
fn solve_pentadiagonal(d0: &[f64], d1: &[f64], d2: &[f64], mut b: Vec<f64>) -> Result<Vec<f64>> {
    let m = d0.len();
    let mut d = vec![0.0; m];
    let mut f = vec![0.0; m];
    let mut g = vec![0.0; m];
    for k in 0..m {
        let mut dk = d0[k];
        if k >= 1 {
            dk -= f[k - 1] * f[k - 1] * d[k - 1];
        }
        if k >= 2 {
            dk -= g[k - 2] * g[k - 2] * d[k - 2];
        }
        if !(dk > 0.0) || !dk.is_finite() {
            return Err(Error::Computation(format!(
                "smoothing spline system is not positive definite (pivot {k} = {dk})"
            )));
        }
        d[k] = dk;
        let mut fk = d1[k];
        if k >= 1 {
            fk -= g[k - 1] * f[k - 1] * d[k - 1];
        }
        f[k] = fk / dk;
        g[k] = d2[k] / dk;
    }

    for k in 0..m {
        if k >= 1 {
            b[k] -= f[k - 1] * b[k - 1];
        }
        if k >= 2 {
            b[k] -= g[k - 2] * b[k - 2];
        }
    }
    for k in 0..m {
        b[k] /= d[k];
    }
    for k in (0..m).rev() {
        if k + 1 < m {
            b[k] -= f[k] * b[k + 1];
        }
        if k + 2 < m {
            b[k] -= g[k] * b[k + 2];
        }
    }
    Ok(b)
}
