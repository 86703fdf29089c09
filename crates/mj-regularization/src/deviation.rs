//! Relative deviations of varied profiles with respect to the nominal one.

use mj_core::{ByDirection, Error, Result};
use mj_hist::Profile1D;

/// Relative deviation `varied / nominal − 1` in every regular bin.
///
/// Errors are rescaled as `varied.error / nominal`. Under- and overflow bins of
/// the result are zero. A zero nominal content yields `inf`/`nan` in that bin;
/// such bins are counted in a warning and otherwise passed through.
pub fn build_deviation(nominal: &Profile1D, varied: &Profile1D) -> Result<Profile1D> {
    if !nominal.same_binning(varied) {
        return Err(Error::Validation(format!(
            "cannot build deviation: nominal has {} bins, varied has {} bins or different edges",
            nominal.num_bins(),
            varied.num_bins()
        )));
    }

    let mut deviation = Profile1D::new(nominal.binning.clone())?;
    let mut non_finite = 0usize;
    for i in 1..=nominal.num_bins() {
        let (n, _) = nominal.bin(i);
        let (v, e) = varied.bin(i);
        let c = v / n - 1.0;
        let err = e / n;
        if !c.is_finite() || !err.is_finite() {
            non_finite += 1;
        }
        deviation.contents[i] = c;
        deviation.errors[i] = err;
    }
    if non_finite > 0 {
        log::warn!("{non_finite} bins with non-finite relative deviation (zero nominal content)");
    }
    Ok(deviation)
}

/// Deviations of the up and down variations.
pub fn build_deviations(
    nominal: &Profile1D,
    varied: &ByDirection<Profile1D>,
) -> Result<ByDirection<Profile1D>> {
    ByDirection::try_from_fn(|direction| build_deviation(nominal, &varied[direction]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn profile(contents: Vec<f64>, errors: Vec<f64>) -> Profile1D {
        let n = contents.len();
        let binning = (0..=n).map(|i| 10.0 * (i + 1) as f64).collect();
        Profile1D::from_parts(binning, Some(contents), Some(errors)).unwrap()
    }

    #[test]
    fn deviation_round_trip() {
        let nominal = profile(vec![0.98, 1.01, 0.95, 1.2], vec![0.01; 4]);
        let d = [0.02, -0.013, 0.0, 0.5];
        let varied = profile(
            nominal.interior_contents().iter().zip(d).map(|(n, d)| n * (1.0 + d)).collect(),
            vec![0.02; 4],
        );
        let dev = build_deviation(&nominal, &varied).unwrap();
        for (got, want) in dev.interior_contents().iter().zip(d) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        assert_relative_eq!(dev.interior_errors()[2], 0.02 / 0.95, epsilon = 1e-15);
    }

    #[test]
    fn flows_are_zeroed() {
        let mut nominal = profile(vec![1.0, 1.0], vec![0.1, 0.1]);
        nominal.contents[0] = 3.0;
        nominal.contents[3] = 4.0;
        let mut varied = nominal.clone();
        varied.errors[0] = 7.0;
        let dev = build_deviation(&nominal, &varied).unwrap();
        assert_eq!(dev.bin(0), (0.0, 0.0));
        assert_eq!(dev.bin(3), (0.0, 0.0));
    }

    #[test]
    fn zero_nominal_propagates() {
        let nominal = profile(vec![0.0, 1.0], vec![0.1, 0.1]);
        let varied = profile(vec![1.0, 1.0], vec![0.1, 0.1]);
        let dev = build_deviation(&nominal, &varied).unwrap();
        assert!(dev.contents[1].is_infinite());
        assert_eq!(dev.contents[2], 0.0);
    }

    #[test]
    fn binning_mismatch_is_rejected() {
        let a = profile(vec![1.0, 1.0], vec![0.1, 0.1]);
        let b = profile(vec![1.0, 1.0, 1.0], vec![0.1; 3]);
        assert!(matches!(build_deviation(&a, &b), Err(Error::Validation(_))));
    }

    #[test]
    fn both_directions() {
        let nominal = profile(vec![2.0, 4.0], vec![0.1, 0.1]);
        let varied = ByDirection::new(
            profile(vec![2.2, 4.4], vec![0.1, 0.1]),
            profile(vec![1.8, 3.6], vec![0.1, 0.1]),
        );
        let dev = build_deviations(&nominal, &varied).unwrap();
        assert_relative_eq!(dev.up.contents[2], 0.1, epsilon = 1e-12);
        assert_relative_eq!(dev.down.contents[1], -0.1, epsilon = 1e-12);
    }
}
