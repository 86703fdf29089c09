//! Relative systematic variations in trigger bins and their smoothing.
//!
//! [`build_syst_vars`] computes, in every trigger bin and in the analysis
//! binning restricted to that bin, the combined relative statistical
//! uncertainty `RelUnc_<var>` and the relative variations
//! `RelVar_<var>_<syst>Up/Down` of the data-to-simulation difference.
//! [`smooth_syst_vars`] stitches the trigger bins together, smooths every
//! variation with LOWESS and splits the result back.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use mj_core::{ByDirection, Direction, Error, EventSource, Result, SourceProvider, Variable};
use mj_hist::{
    FillSpec, Profile1D, ProfileAccumulator, ProfileSource, ProfileSourceProvider, WeightExpr,
    fill_profiles,
};

use crate::lowess::Smoother;
use crate::stitch::{TriggerProfiles, TriggerStitcher};
use crate::syst_config::{SystConfig, VariationGroup};
use crate::trigger_bins::TriggerBinSet;

/// Name of the combined relative uncertainty of a variable.
pub fn rel_unc_name(variable: Variable) -> String {
    format!("RelUnc_{}", variable.name())
}

/// Name of a relative variation.
pub fn rel_var_name(variable: Variable, syst: &str, direction: Direction) -> String {
    format!("RelVar_{}_{}{}", variable.name(), syst, direction.suffix())
}

/// Mean balance per variable and trigger bin.
pub type Balance = BTreeMap<Variable, BTreeMap<String, Profile1D>>;

/// Builds profiles of the balance observables in every trigger bin, in the
/// analysis binning clipped to the `pt_range` of the bin.
#[derive(Debug, Clone)]
pub struct BalanceBuilder {
    bins: Vec<(String, Vec<f64>)>,
}

impl BalanceBuilder {
    /// Check `binning` against the trigger bins (clipped at its last edge)
    /// and compute the per-trigger binnings.
    pub fn new(trigger_bins: &TriggerBinSet, binning: &[f64]) -> Result<Self> {
        let mut trigger_bins = trigger_bins.clone();
        if let Some(last) = binning.last() {
            trigger_bins.clip(*last);
        }
        trigger_bins.validate_analysis_binning(binning)?;

        let bins = trigger_bins
            .iter()
            .map(|bin| {
                let (lo, hi) = bin.pt_range;
                let clipped: Vec<f64> = binning.iter().copied().filter(|e| lo <= *e && *e <= hi).collect();
                if clipped.len() < 2 {
                    return Err(Error::Config(format!(
                        "trigger bin \"{}\" contains no bins of the analysis binning",
                        bin.name
                    )));
                }
                Ok((bin.name.clone(), clipped))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bins })
    }

    /// Names of the trigger bins in ascending pt.
    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.bins.iter().map(|(name, _)| name.as_str())
    }

    /// Binning of a trigger bin.
    pub fn clipped_binning(&self, trigger: &str) -> Result<&[f64]> {
        self.bins
            .iter()
            .find(|(name, _)| name == trigger)
            .map(|(_, edges)| edges.as_slice())
            .ok_or_else(|| Error::NotFound(format!("trigger bin \"{trigger}\"")))
    }

    /// Stored data profiles, rebinned to the clipped binnings.
    pub fn build_data(&self, source: &dyn ProfileSource, variables: &[Variable]) -> Result<Balance> {
        let mut balance = Balance::new();
        for &variable in variables {
            let per_trigger = balance.entry(variable).or_default();
            for (trigger, edges) in &self.bins {
                let acc = source.profile(trigger, &variable.profile_name())?;
                per_trigger.insert(trigger.clone(), acc.rebin(edges)?.finalize());
            }
        }
        Ok(balance)
    }

    /// Profiles filled from simulated events. Events outside the clipped
    /// binning of a trigger bin end up in its under- and overflow.
    pub fn build_sim(
        &self,
        source: &dyn EventSource,
        weight: &WeightExpr,
        variables: &[Variable],
    ) -> Result<Balance> {
        let y_columns: Vec<String> = variables.iter().map(|v| v.column().to_string()).collect();
        let filled = self
            .bins
            .par_iter()
            .map(|(trigger, edges)| {
                let columns = source.events(trigger)?;
                let spec = FillSpec::new(Variable::PtLead.column(), y_columns.clone()).weight(weight.clone());
                let mut accs = variables
                    .iter()
                    .map(|_| ProfileAccumulator::new(edges.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let summary = fill_profiles(&columns, &spec, &mut accs)?;
                if summary.non_finite > 0 || summary.non_finite_observables > 0 {
                    log::warn!(
                        "trigger bin {trigger}: {} events with non-finite pt or weight and {} non-finite observable values skipped",
                        summary.non_finite,
                        summary.non_finite_observables
                    );
                }
                Ok((trigger.clone(), accs))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut balance = Balance::new();
        for (trigger, accs) in filled {
            for (variable, acc) in variables.iter().zip(accs) {
                balance.entry(*variable).or_default().insert(trigger.clone(), acc.finalize());
            }
        }
        Ok(balance)
    }
}

fn get<'a>(balance: &'a Balance, variable: Variable, trigger: &str) -> Result<&'a Profile1D> {
    balance
        .get(&variable)
        .and_then(|t| t.get(trigger))
        .ok_or_else(|| Error::NotFound(format!("{variable} profile in trigger bin \"{trigger}\"")))
}

/// Combined relative uncertainties and relative variations for all variations
/// of `group`.
///
/// The variation is the shift of the data-to-simulation difference
/// `(sim_syst − sim_nom) − (data_syst − data_nom)`, divided by the nominal
/// simulation. A variation without simulation (data) files contributes no
/// simulation (data) shift.
pub fn build_syst_vars(
    config: &SystConfig,
    group: VariationGroup,
    builder: &BalanceBuilder,
    events: &dyn SourceProvider,
    profiles: &dyn ProfileSourceProvider,
    variables: &[Variable],
) -> Result<TriggerProfiles> {
    let period_weight = config.require_period_weight()?;
    if !config.nominal.has_data() || !config.nominal.has_sim() {
        return Err(Error::Config("nominal configuration requires both data and simulation".into()));
    }

    let data_nominal = builder.build_data(profiles.open(&config.nominal.data_paths)?.as_ref(), variables)?;
    let sim_nominal = builder.build_sim(
        events.open(&config.nominal.sim_paths)?.as_ref(),
        &WeightExpr::simulation(period_weight, None),
        variables,
    )?;

    let mut out = TriggerProfiles::new();
    for trigger in builder.triggers() {
        let named = out.entry(trigger.to_string()).or_default();
        for &variable in variables {
            let data = get(&data_nominal, variable, trigger)?;
            let sim = get(&sim_nominal, variable, trigger)?;
            let rel_unc: Vec<f64> = (0..sim.num_bins())
                .map(|i| data.interior_errors()[i].hypot(sim.interior_errors()[i]) / sim.interior_contents()[i])
                .collect();
            let n = rel_unc.len();
            named.insert(
                rel_unc_name(variable),
                Profile1D::from_parts(sim.binning.clone(), Some(rel_unc), Some(vec![0.0; n]))?,
            );
        }
    }

    for label in config.iter_group(group) {
        let variation = config.variation(label)?;
        let ByDirection { up, down } = &variation.samples;
        if up.has_data() != down.has_data() || up.has_sim() != down.has_sim() {
            return Err(Error::Config(format!(
                "variation \"{label}\" provides different kinds of inputs for up and down"
            )));
        }
        if !up.has_data() && !up.has_sim() {
            return Err(Error::Config(format!("variation \"{label}\" has no input files")));
        }

        for direction in Direction::ALL {
            let samples = &variation.samples[direction];
            let sim_syst = if samples.has_sim() {
                let weight = WeightExpr::simulation(period_weight, samples.add_weight.as_ref());
                Some(builder.build_sim(events.open(&samples.sim_paths)?.as_ref(), &weight, variables)?)
            } else {
                None
            };
            let data_syst = if samples.has_data() {
                Some(builder.build_data(profiles.open(&samples.data_paths)?.as_ref(), variables)?)
            } else {
                None
            };

            for trigger in builder.triggers() {
                for &variable in variables {
                    let sim_nom = get(&sim_nominal, variable, trigger)?;
                    let mut shift = vec![0.0; sim_nom.num_bins()];
                    if let Some(sim_syst) = &sim_syst {
                        let varied = get(sim_syst, variable, trigger)?;
                        for (i, s) in shift.iter_mut().enumerate() {
                            *s += varied.interior_contents()[i] - sim_nom.interior_contents()[i];
                        }
                    }
                    if let Some(data_syst) = &data_syst {
                        let varied = get(data_syst, variable, trigger)?;
                        let data_nom = get(&data_nominal, variable, trigger)?;
                        for (i, s) in shift.iter_mut().enumerate() {
                            *s -= varied.interior_contents()[i] - data_nom.interior_contents()[i];
                        }
                    }
                    let deviation: Vec<f64> =
                        shift.iter().zip(sim_nom.interior_contents()).map(|(s, n)| s / n).collect();
                    let n = deviation.len();
                    let profile =
                        Profile1D::from_parts(sim_nom.binning.clone(), Some(deviation), Some(vec![0.0; n]))?;
                    out.entry(trigger.to_string())
                        .or_default()
                        .insert(rel_var_name(variable, label, direction), profile);
                }
            }
        }
        log::info!("built relative variations for {label}");
    }
    Ok(out)
}

/// Labels of systematic variations present for `variable` in `profiles`.
fn syst_labels(profiles: &TriggerProfiles, variable: Variable) -> BTreeSet<String> {
    let prefix = format!("RelVar_{}_", variable.name());
    profiles
        .values()
        .flat_map(|named| named.keys())
        .filter_map(|name| name.strip_prefix(&prefix)?.strip_suffix(Direction::Up.suffix()))
        .map(String::from)
        .collect()
}

/// Smooth every relative variation in `input` with LOWESS over the combined
/// binning of all trigger bins.
///
/// Bin weights are `1 / RelUnc²` and the bandwidth is `bandwidth_fraction`
/// times the number of combined bins.
pub fn smooth_syst_vars(
    input: &TriggerProfiles,
    variables: &[Variable],
    bandwidth_fraction: f64,
    symmetric: bool,
) -> Result<TriggerProfiles> {
    let reference = variables
        .first()
        .map(|v| rel_unc_name(*v))
        .ok_or_else(|| Error::Validation("no variables to smooth".into()))?;
    let stitcher = TriggerStitcher::from_profiles(input, &reference)?;
    let bandwidth = bandwidth_fraction * stitcher.num_bins() as f64;

    let mut out = TriggerProfiles::new();
    for &variable in variables {
        let labels = syst_labels(input, variable);
        if labels.is_empty() {
            log::warn!("no variations found for {variable}");
            continue;
        }
        let unc = stitcher.stitch(input, &rel_unc_name(variable))?;
        let weights: Vec<f64> = unc.interior_contents().iter().map(|u| 1.0 / (u * u)).collect();

        for label in &labels {
            let pair = ByDirection::try_from_fn(|direction| {
                stitcher.stitch(input, &rel_var_name(variable, label, direction))
            })?;
            let smoother = Smoother::from_relative(
                pair.up.interior_contents().to_vec(),
                pair.down.interior_contents().to_vec(),
                weights.clone(),
            )?;
            let smoothed = smoother.smooth(bandwidth, symmetric)?;
            log::info!(
                "{label} ({variable}): scale factors {:.4} / {:.4}",
                smoothed.scale_up,
                smoothed.scale_down
            );

            for (direction, values) in [(Direction::Up, &smoothed.up), (Direction::Down, &smoothed.down)] {
                for (trigger, profile) in stitcher.split(values)? {
                    out.entry(trigger).or_default().insert(rel_var_name(variable, label, direction), profile);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_bins::TriggerBin;
    use approx::assert_relative_eq;
    use mj_core::Columns;
    use mj_hist::{JsonEventSource, JsonProfileStore};
    use std::path::PathBuf;

    fn bins() -> TriggerBinSet {
        TriggerBinSet::from_bins([
            TriggerBin::new("T1", "HLT_1", (100.0, 200.0), (90.0, 220.0)).unwrap(),
            TriggerBin::new("T2", "HLT_2", (200.0, 1e4), (180.0, f64::INFINITY)).unwrap(),
        ])
    }

    const BINNING: [f64; 5] = [100.0, 150.0, 200.0, 300.0, 400.0];

    #[test]
    fn builder_clips_binning_per_trigger() {
        let b = BalanceBuilder::new(&bins(), &BINNING).unwrap();
        assert_eq!(b.triggers().collect::<Vec<_>>(), ["T1", "T2"]);
        assert_eq!(b.clipped_binning("T1").unwrap(), &[100.0, 150.0, 200.0]);
        assert_eq!(b.clipped_binning("T2").unwrap(), &[200.0, 300.0, 400.0]);
        assert!(b.clipped_binning("T3").is_err());
        assert!(BalanceBuilder::new(&bins(), &[100.0, 250.0, 400.0]).is_err());
        assert!(BalanceBuilder::new(&bins(), &[90.0, 100.0, 200.0, 400.0]).is_err());
    }

    #[test]
    fn names() {
        assert_eq!(rel_unc_name(Variable::Mpf), "RelUnc_MPF");
        assert_eq!(rel_var_name(Variable::PtBal, "JER", Direction::Down), "RelVar_PtBal_JERDown");
    }

    fn events(shift: f64) -> JsonEventSource {
        let mut triggers = BTreeMap::new();
        for (name, pts) in [("T1", [120.0, 130.0, 170.0, 180.0]), ("T2", [250.0, 260.0, 350.0, 360.0])] {
            let mut cols = Columns::new();
            cols.insert("PtJ1", pts.to_vec()).unwrap();
            cols.insert("MPF", vec![1.0 + shift, 1.1 + shift, 1.0 + shift, 1.1 + shift]).unwrap();
            cols.insert("WeightGen", vec![1.0; 4]).unwrap();
            cols.insert("Weight_B", vec![1.0; 4]).unwrap();
            triggers.insert(name.to_string(), cols);
        }
        JsonEventSource::from_map("mem", triggers)
    }

    struct Events;

    impl SourceProvider for Events {
        fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn EventSource>> {
            let shift = if paths[0].ends_with("sim_up.json") { 0.021 } else { 0.0 };
            Ok(Box::new(events(shift)))
        }
    }

    fn store(shift: f64) -> JsonProfileStore {
        let fine = vec![100.0, 150.0, 200.0, 300.0, 400.0];
        let mut store = JsonProfileStore::new();
        for (name, pts) in [("T1", [120.0, 170.0]), ("T2", [250.0, 350.0])] {
            let mut acc = ProfileAccumulator::new(fine.clone()).unwrap();
            for pt in pts {
                acc.fill(pt, 0.98 + shift, 1.0);
                acc.fill(pt, 1.02 + shift, 1.0);
            }
            store.insert(name, "MPFProfile", acc);
        }
        store
    }

    struct Profiles;

    impl ProfileSourceProvider for Profiles {
        fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn ProfileSource>> {
            let shift = if paths[0].ends_with("data_up.json") { 0.01 } else { 0.0 };
            Ok(Box::new(store(shift)))
        }
    }

    #[test]
    fn relative_variations() {
        let json = r#"{
            "period_weight": "B",
            "nominal": {"data": ["data.json"], "sim": ["sim.json"]},
            "variations": {
                "Both": {
                    "up": {"data": ["data_up.json"], "sim": ["sim_up.json"]},
                    "down": {"data": ["data.json"], "sim": ["sim.json"]}
                }
            }
        }"#;
        let config = SystConfig::from_json_str(json, None).unwrap();
        let builder = BalanceBuilder::new(&bins(), &BINNING).unwrap();
        let out =
            build_syst_vars(&config, VariationGroup::All, &builder, &Events, &Profiles, &[Variable::Mpf])
                .unwrap();

        let t1 = &out["T1"];
        // Mean simulated MPF is 1.05 in every bin
        let up = t1["RelVar_MPF_BothUp"].interior_contents();
        for v in up {
            assert_relative_eq!(*v, (0.021 - 0.01) / 1.05, epsilon = 1e-12);
        }
        for v in t1["RelVar_MPF_BothDown"].interior_contents() {
            assert_relative_eq!(*v, 0.0, epsilon = 1e-12);
        }
        let unc = out["T2"]["RelUnc_MPF"].interior_contents();
        assert_eq!(unc.len(), 2);
        assert!(unc.iter().all(|u| *u > 0.0 && u.is_finite()));
    }

    fn smoothing_input() -> TriggerProfiles {
        let mut input = TriggerProfiles::new();
        let edges = [vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0], vec![15.0, 16.0, 17.0, 18.0, 19.0, 20.0]];
        let up = [0.02, 0.021, 0.019, 0.02, 0.02, 0.022, 0.02, 0.018, 0.02, 0.021];
        for (t, binning) in edges.iter().enumerate() {
            let named = input.entry(format!("T{t}")).or_default();
            let part = |values: &[f64]| {
                Profile1D::from_parts(binning.clone(), Some(values[5 * t..5 * t + 5].to_vec()), Some(vec![0.0; 5]))
                    .unwrap()
            };
            named.insert("RelUnc_PtBal".into(), part(&[0.01; 10]));
            named.insert("RelVar_PtBal_JERUp".into(), part(&up));
            named.insert("RelVar_PtBal_JERDown".into(), part(&up.map(|u| -0.5 * u)));
        }
        input
    }

    #[test]
    fn smoothing_over_stitched_triggers() {
        let input = smoothing_input();
        let out = smooth_syst_vars(&input, &[Variable::PtBal, Variable::Mpf], 0.1, false).unwrap();
        assert_eq!(out.len(), 2);
        let up = &out["T0"]["RelVar_PtBal_JERUp"];
        assert_eq!(up.binning, input["T0"]["RelVar_PtBal_JERUp"].binning);
        // Down is half of up with opposite sign
        let down = &out["T1"]["RelVar_PtBal_JERDown"];
        let up1 = &out["T1"]["RelVar_PtBal_JERUp"];
        for (u, d) in up1.interior_contents().iter().zip(down.interior_contents()) {
            assert_relative_eq!(*d, -0.5 * u, epsilon = 1e-12);
        }
        assert!(!out["T0"].contains_key("RelVar_MPF_JERUp"));

        let symmetric = smooth_syst_vars(&input, &[Variable::PtBal], 0.1, true).unwrap();
        let (u, d) = (&symmetric["T0"]["RelVar_PtBal_JERUp"], &symmetric["T0"]["RelVar_PtBal_JERDown"]);
        for (a, b) in u.interior_contents().iter().zip(d.interior_contents()) {
            assert_eq!(*a, -*b);
        }
    }
}
