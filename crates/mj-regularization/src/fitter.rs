//! Spline models of balance observables and of their systematic variations.
//!
//! All trigger bins are merged before fitting, and one spline is shared by
//! every trigger bin. [`SimFit::spline_for`] and [`VariationFit::spline_for`]
//! return that shared instance for any trigger bin of the fit.

use std::collections::BTreeMap;

use mj_core::{ByDirection, Direction, Error, EventSource, Result, SourceProvider, Variable};
use mj_hist::{Profile1D, ProfileAccumulator, ProfileSource, ProfileSourceProvider, WeightExpr, validate_edges};

use crate::deviation::build_deviations;
use crate::profile_builder::WeightedProfileBuilder;
use crate::spline::{Spline, SplineRegressor};
use crate::syst_config::SystConfig;
use crate::trigger_bins::TriggerBinSet;

/// Default upper cut on the leading-jet pt used in fits.
pub const DEFAULT_MAX_PT: f64 = 1700.0;
/// Default number of pt bins for the simulation fit.
pub const DEFAULT_SIM_BINS: usize = 100;
/// Default number of pt bins for fits of variations in simulation.
pub const DEFAULT_VARIATION_BINS: usize = 50;

/// `[PtLead]` followed by `variables`, without duplicates.
fn with_pt(variables: &[Variable]) -> Vec<Variable> {
    let mut all = vec![Variable::PtLead];
    for v in variables {
        if !all.contains(v) {
            all.push(*v);
        }
    }
    all
}

fn take_profile(profiles: &mut BTreeMap<Variable, Profile1D>, variable: Variable) -> Result<Profile1D> {
    profiles
        .remove(&variable)
        .ok_or_else(|| Error::NotFound(format!("profile of {variable}")))
}

/// Splines of balance observables in simulation.
#[derive(Debug)]
pub struct SimFit {
    triggers: Vec<String>,
    splines: BTreeMap<Variable, Spline>,
    failures: Vec<(Variable, Error)>,
}

impl SimFit {
    /// Spline for the given variable, valid for `trigger`.
    pub fn spline_for(&self, variable: Variable, trigger: &str) -> Result<&Spline> {
        if !self.triggers.iter().any(|t| t == trigger) {
            return Err(Error::NotFound(format!("trigger bin '{trigger}' is not part of the fit")));
        }
        self.splines
            .get(&variable)
            .ok_or_else(|| Error::NotFound(format!("no spline fitted for {variable}")))
    }

    /// Successfully fitted splines.
    pub fn splines(&self) -> &BTreeMap<Variable, Spline> {
        &self.splines
    }

    /// Trigger bins covered by the fit.
    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Variables whose fit failed, with the reason.
    pub fn failures(&self) -> &[(Variable, Error)] {
        &self.failures
    }
}

/// Fits the mean of balance observables versus log(pt) in simulation.
pub struct SplineSimFitter {
    source: Box<dyn EventSource>,
    era: String,
    trigger_bins: TriggerBinSet,
    regressor: SplineRegressor,
    fit_results: BTreeMap<Variable, Spline>,
}

impl SplineSimFitter {
    /// Fitter reading simulated events from `source` with period weights of
    /// `era`.
    pub fn new(source: Box<dyn EventSource>, era: impl Into<String>, trigger_bins: TriggerBinSet) -> Self {
        Self {
            source,
            era: era.into(),
            trigger_bins,
            regressor: SplineRegressor::new(),
            fit_results: BTreeMap::new(),
        }
    }

    /// Use a configured regressor.
    pub fn with_regressor(mut self, regressor: SplineRegressor) -> Self {
        self.regressor = regressor;
        self
    }

    /// Fit the given variables, using events with leading-jet pt below
    /// `max_pt` in `num_bins` logarithmic bins.
    ///
    /// A failed fit of one variable is logged and reported in
    /// [`SimFit::failures`]; the other variables are still fitted.
    pub fn fit(&mut self, variables: &[Variable], max_pt: f64, num_bins: usize) -> Result<SimFit> {
        let mut builder = WeightedProfileBuilder::new(&self.trigger_bins, f64::INFINITY)?;
        builder.construct_binning(max_pt, num_bins)?;
        let weight = WeightExpr::simulation(&self.era, None);
        let mut profiles = builder.fill(self.source.as_ref(), &weight, &with_pt(variables))?;
        let pt = take_profile(&mut profiles, Variable::PtLead)?;

        let mut splines = BTreeMap::new();
        let mut failures = Vec::new();
        for variable in with_pt(variables).into_iter().skip(1) {
            let profile = take_profile(&mut profiles, variable)?;
            match self.regressor.fit_profile(&pt, &profile) {
                Ok(spline) => {
                    splines.insert(variable, spline);
                }
                Err(e) => {
                    log::warn!("spline fit of {variable} in simulation failed: {e}");
                    failures.push((variable, e));
                }
            }
        }

        self.fit_results.extend(splines.iter().map(|(v, s)| (*v, s.clone())));
        let triggers = builder.trigger_bins().names().into_iter().map(String::from).collect();
        Ok(SimFit { triggers, splines, failures })
    }

    /// All splines fitted so far, the latest fit of each variable.
    pub fn fit_results(&self) -> &BTreeMap<Variable, Spline> {
        &self.fit_results
    }
}

/// Smoothed relative deviations of one systematic variation.
#[derive(Debug)]
pub struct VariationFit {
    /// Label of the variation.
    pub label: String,
    triggers: Vec<String>,
    /// Raw relative deviations.
    pub deviations: BTreeMap<Variable, ByDirection<Profile1D>>,
    splines: BTreeMap<Variable, ByDirection<Spline>>,
    failures: Vec<(Variable, Error)>,
}

impl VariationFit {
    /// Spline of the deviation for `variable` and `direction`, valid for
    /// `trigger`.
    pub fn spline_for(&self, variable: Variable, trigger: &str, direction: Direction) -> Result<&Spline> {
        if !self.triggers.iter().any(|t| t == trigger) {
            return Err(Error::NotFound(format!("trigger bin '{trigger}' is not part of the fit")));
        }
        self.splines
            .get(&variable)
            .map(|pair| &pair[direction])
            .ok_or_else(|| Error::NotFound(format!("no spline fitted for {variable} in {}", self.label)))
    }

    /// Successfully fitted splines.
    pub fn splines(&self) -> &BTreeMap<Variable, ByDirection<Spline>> {
        &self.splines
    }

    /// Trigger bins covered by the fit.
    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Variables whose fit failed, with the reason.
    pub fn failures(&self) -> &[(Variable, Error)] {
        &self.failures
    }
}

/// Nominal profiles and the machinery shared by the variation fitters.
struct NominalModel {
    variables: Vec<Variable>,
    mean_pt: Vec<f64>,
    profiles: BTreeMap<Variable, Profile1D>,
    regressor: SplineRegressor,
}

type FittedDeviations = (
    BTreeMap<Variable, ByDirection<Profile1D>>,
    BTreeMap<Variable, ByDirection<Spline>>,
    Vec<(Variable, Error)>,
);

impl NominalModel {
    fn new(variables: &[Variable], mut profiles: BTreeMap<Variable, Profile1D>) -> Result<Self> {
        let mean_pt = take_profile(&mut profiles, Variable::PtLead)?.interior_contents().to_vec();
        let variables: Vec<Variable> = with_pt(variables).into_iter().skip(1).collect();
        Ok(Self { variables, mean_pt, profiles, regressor: SplineRegressor::new() })
    }

    /// Relative deviations of `varied` from the nominal profiles and their
    /// spline fits versus log(mean pt).
    fn fit_deviations(
        &self,
        label: &str,
        mut varied: BTreeMap<Variable, ByDirection<Profile1D>>,
    ) -> Result<FittedDeviations> {
        let mut deviations = BTreeMap::new();
        let mut splines = BTreeMap::new();
        let mut failures = Vec::new();
        for &variable in &self.variables {
            let nominal = self
                .profiles
                .get(&variable)
                .ok_or_else(|| Error::NotFound(format!("nominal profile of {variable}")))?;
            let pair = varied
                .remove(&variable)
                .ok_or_else(|| Error::NotFound(format!("varied profiles of {variable}")))?;
            let deviation = build_deviations(nominal, &pair)?;
            let fitted = ByDirection::try_from_fn(|direction| {
                self.regressor.fit_profile_at(&self.mean_pt, &deviation[direction])
            });
            match fitted {
                Ok(pair) => {
                    splines.insert(variable, pair);
                }
                Err(e) => {
                    log::warn!("spline fit of {variable} deviation in {label} failed: {e}");
                    failures.push((variable, e));
                }
            }
            deviations.insert(variable, deviation);
        }
        Ok((deviations, splines, failures))
    }
}

/// Fits systematic variations in simulation.
pub struct SimVariationFitter<'a> {
    config: &'a SystConfig,
    provider: &'a dyn SourceProvider,
    builder: WeightedProfileBuilder,
    period_weight: String,
    model: NominalModel,
}

impl<'a> SimVariationFitter<'a> {
    /// Fill nominal profiles of `variables` from the nominal simulation of
    /// `config`, in `num_bins` logarithmic bins up to `max_pt`.
    pub fn new(
        config: &'a SystConfig,
        provider: &'a dyn SourceProvider,
        trigger_bins: &TriggerBinSet,
        variables: &[Variable],
        max_pt: f64,
        num_bins: usize,
    ) -> Result<Self> {
        let period_weight = config.require_period_weight()?.to_string();
        let mut builder = WeightedProfileBuilder::new(trigger_bins, max_pt)?;
        builder.construct_binning(max_pt, num_bins)?;

        if !config.nominal.has_sim() {
            return Err(Error::Config("nominal configuration has no simulation files".into()));
        }
        let source = provider.open(&config.nominal.sim_paths)?;
        let weight = WeightExpr::simulation(&period_weight, None);
        let profiles = builder.fill(source.as_ref(), &weight, &with_pt(variables))?;
        let model = NominalModel::new(variables, profiles)?;
        log::info!("nominal simulation profiles filled for {} variables", model.variables.len());

        Ok(Self { config, provider, builder, period_weight, model })
    }

    /// Use a configured regressor.
    pub fn with_regressor(mut self, regressor: SplineRegressor) -> Self {
        self.model.regressor = regressor;
        self
    }

    /// Mean leading-jet pt of the nominal profiles.
    pub fn mean_pt(&self) -> &[f64] {
        &self.model.mean_pt
    }

    /// Nominal profiles of the balance observables.
    pub fn nominal(&self) -> &BTreeMap<Variable, Profile1D> {
        &self.model.profiles
    }

    /// Fit the relative deviations of the variation `label`.
    pub fn fit(&self, label: &str) -> Result<VariationFit> {
        let variation = self.config.variation(label)?;
        let variables = &self.model.variables;

        let mut filled = ByDirection::try_from_fn(|direction| {
            let samples = &variation.samples[direction];
            if !samples.has_sim() {
                return Err(Error::Config(format!(
                    "variation \"{label}\" ({direction}) has no simulation files"
                )));
            }
            let source = self.provider.open(&samples.sim_paths)?;
            let weight = WeightExpr::simulation(&self.period_weight, samples.add_weight.as_ref());
            self.builder.fill(source.as_ref(), &weight, variables)
        })?;

        let mut varied = BTreeMap::new();
        for &variable in variables {
            let pair = ByDirection::new(
                take_profile(&mut filled.up, variable)?,
                take_profile(&mut filled.down, variable)?,
            );
            varied.insert(variable, pair);
        }

        let (deviations, splines, failures) = self.model.fit_deviations(label, varied)?;
        let triggers = self.builder.trigger_bins().names().into_iter().map(String::from).collect();
        Ok(VariationFit { label: label.to_string(), triggers, deviations, splines, failures })
    }
}

/// Smoothed relative deviations of one variation in data, in the analysis
/// binning.
#[derive(Debug)]
pub struct DataVariationFit {
    /// Label of the variation.
    pub label: String,
    /// Raw relative deviations.
    pub deviations: BTreeMap<Variable, ByDirection<Profile1D>>,
    /// Splines evaluated at the mean pt of each bin, with zero errors.
    pub smoothed: BTreeMap<Variable, ByDirection<Profile1D>>,
    /// Variables whose fit failed, with the reason.
    pub failures: Vec<(Variable, Error)>,
}

/// Fits systematic variations in data.
///
/// Stored profiles of all trigger bins and input files are summed and rebinned
/// to the analysis binning.
pub struct DataVariationFitter<'a> {
    config: &'a SystConfig,
    provider: &'a dyn ProfileSourceProvider,
    trigger_bins: TriggerBinSet,
    binning: Vec<f64>,
    model: NominalModel,
}

impl<'a> DataVariationFitter<'a> {
    /// Read nominal data profiles of `variables` and rebin them to `binning`.
    pub fn new(
        config: &'a SystConfig,
        provider: &'a dyn ProfileSourceProvider,
        trigger_bins: TriggerBinSet,
        variables: &[Variable],
        binning: Vec<f64>,
    ) -> Result<Self> {
        validate_edges(&binning)?;
        if trigger_bins.is_empty() {
            return Err(Error::Config("no trigger bins given".into()));
        }
        if !config.nominal.has_data() {
            return Err(Error::Config("nominal configuration has no data files".into()));
        }
        let profiles = read_profiles(
            provider,
            &config.nominal.data_paths,
            &trigger_bins,
            &binning,
            &with_pt(variables),
        )?;
        let model = NominalModel::new(variables, profiles)?;
        Ok(Self { config, provider, trigger_bins, binning, model })
    }

    /// Use a configured regressor.
    pub fn with_regressor(mut self, regressor: SplineRegressor) -> Self {
        self.model.regressor = regressor;
        self
    }

    /// Mean leading-jet pt in the analysis bins.
    pub fn mean_pt(&self) -> &[f64] {
        &self.model.mean_pt
    }

    /// Analysis binning.
    pub fn binning(&self) -> &[f64] {
        &self.binning
    }

    /// Fit the relative deviations of the variation `label` and evaluate the
    /// splines at the mean pt of every analysis bin.
    pub fn fit(&self, label: &str) -> Result<DataVariationFit> {
        let variation = self.config.variation(label)?;
        let variables = &self.model.variables;

        let mut read = ByDirection::try_from_fn(|direction| {
            let samples = &variation.samples[direction];
            if !samples.has_data() {
                return Err(Error::Config(format!("variation \"{label}\" ({direction}) has no data files")));
            }
            read_profiles(self.provider, &samples.data_paths, &self.trigger_bins, &self.binning, variables)
        })?;

        let mut varied = BTreeMap::new();
        for &variable in variables {
            let pair = ByDirection::new(
                take_profile(&mut read.up, variable)?,
                take_profile(&mut read.down, variable)?,
            );
            varied.insert(variable, pair);
        }

        let (deviations, splines, failures) = self.model.fit_deviations(label, varied)?;

        let n = self.binning.len() - 1;
        let mut smoothed = BTreeMap::new();
        for (variable, pair) in &splines {
            let evaluated = ByDirection::try_from_fn(|direction| {
                Profile1D::from_parts(
                    self.binning.clone(),
                    Some(pair[direction].evaluate(&self.model.mean_pt)),
                    Some(vec![0.0; n]),
                )
            })?;
            smoothed.insert(*variable, evaluated);
        }
        Ok(DataVariationFit { label: label.to_string(), deviations, smoothed, failures })
    }
}

/// Sum the stored accumulators of all trigger bins and files, rebin and
/// finalize them.
fn read_profiles(
    provider: &dyn ProfileSourceProvider,
    paths: &[std::path::PathBuf],
    trigger_bins: &TriggerBinSet,
    binning: &[f64],
    variables: &[Variable],
) -> Result<BTreeMap<Variable, Profile1D>> {
    let source: Box<dyn ProfileSource> = provider.open(paths)?;
    let mut profiles = BTreeMap::new();
    for &variable in variables {
        let name = variable.profile_name();
        let parts = trigger_bins
            .iter()
            .map(|bin| source.profile(&bin.name, &name))
            .collect::<Result<Vec<ProfileAccumulator>>>()?;
        let merged = ProfileAccumulator::merge_all(&parts)?
            .ok_or_else(|| Error::Config("no trigger bins given".into()))?;
        profiles.insert(variable, merged.rebin(binning)?.finalize());
    }
    log::debug!("read {} profiles from {} files", profiles.len(), paths.len());
    Ok(profiles)
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
            TriggerBin::new("T1", "HLT_1", (100.0, 300.0), (90.0, 320.0)).unwrap(),
            TriggerBin::new("T2", "HLT_2", (300.0, 1000.0), (280.0, 1100.0)).unwrap(),
        ])
    }

    fn mpf_model(pt: f64) -> f64 {
        0.95 + 0.01 * pt.ln()
    }

    /// Deterministic events on a pt grid with MPF following `mpf_model` times
    /// `scale`, plus a small alternating offset.
    fn events(scale: f64, extra_weight: bool) -> JsonEventSource {
        let mut triggers = BTreeMap::new();
        for (name, lo, hi) in [("T1", 90.0_f64, 300.0_f64), ("T2", 300.0, 1100.0)] {
            let n = 2000;
            let mut pt = Vec::new();
            let mut mpf = Vec::new();
            let mut bal = Vec::new();
            for i in 0..n {
                let x = lo * (hi / lo).powf((i as f64 + 0.5) / n as f64);
                let jitter = if i % 2 == 0 { 0.01 } else { -0.01 };
                pt.push(x);
                mpf.push(scale * mpf_model(x) + jitter);
                bal.push(scale * (0.9 + 0.02 * x.ln()) - jitter);
            }
            let mut cols = Columns::new();
            cols.insert("PtJ1", pt).unwrap();
            cols.insert("MPF", mpf).unwrap();
            cols.insert("PtBal", bal).unwrap();
            cols.insert("WeightGen", vec![1.0; n]).unwrap();
            cols.insert("Weight_B", vec![1.0; n]).unwrap();
            if extra_weight {
                cols.insert("WeightExtra", vec![2.0; n]).unwrap();
            }
            triggers.insert(name.to_string(), cols);
        }
        JsonEventSource::from_map(format!("scale {scale}"), triggers)
    }

    /// Opens in-memory sources by file name.
    struct MemoryProvider;

    impl SourceProvider for MemoryProvider {
        fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn EventSource>> {
            let scale = match paths[0].to_str() {
                Some("nominal.json") => 1.0,
                Some("up.json") => 1.02,
                Some("down.json") => 0.99,
                _ => return Err(Error::NotFound(format!("{:?}", paths[0]))),
            };
            Ok(Box::new(events(scale, true)))
        }
    }

    const CONFIG: &str = r#"{
        "period_weight": "B",
        "nominal": {"sim": ["nominal.json"]},
        "variations": {
            "Scale": {
                "up": {"sim": ["up.json"], "add_weight": "WeightExtra"},
                "down": {"sim": ["down.json"]}
            },
            "DataOnly": {
                "up": {"data": ["d_up.json"]},
                "down": {"data": ["d_down.json"]}
            }
        }
    }"#;

    #[test]
    fn sim_fit_shares_spline_across_triggers() {
        let mut fitter = SplineSimFitter::new(Box::new(events(1.0, false)), "B", bins());
        let fit = fitter.fit(&[Variable::Mpf, Variable::PtBal], 1000.0, 20).unwrap();
        assert!(fit.failures().is_empty());
        let a = fit.spline_for(Variable::Mpf, "T1").unwrap();
        let b = fit.spline_for(Variable::Mpf, "T2").unwrap();
        assert!(std::ptr::eq(a, b));
        assert_relative_eq!(a.evaluate_pt(400.0), mpf_model(400.0), epsilon = 2e-3);
        assert!(fit.spline_for(Variable::Mpf, "T3").is_err());
        assert!(fit.spline_for(Variable::PtLead, "T1").is_err());
        assert_eq!(fitter.fit_results().len(), 2);
    }

    #[test]
    fn sim_fit_collects_failures() {
        // Two bins cannot support a cubic spline
        let mut fitter = SplineSimFitter::new(Box::new(events(1.0, false)), "B", bins());
        let fit = fitter.fit(&[Variable::Mpf], 1000.0, 2).unwrap();
        assert!(fit.splines().is_empty());
        assert!(matches!(fit.failures()[0], (Variable::Mpf, Error::InsufficientData { .. })));
    }

    #[test]
    fn sim_variation_recovers_scale() {
        let config = SystConfig::from_json_str(CONFIG, None).unwrap();
        let fitter =
            SimVariationFitter::new(&config, &MemoryProvider, &bins(), &[Variable::Mpf], 1000.0, 15)
                .unwrap();
        assert_eq!(fitter.mean_pt().len(), 15);
        let fit = fitter.fit("Scale").unwrap();
        assert!(fit.failures().is_empty());
        let up = fit.spline_for(Variable::Mpf, "T2", Direction::Up).unwrap();
        let down = fit.spline_for(Variable::Mpf, "T1", Direction::Down).unwrap();
        // Alternating offsets make the deviation only approximately constant
        assert_relative_eq!(up.evaluate_pt(500.0), 0.02, epsilon = 1e-3);
        assert_relative_eq!(down.evaluate_pt(500.0), -0.01, epsilon = 1e-3);
        assert!(matches!(fitter.fit("DataOnly"), Err(Error::Config(_))));
        assert!(matches!(fitter.fit("Missing"), Err(Error::NotFound(_))));
    }

    fn store(scale: f64) -> JsonProfileStore {
        let fine: Vec<f64> = (0..=16).map(|i| 100.0 * 1.15f64.powi(i)).collect();
        let mut store = JsonProfileStore::new();
        for (name, lo, hi) in [("T1", 100.0, 300.0), ("T2", 300.0, 1e9)] {
            let mut pt = ProfileAccumulator::new(fine.clone()).unwrap();
            let mut mpf = ProfileAccumulator::new(fine.clone()).unwrap();
            for w in fine.windows(2) {
                let x = (w[0] * w[1]).sqrt();
                if x < lo || x >= hi {
                    continue;
                }
                for k in 0..10 {
                    let jitter = 0.01 * (k as f64 - 4.5);
                    pt.fill(x, x, 1.0);
                    mpf.fill(x, scale * mpf_model(x) + jitter, 1.0);
                }
            }
            store.insert(name, "PtLeadProfile", pt);
            store.insert(name, "MPFProfile", mpf);
        }
        store
    }

    struct StoreProvider;

    impl ProfileSourceProvider for StoreProvider {
        fn open(&self, paths: &[PathBuf]) -> Result<Box<dyn ProfileSource>> {
            let scale = match paths[0].to_str() {
                Some("d_nom.json") => 1.0,
                Some("d_up.json") => 1.03,
                _ => 0.98,
            };
            Ok(Box::new(store(scale)))
        }
    }

    #[test]
    fn data_variation_evaluates_in_analysis_binning() {
        let json = r#"{
            "nominal": {"data": ["d_nom.json"]},
            "variations": {"Res": {"up": {"data": ["d_up.json"]}, "down": {"data": ["d_down.json"]}}}
        }"#;
        let config = SystConfig::from_json_str(json, None).unwrap();
        // Every other fine edge
        let binning: Vec<f64> = (0..=8).map(|i| 100.0 * 1.15f64.powi(2 * i)).collect();
        let fitter =
            DataVariationFitter::new(&config, &StoreProvider, bins(), &[Variable::Mpf], binning.clone())
                .unwrap();
        assert_eq!(fitter.mean_pt().len(), 8);

        let fit = fitter.fit("Res").unwrap();
        assert!(fit.failures.is_empty());
        let smoothed = &fit.smoothed[&Variable::Mpf];
        assert_eq!(smoothed.up.binning, binning);
        assert!(smoothed.up.errors.iter().all(|e| *e == 0.0));
        for c in smoothed.up.interior_contents() {
            assert_relative_eq!(*c, 0.03, epsilon = 1e-9);
        }
        for c in smoothed.down.interior_contents() {
            assert_relative_eq!(*c, -0.02, epsilon = 1e-9);
        }
    }

    #[test]
    fn data_fitter_rejects_misaligned_binning() {
        let json = r#"{"nominal": {"data": ["d_nom.json"]}}"#;
        let config = SystConfig::from_json_str(json, None).unwrap();
        let err = DataVariationFitter::new(&config, &StoreProvider, bins(), &[Variable::Mpf], vec![100.0, 150.0])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }
}
