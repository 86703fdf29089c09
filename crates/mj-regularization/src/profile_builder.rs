//! Profiles of balance observables versus leading-jet pt, merged over trigger
//! bins without double counting.
//!
//! Margined ranges of neighbouring trigger bins overlap by construction. The
//! merged profile picks exactly one trigger bin for every pt value: the first
//! bin extends down to its margined lower edge, the last one up to its
//! margined upper edge, and every bin otherwise covers its own `pt_range`.

use std::collections::BTreeMap;

use rayon::prelude::*;

use mj_core::{Error, EventSource, Result, Variable};
use mj_hist::{
    FillSpec, FillSummary, JsonProfileStore, NegativeWeightPolicy, Profile1D, ProfileAccumulator,
    WeightExpr, Window, fill_profiles, geomspace, validate_edges,
};

use crate::trigger_bins::TriggerBinSet;

/// Builds merged weighted profiles from per-trigger event sources.
#[derive(Debug, Clone)]
pub struct WeightedProfileBuilder {
    trigger_bins: TriggerBinSet,
    binning: Option<Vec<f64>>,
    negative_weight_policy: NegativeWeightPolicy,
}

impl WeightedProfileBuilder {
    /// Builder over the trigger bins whose `pt_range` starts below `max_pt`.
    pub fn new(trigger_bins: &TriggerBinSet, max_pt: f64) -> Result<Self> {
        let trigger_bins = trigger_bins.below(max_pt);
        if trigger_bins.is_empty() {
            return Err(Error::Config(format!("no trigger bins start below max_pt = {max_pt}")));
        }
        Ok(Self { trigger_bins, binning: None, negative_weight_policy: NegativeWeightPolicy::Allow })
    }

    /// Set the negative weight policy used when filling.
    pub fn with_negative_weight_policy(mut self, policy: NegativeWeightPolicy) -> Self {
        self.negative_weight_policy = policy;
        self
    }

    /// Logarithmic binning from the margined lower edge of the first trigger
    /// bin up to `max_pt` with `num_bins` bins. The binning is also stored in
    /// the builder.
    pub fn construct_binning(&mut self, max_pt: f64, num_bins: usize) -> Result<&[f64]> {
        let lo = self.first_bin_margined_lo();
        if lo <= 0.0 {
            return Err(Error::Config(format!(
                "logarithmic binning requires a positive lower edge, got {lo}"
            )));
        }
        let edges = self.binning.insert(geomspace(lo, max_pt, num_bins + 1)?);
        Ok(edges.as_slice())
    }

    /// Use an explicit binning.
    pub fn with_binning(mut self, edges: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        self.binning = Some(edges);
        Ok(self)
    }

    /// Current binning, if set.
    pub fn binning(&self) -> Option<&[f64]> {
        self.binning.as_deref()
    }

    /// Trigger bins used by the builder.
    pub fn trigger_bins(&self) -> &TriggerBinSet {
        &self.trigger_bins
    }

    fn first_bin_margined_lo(&self) -> f64 {
        self.trigger_bins.first().map_or(f64::NAN, |b| b.pt_range_margined.0)
    }

    /// Effective pt window of every trigger bin, in ascending pt.
    ///
    /// A single trigger bin uses its full margined range.
    pub fn effective_windows(&self) -> Result<Vec<(String, Window)>> {
        self.trigger_bins.check_contiguous()?;
        let n = self.trigger_bins.len();
        let windows = self
            .trigger_bins
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let lo = if i == 0 { b.pt_range_margined.0 } else { b.pt_range.0 };
                let hi = if i + 1 == n { b.pt_range_margined.1 } else { b.pt_range.1 };
                (b.name.clone(), Window::new(lo, hi))
            })
            .collect();
        Ok(windows)
    }

    /// Fill un-finalized accumulators, one per variable.
    ///
    /// Trigger bins are filled independently and merged in ascending pt.
    pub fn fill_accumulators(
        &self,
        source: &dyn EventSource,
        weight: &WeightExpr,
        variables: &[Variable],
    ) -> Result<BTreeMap<Variable, ProfileAccumulator>> {
        let binning = self
            .binning
            .as_ref()
            .ok_or_else(|| Error::Config("binning is not defined".into()))?;
        let windows = self.effective_windows()?;
        let y_columns: Vec<String> = variables.iter().map(|v| v.column().to_string()).collect();

        let partials: Vec<(Vec<ProfileAccumulator>, FillSummary)> = windows
            .par_iter()
            .map(|(trigger, window)| {
                let columns = source.events(trigger)?;
                let spec = FillSpec::new(Variable::PtLead.column(), y_columns.clone())
                    .weight(weight.clone())
                    .window(*window)
                    .negative_weight_policy(self.negative_weight_policy);
                let mut accs = variables
                    .iter()
                    .map(|_| ProfileAccumulator::new(binning.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let summary = fill_profiles(&columns, &spec, &mut accs)?;
                log::debug!(
                    "trigger bin {trigger}: window [{}, {}), {} entries, {} outside",
                    window.lo,
                    window.hi,
                    summary.entries,
                    summary.outside_window
                );
                Ok((accs, summary))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut merged: Vec<ProfileAccumulator> = variables
            .iter()
            .map(|_| ProfileAccumulator::new(binning.clone()))
            .collect::<Result<Vec<_>>>()?;
        let mut total = FillSummary::default();
        for (accs, summary) in &partials {
            for (dst, src) in merged.iter_mut().zip(accs) {
                dst.merge(src)?;
            }
            total += *summary;
        }
        if total.non_finite > 0 {
            log::warn!("{} events with non-finite pt or weight skipped in {}", total.non_finite, source.name());
        }
        if total.non_finite_observables > 0 {
            log::warn!("{} non-finite observable values skipped in {}", total.non_finite_observables, source.name());
        }
        log::info!("filled {} events from {} trigger bins of {}", total.entries, windows.len(), source.name());

        Ok(variables.iter().copied().zip(merged).collect())
    }

    /// Fill and finalize one profile per variable.
    ///
    /// Include [`Variable::PtLead`] to obtain the mean pt per bin.
    pub fn fill(
        &self,
        source: &dyn EventSource,
        weight: &WeightExpr,
        variables: &[Variable],
    ) -> Result<BTreeMap<Variable, Profile1D>> {
        Ok(self
            .fill_accumulators(source, weight, variables)?
            .into_iter()
            .map(|(v, acc)| (v, acc.finalize()))
            .collect())
    }

    /// Fill a profile store with one accumulator per trigger bin and variable.
    ///
    /// Unlike [`fill_accumulators`](Self::fill_accumulators), every trigger
    /// bin only takes events within its own `pt_range`, and the trigger bins
    /// are kept apart. Accumulators are stored under
    /// [`Variable::profile_name`].
    pub fn fill_store(
        &self,
        source: &dyn EventSource,
        weight: &WeightExpr,
        variables: &[Variable],
    ) -> Result<JsonProfileStore> {
        let binning = self
            .binning
            .as_ref()
            .ok_or_else(|| Error::Config("binning is not defined".into()))?;
        let y_columns: Vec<String> = variables.iter().map(|v| v.column().to_string()).collect();

        let filled: Vec<(String, Vec<ProfileAccumulator>)> = self
            .trigger_bins
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|bin| {
                let columns = source.events(&bin.name)?;
                let spec = FillSpec::new(Variable::PtLead.column(), y_columns.clone())
                    .weight(weight.clone())
                    .window(Window::new(bin.pt_range.0, bin.pt_range.1))
                    .negative_weight_policy(self.negative_weight_policy);
                let mut accs = variables
                    .iter()
                    .map(|_| ProfileAccumulator::new(binning.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let summary = fill_profiles(&columns, &spec, &mut accs)?;
                if summary.non_finite > 0 || summary.non_finite_observables > 0 {
                    log::warn!(
                        "trigger bin {}: {} events with non-finite pt or weight and {} non-finite observable values skipped",
                        bin.name,
                        summary.non_finite,
                        summary.non_finite_observables
                    );
                }
                log::debug!("trigger bin {}: {} entries", bin.name, summary.entries);
                Ok((bin.name.clone(), accs))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut store = JsonProfileStore::new();
        for (trigger, accs) in filled {
            for (variable, acc) in variables.iter().zip(accs) {
                store.insert(&trigger, &variable.profile_name(), acc);
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_bins::TriggerBin;
    use approx::assert_relative_eq;
    use mj_core::Columns;
    use mj_hist::JsonEventSource;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scenario_bins() -> TriggerBinSet {
        TriggerBinSet::from_bins([
            TriggerBin::new("A", "HLT_A", (100.0, 200.0), (90.0, 220.0)).unwrap(),
            TriggerBin::new("B", "HLT_B", (200.0, 500.0), (180.0, 520.0)).unwrap(),
        ])
    }

    fn three_bins() -> TriggerBinSet {
        TriggerBinSet::from_bins([
            TriggerBin::new("A", "a", (100.0, 200.0), (90.0, 220.0)).unwrap(),
            TriggerBin::new("B", "b", (200.0, 500.0), (180.0, 520.0)).unwrap(),
            TriggerBin::new("C", "c", (500.0, 1000.0), (480.0, 1100.0)).unwrap(),
        ])
    }

    #[test]
    fn scenario_windows() {
        let builder = WeightedProfileBuilder::new(&scenario_bins(), f64::INFINITY).unwrap();
        let windows = builder.effective_windows().unwrap();
        assert_eq!(windows[0], ("A".to_string(), Window::new(90.0, 200.0)));
        assert_eq!(windows[1], ("B".to_string(), Window::new(200.0, 520.0)));
    }

    #[test]
    fn windows_tile_margined_span() {
        for set in [scenario_bins(), three_bins()] {
            let builder = WeightedProfileBuilder::new(&set, f64::INFINITY).unwrap();
            let windows = builder.effective_windows().unwrap();
            assert_eq!(windows[0].1.lo, set.first().unwrap().pt_range_margined.0);
            assert_eq!(windows.last().unwrap().1.hi, set.last().unwrap().pt_range_margined.1);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1.hi, pair[1].1.lo);
            }
            // Every sampled pt lands in exactly one window
            let mut pt = 90.0;
            while pt < 1100.0 {
                let hits = windows.iter().filter(|(_, w)| w.contains(pt)).count();
                assert_eq!(hits, 1, "pt = {pt}");
                pt += 2.5;
            }
        }
    }

    #[test]
    fn random_trigger_bins_tile_without_overlap() {
        let mut rng = StdRng::seed_from_u64(2018);
        for _ in 0..200 {
            let n = rng.gen_range(1..=6);
            let mut edges = vec![rng.gen_range(20.0..150.0)];
            for _ in 0..n {
                let last = edges[edges.len() - 1];
                edges.push(last * rng.gen_range(1.1..3.0));
            }
            let open_ended = rng.gen_bool(0.5);
            let set = TriggerBinSet::from_bins((0..n).map(|i| {
                let hi = if open_ended && i + 1 == n { f64::INFINITY } else { edges[i + 1] };
                let margined = (edges[i] * rng.gen_range(0.8..1.0), hi * rng.gen_range(1.0..1.2));
                TriggerBin::new(format!("T{i}"), format!("HLT_T{i}"), (edges[i], hi), margined).unwrap()
            }));

            let builder = WeightedProfileBuilder::new(&set, f64::INFINITY).unwrap();
            let windows = builder.effective_windows().unwrap();
            assert_eq!(windows.len(), n);
            let lo = set.first().unwrap().pt_range_margined.0;
            let hi = set.last().unwrap().pt_range_margined.1;
            assert_eq!(windows[0].1.lo, lo);
            assert_eq!(windows[n - 1].1.hi, hi);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1.hi, pair[1].1.lo);
            }

            let top = if hi.is_finite() { hi } else { 2.0 * edges[n] };
            for _ in 0..100 {
                let pt = rng.gen_range(lo..top);
                let hits = windows.iter().filter(|(_, w)| w.contains(pt)).count();
                assert_eq!(hits, 1, "pt = {pt}, windows = {windows:?}");
            }
            // Boundaries belong to the upper window only
            for (_, w) in &windows {
                let hits = windows.iter().filter(|(_, other)| other.contains(w.lo)).count();
                assert_eq!(hits, 1, "edge {}", w.lo);
            }
            assert!(windows.iter().all(|(_, w)| !w.contains(lo - 1.0)));
        }
    }

    #[test]
    fn single_bin_uses_margined_range() {
        let set = TriggerBinSet::from_bins([TriggerBin::new("A", "a", (100.0, 200.0), (90.0, 220.0)).unwrap()]);
        let builder = WeightedProfileBuilder::new(&set, f64::INFINITY).unwrap();
        assert_eq!(builder.effective_windows().unwrap()[0].1, Window::new(90.0, 220.0));
    }

    #[test]
    fn bins_above_max_pt_are_excluded() {
        let builder = WeightedProfileBuilder::new(&three_bins(), 600.0).unwrap();
        assert_eq!(builder.trigger_bins().len(), 3);
        let builder = WeightedProfileBuilder::new(&three_bins(), 500.0).unwrap();
        assert_eq!(builder.trigger_bins().names(), vec!["A", "B"]);
        // B is now last and extends to its margined upper edge
        assert_eq!(builder.effective_windows().unwrap()[1].1.hi, 520.0);
        assert!(WeightedProfileBuilder::new(&three_bins(), 50.0).is_err());
    }

    #[test]
    fn construct_binning_is_logarithmic() {
        let mut builder = WeightedProfileBuilder::new(&scenario_bins(), f64::INFINITY).unwrap();
        let edges = builder.construct_binning(900.0, 2).unwrap().to_vec();
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0], 90.0);
        assert_relative_eq!(edges[1], 284.604989, epsilon = 1e-5);
        assert_eq!(builder.binning().unwrap(), edges.as_slice());
    }

    fn overlapping_source() -> JsonEventSource {
        // Event at pt = 210 is in both margined ranges; only B may count it.
        let mut a = Columns::new();
        a.insert("PtJ1", vec![95.0, 150.0, 210.0]).unwrap();
        a.insert("MPF", vec![1.0, 1.0, 100.0]).unwrap();
        a.insert("WeightGen", vec![1.0, 1.0, 1.0]).unwrap();
        a.insert("Weight_X", vec![1.0, 1.0, 1.0]).unwrap();
        let mut b = Columns::new();
        b.insert("PtJ1", vec![190.0, 210.0, 510.0]).unwrap();
        b.insert("MPF", vec![100.0, 2.0, 3.0]).unwrap();
        b.insert("WeightGen", vec![1.0, 1.0, 2.0]).unwrap();
        b.insert("Weight_X", vec![1.0, 1.0, 1.0]).unwrap();
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), a);
        map.insert("B".to_string(), b);
        JsonEventSource::from_map("mem", map)
    }

    #[test]
    fn fill_avoids_double_counting() {
        let builder = WeightedProfileBuilder::new(&scenario_bins(), f64::INFINITY)
            .unwrap()
            .with_binning(vec![90.0, 100.0, 200.0, 300.0, 520.0])
            .unwrap();
        let weight = WeightExpr::simulation("X", None);
        let accs = builder
            .fill_accumulators(&overlapping_source(), &weight, &[Variable::PtLead, Variable::Mpf])
            .unwrap();
        let mpf = &accs[&Variable::Mpf];
        assert_eq!(mpf.entries(), 4);
        assert_eq!(mpf.sumw(), &[0.0, 1.0, 1.0, 1.0, 2.0, 0.0]);

        let profiles = builder
            .fill(&overlapping_source(), &weight, &[Variable::PtLead, Variable::Mpf])
            .unwrap();
        assert_eq!(profiles[&Variable::Mpf].contents[3], 2.0);
        assert_eq!(profiles[&Variable::PtLead].contents[3], 210.0);
        // Empty bins stay at zero
        assert_eq!(profiles[&Variable::Mpf].bin(5), (0.0, 0.0));
    }

    #[test]
    fn fill_requires_binning() {
        let builder = WeightedProfileBuilder::new(&scenario_bins(), f64::INFINITY).unwrap();
        let err = builder
            .fill(&overlapping_source(), &WeightExpr::unit(), &[Variable::Mpf])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn fill_store_keeps_trigger_bins_apart() {
        use mj_hist::ProfileSource;

        let builder = WeightedProfileBuilder::new(&scenario_bins(), f64::INFINITY)
            .unwrap()
            .with_binning(vec![90.0, 100.0, 200.0, 300.0, 520.0])
            .unwrap();
        let store = builder
            .fill_store(&overlapping_source(), &WeightExpr::unit(), &[Variable::PtLead, Variable::Mpf])
            .unwrap();
        assert_eq!(store.triggers().collect::<Vec<_>>(), vec!["A", "B"]);

        // A takes pt in [100, 200): only the event at 150
        let a = store.profile("A", "MPFProfile").unwrap();
        assert_eq!(a.entries(), 1);
        assert_eq!(a.sumwy()[2], 1.0);
        // B takes pt in [200, 500): only the event at 210
        let b = store.profile("B", "MPFProfile").unwrap();
        assert_eq!(b.entries(), 1);
        assert_eq!(b.sumwy()[3], 2.0);
        assert!(store.profile("B", "PtLeadProfile").is_ok());
    }
}
