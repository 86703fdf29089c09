//! Multijet JEC CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mj_core::{Direction, Error, SourceProvider, Variable};
use mj_hist::{JsonProfileProvider, JsonSourceProvider, WeightExpr, validate_edges};
use mj_regularization::fitter::{DEFAULT_MAX_PT, DEFAULT_SIM_BINS, DEFAULT_VARIATION_BINS};
use mj_regularization::{
    BalanceBuilder, DataVariationFitter, NonFinitePolicy, SimVariationFitter, SplineRegressor,
    SplineSimFitter, SystConfig, TriggerBinSet, TriggerProfiles, VariationGroup, WeightedProfileBuilder,
    build_syst_vars, smooth_syst_vars,
};

#[derive(Parser)]
#[command(name = "multijet")]
#[command(about = "Multijet JEC - trigger-bin profiles, spline fits and smoothing of systematic variations")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    /// Threads (0 = auto)
    #[arg(long, global = true, default_value = "0")]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that trigger-bin boundaries are edges of an analysis binning
    CheckBinning {
        /// Trigger bins (JSON)
        #[arg(long)]
        trigger_bins: PathBuf,

        /// Analysis binning (JSON array of edges)
        #[arg(long)]
        binning: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fill per-trigger profiles of PtLead, PtBal and MPF from event files
    FillProfiles {
        /// Trigger bins (JSON)
        #[arg(long)]
        trigger_bins: PathBuf,

        /// Event files (JSON columns per trigger bin)
        #[arg(long, num_args = 1.., required = true)]
        events: Vec<PathBuf>,

        /// Binning of the stored profiles (JSON array of edges)
        #[arg(long)]
        binning: PathBuf,

        /// Weight simulated events with the period weight of this era.
        /// Events are unweighted if omitted.
        #[arg(long)]
        era: Option<String>,

        /// Output profile store (JSON)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Fit splines to balance observables in simulation
    FitSim {
        /// Trigger bins (JSON)
        #[arg(long)]
        trigger_bins: PathBuf,

        /// Simulated event files
        #[arg(long, num_args = 1.., required = true)]
        events: Vec<PathBuf>,

        /// Era of the period weight
        #[arg(long)]
        era: String,

        /// Variables to fit
        #[arg(long, value_delimiter = ',', default_value = "PtBal,MPF")]
        variables: Vec<Variable>,

        /// Upper cut on leading-jet pt
        #[arg(long, default_value_t = DEFAULT_MAX_PT)]
        max_pt: f64,

        /// Number of logarithmic pt bins
        #[arg(long, default_value_t = DEFAULT_SIM_BINS)]
        num_bins: usize,

        /// Target chi2 of the smoothing spline. Defaults to the number of points.
        #[arg(long)]
        smoothing: Option<f64>,

        /// Skip bins with non-finite content or error instead of failing
        #[arg(long)]
        skip_non_finite: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit relative deviations of systematic variations with splines
    FitVariations {
        /// Systematics configuration (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Single era, overriding the eras and period weight of the configuration
        #[arg(long)]
        era: Option<String>,

        /// Trigger bins (JSON)
        #[arg(long)]
        trigger_bins: PathBuf,

        /// Group of variations to fit (data, sim, all)
        #[arg(long, default_value = "all")]
        group: VariationGroup,

        /// Analysis binning (JSON array of edges), required for variations in data
        #[arg(long)]
        binning: Option<PathBuf>,

        /// Variables to fit
        #[arg(long, value_delimiter = ',', default_value = "PtBal,MPF")]
        variables: Vec<Variable>,

        /// Upper cut on leading-jet pt for variations in simulation
        #[arg(long, default_value_t = DEFAULT_MAX_PT)]
        max_pt: f64,

        /// Number of logarithmic pt bins for variations in simulation
        #[arg(long, default_value_t = DEFAULT_VARIATION_BINS)]
        num_bins: usize,

        /// Target chi2 of the smoothing spline. Defaults to the number of points.
        #[arg(long)]
        smoothing: Option<f64>,

        /// Skip bins with non-finite content or error instead of failing
        #[arg(long)]
        skip_non_finite: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build relative uncertainties and variations in every trigger bin
    BuildSystVars {
        /// Systematics configuration (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Single era, overriding the eras and period weight of the configuration
        #[arg(long)]
        era: Option<String>,

        /// Trigger bins (JSON)
        #[arg(long)]
        trigger_bins: PathBuf,

        /// Analysis binning (JSON array of edges)
        #[arg(long)]
        binning: PathBuf,

        /// Group of variations to include (data, sim, all)
        #[arg(long, default_value = "all")]
        group: VariationGroup,

        /// Balance observables
        #[arg(long, value_delimiter = ',', default_value = "PtBal,MPF")]
        variables: Vec<Variable>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Smooth relative variations with LOWESS over all trigger bins
    Smooth {
        /// Relative uncertainties and variations (output of build-syst-vars)
        #[arg(short, long)]
        input: PathBuf,

        /// Balance observables
        #[arg(long, value_delimiter = ',', default_value = "PtBal,MPF")]
        variables: Vec<Variable>,

        /// Bandwidth as a fraction of the number of bins
        #[arg(long, default_value = "0.1")]
        bandwidth_fraction: f64,

        /// Force up and down variations to be symmetric
        #[arg(long)]
        symmetric: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    if cli.threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(cli.threads).build_global();
    }

    match cli.command {
        Commands::CheckBinning { trigger_bins, binning, output } => {
            cmd_check_binning(&trigger_bins, &binning, output.as_ref())
        }
        Commands::FillProfiles { trigger_bins, events, binning, era, output } => {
            cmd_fill_profiles(&trigger_bins, &events, &binning, era.as_deref(), &output)
        }
        Commands::FitSim {
            trigger_bins,
            events,
            era,
            variables,
            max_pt,
            num_bins,
            smoothing,
            skip_non_finite,
            output,
        } => cmd_fit_sim(
            &trigger_bins,
            &events,
            &era,
            &variables,
            max_pt,
            num_bins,
            regressor(smoothing, skip_non_finite),
            output.as_ref(),
        ),
        Commands::FitVariations {
            config,
            era,
            trigger_bins,
            group,
            binning,
            variables,
            max_pt,
            num_bins,
            smoothing,
            skip_non_finite,
            output,
        } => cmd_fit_variations(
            &config,
            era.as_deref(),
            &trigger_bins,
            group,
            binning.as_deref(),
            &variables,
            max_pt,
            num_bins,
            regressor(smoothing, skip_non_finite),
            output.as_ref(),
        ),
        Commands::BuildSystVars { config, era, trigger_bins, binning, group, variables, output } => {
            cmd_build_syst_vars(
                &config,
                era.as_deref(),
                &trigger_bins,
                &binning,
                group,
                &variables,
                output.as_ref(),
            )
        }
        Commands::Smooth { input, variables, bandwidth_fraction, symmetric, output } => {
            cmd_smooth(&input, &variables, bandwidth_fraction, symmetric, output.as_ref())
        }
    }
}

fn regressor(smoothing: Option<f64>, skip_non_finite: bool) -> SplineRegressor {
    let policy = if skip_non_finite { NonFinitePolicy::Skip } else { NonFinitePolicy::Error };
    let regressor = SplineRegressor::new().with_non_finite_policy(policy);
    match smoothing {
        Some(s) => regressor.with_smoothing(s),
        None => regressor,
    }
}

fn load_binning(path: &Path) -> Result<Vec<f64>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read binning {}", path.display()))?;
    let edges: Vec<f64> = serde_json::from_str(&json)
        .with_context(|| format!("binning {} is not a JSON array of numbers", path.display()))?;
    validate_edges(&edges)?;
    Ok(edges)
}

/// Trigger bins clipped at the last edge of `binning`.
fn load_trigger_bins_for(path: &Path, binning: &[f64]) -> Result<TriggerBinSet> {
    let clip = binning.last().copied().unwrap_or(f64::INFINITY);
    let bins = TriggerBinSet::load_clipped(path, clip)?;
    tracing::info!(path = %path.display(), trigger_bins = bins.len(), clip, "trigger bins loaded");
    Ok(bins)
}

fn cmd_check_binning(trigger_bins: &Path, binning: &Path, output: Option<&PathBuf>) -> Result<()> {
    let binning = load_binning(binning)?;
    let bins = load_trigger_bins_for(trigger_bins, &binning)?;
    bins.validate_analysis_binning(&binning)?;

    write_json(
        output,
        serde_json::json!({
            "aligned": true,
            "num_bins": binning.len() - 1,
            "trigger_bins": bins.names(),
        }),
    )
}

fn cmd_fill_profiles(
    trigger_bins: &Path,
    events: &[PathBuf],
    binning: &Path,
    era: Option<&str>,
    output: &Path,
) -> Result<()> {
    let binning = load_binning(binning)?;
    let bins = TriggerBinSet::load(trigger_bins)?;
    let builder = WeightedProfileBuilder::new(&bins, f64::INFINITY)?.with_binning(binning)?;
    let weight = era.map_or_else(WeightExpr::unit, |era| WeightExpr::simulation(era, None));

    let source = JsonSourceProvider.open(events)?;
    let variables = [Variable::PtLead, Variable::PtBal, Variable::Mpf];
    let store = builder.fill_store(source.as_ref(), &weight, &variables)?;
    store.save(output)?;
    tracing::info!(path = %output.display(), weight = %weight, "profile store written");
    Ok(())
}

#[derive(Serialize)]
struct FailureJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    variable: Variable,
    error: String,
}

impl FailureJson {
    fn from_pairs<'a>(
        label: Option<&str>,
        failures: impl IntoIterator<Item = &'a (Variable, Error)>,
    ) -> Vec<Self> {
        failures
            .into_iter()
            .map(|(variable, error)| Self {
                label: label.map(String::from),
                variable: *variable,
                error: error.to_string(),
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_fit_sim(
    trigger_bins: &Path,
    events: &[PathBuf],
    era: &str,
    variables: &[Variable],
    max_pt: f64,
    num_bins: usize,
    regressor: SplineRegressor,
    output: Option<&PathBuf>,
) -> Result<()> {
    let bins = TriggerBinSet::load(trigger_bins)?;
    let source = JsonSourceProvider.open(events)?;
    let mut fitter = SplineSimFitter::new(source, era, bins).with_regressor(regressor);
    let fit = fitter.fit(variables, max_pt, num_bins)?;
    tracing::info!(splines = fit.splines().len(), failures = fit.failures().len(), "simulation fit complete");

    let splines: BTreeMap<&str, _> =
        fit.splines().iter().map(|(v, s)| (v.name(), s.to_stored())).collect();
    write_json(
        output,
        serde_json::json!({
            "era": era,
            "max_pt": max_pt,
            "num_bins": num_bins,
            "trigger_bins": fit.triggers(),
            "splines": splines,
            "failures": FailureJson::from_pairs(None, fit.failures()),
        }),
    )
}

#[allow(clippy::too_many_arguments)]
fn cmd_fit_variations(
    config: &Path,
    era: Option<&str>,
    trigger_bins: &Path,
    group: VariationGroup,
    binning: Option<&Path>,
    variables: &[Variable],
    max_pt: f64,
    num_bins: usize,
    regressor: SplineRegressor,
    output: Option<&PathBuf>,
) -> Result<()> {
    let config = SystConfig::load(config, era)?;
    let labels: Vec<&str> = config.iter_group(group).collect();
    if labels.is_empty() {
        bail!("no variations of group \"{group}\" in the configuration");
    }
    // A variation with both inputs is fitted in data and in simulation
    let with_sim: Vec<&str> = match group {
        VariationGroup::Data => Vec::new(),
        _ => labels.iter().copied().filter(|l| has_input(&config, l, SampleKind::Sim)).collect(),
    };
    let with_data: Vec<&str> = match group {
        VariationGroup::Sim => Vec::new(),
        _ => labels.iter().copied().filter(|l| has_input(&config, l, SampleKind::Data)).collect(),
    };

    // Both fitters see the trigger bins clipped at the end of the analysis binning
    let binning = binning.map(load_binning).transpose()?;
    let bins = match &binning {
        Some(edges) => load_trigger_bins_for(trigger_bins, edges)?,
        None => TriggerBinSet::load(trigger_bins)?,
    };

    let mut failures = Vec::new();

    let mut sim = serde_json::Map::new();
    if !with_sim.is_empty() {
        let fitter = SimVariationFitter::new(&config, &JsonSourceProvider, &bins, variables, max_pt, num_bins)?
            .with_regressor(regressor.clone());
        for label in with_sim {
            let fit = fitter.fit(label)?;
            let splines: BTreeMap<&str, _> = fit
                .splines()
                .iter()
                .map(|(v, pair)| (v.name(), pair.by_ref().map(|s| s.to_stored())))
                .collect();
            failures.extend(FailureJson::from_pairs(Some(label), fit.failures()));
            sim.insert(label.to_string(), serde_json::to_value(splines)?);
        }
    }

    let mut data = serde_json::Map::new();
    if !with_data.is_empty() {
        let binning = binning.context("--binning is required to fit variations in data")?;
        let fitter = DataVariationFitter::new(&config, &JsonProfileProvider, bins, variables, binning)?
            .with_regressor(regressor);
        for label in with_data {
            let fit = fitter.fit(label)?;
            let smoothed: BTreeMap<&str, _> = fit.smoothed.iter().map(|(v, pair)| (v.name(), pair)).collect();
            failures.extend(FailureJson::from_pairs(Some(label), &fit.failures));
            data.insert(label.to_string(), serde_json::to_value(smoothed)?);
        }
    }

    write_json(
        output,
        serde_json::json!({
            "sim": sim,
            "data": data,
            "failures": failures,
        }),
    )
}

#[derive(Clone, Copy)]
enum SampleKind {
    Data,
    Sim,
}

fn has_input(config: &SystConfig, label: &str, kind: SampleKind) -> bool {
    config.samples(label, Direction::Up).is_ok_and(|s| match kind {
        SampleKind::Data => s.has_data(),
        SampleKind::Sim => s.has_sim(),
    })
}

fn cmd_build_syst_vars(
    config: &Path,
    era: Option<&str>,
    trigger_bins: &Path,
    binning: &Path,
    group: VariationGroup,
    variables: &[Variable],
    output: Option<&PathBuf>,
) -> Result<()> {
    let config = SystConfig::load(config, era)?;
    let binning = load_binning(binning)?;
    let bins = load_trigger_bins_for(trigger_bins, &binning)?;
    let builder = BalanceBuilder::new(&bins, &binning)?;

    let result = build_syst_vars(&config, group, &builder, &JsonSourceProvider, &JsonProfileProvider, variables)?;
    tracing::info!(trigger_bins = result.len(), "relative variations built");
    write_json(output, serde_json::to_value(&result)?)
}

fn cmd_smooth(
    input: &Path,
    variables: &[Variable],
    bandwidth_fraction: f64,
    symmetric: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    if bandwidth_fraction.is_nan() || bandwidth_fraction <= 0.0 {
        bail!("bandwidth fraction must be positive, got {bandwidth_fraction}");
    }
    tracing::info!(path = %input.display(), "loading relative variations");
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let profiles: TriggerProfiles = serde_json::from_str(&json)?;

    let smoothed = smooth_syst_vars(&profiles, variables, bandwidth_fraction, symmetric)?;
    write_json(output, serde_json::to_value(&smoothed)?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
