//! # mj-regularization
//!
//! Regularization of balance observables versus leading-jet pt for multijet
//! JEC calibration:
//!
//! - [`TriggerBinSet`]: trigger bins with their pt ranges and alignment checks.
//! - [`WeightedProfileBuilder`]: profiles filled from all trigger bins, each
//!   within its effective pt window.
//! - [`SplineRegressor`]: weighted cubic smoothing splines in log(pt).
//! - [`build_deviation`]: relative deviations from the nominal profile.
//! - [`lowess`] and [`Smoother`]: LOWESS smoothing of up/down variations with
//!   least-squares scale factors.
//! - [`fitter`]: spline models for simulation and for systematic variations.
//! - [`syst_vars`]: relative variations in trigger bins and their smoothing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deviation;
pub mod fitter;
pub mod lowess;
pub mod profile_builder;
pub mod spline;
pub mod stitch;
pub mod syst_config;
pub mod syst_vars;
pub mod trigger_bins;

pub use deviation::{build_deviation, build_deviations};
pub use fitter::{
    DataVariationFit, DataVariationFitter, SimFit, SimVariationFitter, SplineSimFitter, VariationFit,
};
pub use lowess::{SmoothedVariation, Smoother, lowess};
pub use profile_builder::WeightedProfileBuilder;
pub use spline::{NonFinitePolicy, Spline, SplineRegressor, StoredSpline};
pub use stitch::{TriggerProfiles, TriggerStitcher};
pub use syst_config::{SystConfig, Variation, VariationGroup, VariationSamples};
pub use syst_vars::{BalanceBuilder, build_syst_vars, smooth_syst_vars};
pub use trigger_bins::{TriggerBin, TriggerBinSet};
