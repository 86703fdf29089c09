//! # mj-hist
//!
//! Weighted profiles of balance observables versus leading-jet pt.
//!
//! - [`ProfileAccumulator`] keeps the raw weighted sums so that partial fills
//!   (per trigger bin, per thread, per file) can be merged and rebinned.
//! - [`Profile1D`] is the finalized mean/uncertainty view.
//! - [`fill_profiles`] fills accumulators from event columns in one pass.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod binning;
pub mod filler;
pub mod profile;
pub mod source;
pub mod weight;

pub use accumulator::ProfileAccumulator;
pub use binning::{find_bin, geomspace, validate_edges};
pub use filler::{FillSpec, FillSummary, NegativeWeightPolicy, Window, fill_profiles};
pub use profile::Profile1D;
pub use source::{
    ChainedSource, JsonEventSource, JsonProfileProvider, JsonProfileStore, JsonSourceProvider,
    ProfileSource, ProfileSourceProvider,
};
pub use weight::WeightExpr;
