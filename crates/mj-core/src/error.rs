//! Error types for multijet JEC

use thiserror::Error;

/// Multijet JEC error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed trigger-bin, binning or systematics configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Boundaries of trigger bins missing from a binning
    #[error("Following boundaries of trigger bins are not aligned with the binning: {edges:?}")]
    Alignment {
        /// Offending trigger-bin edges, in trigger-bin order.
        edges: Vec<f64>,
    },

    /// Lookup by name failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Too few points for a fit
    #[error("Insufficient data: {needed} distinct points required, got {got}")]
    InsufficientData {
        /// Minimal number of points.
        needed: usize,
        /// Number of usable points supplied.
        got: usize,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
