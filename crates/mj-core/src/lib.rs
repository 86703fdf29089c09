//! # mj-core
//!
//! Core types for the multijet JEC regularization toolkit: the error
//! taxonomy, typed keys for observables and variation directions, columnar
//! event data and the traits behind which event storage is hidden.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod columns;
pub mod error;
pub mod traits;
pub mod types;

pub use columns::Columns;
pub use error::{Error, Result};
pub use traits::{EventSource, SourceProvider};
pub use types::{ByDirection, Direction, Variable};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
