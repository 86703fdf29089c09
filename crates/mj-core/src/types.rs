//! Common data types shared by the multijet JEC crates

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-event observable profiled versus the leading-jet pt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variable {
    /// Transverse momentum of the leading jet (the profile x-axis).
    #[serde(rename = "PtLead", alias = "PtJ1")]
    PtLead,
    /// Momentum balance.
    #[serde(rename = "PtBal")]
    PtBal,
    /// Missing-pt projection fraction.
    #[serde(rename = "MPF")]
    Mpf,
}

impl Variable {
    /// Balance observables, in the order used for output.
    pub const BALANCE: [Variable; 2] = [Variable::PtBal, Variable::Mpf];

    /// Human-readable name, also used for stored objects.
    pub fn name(self) -> &'static str {
        match self {
            Variable::PtLead => "PtLead",
            Variable::PtBal => "PtBal",
            Variable::Mpf => "MPF",
        }
    }

    /// Name of the column holding the observable in event tuples.
    pub fn column(self) -> &'static str {
        match self {
            Variable::PtLead => "PtJ1",
            Variable::PtBal => "PtBal",
            Variable::Mpf => "MPF",
        }
    }

    /// Name of the stored profile of this observable versus leading-jet pt.
    pub fn profile_name(self) -> String {
        format!("{}Profile", self.name())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PtLead" | "PtJ1" => Ok(Variable::PtLead),
            "PtBal" => Ok(Variable::PtBal),
            "MPF" | "Mpf" => Ok(Variable::Mpf),
            other => Err(Error::NotFound(format!("unknown variable '{other}'"))),
        }
    }
}

/// Direction of a systematic variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// +1σ variation.
    Up,
    /// −1σ variation.
    Down,
}

impl Direction {
    /// Both directions, up first.
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    /// Lowercase label (`"up"` / `"down"`).
    pub fn label(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Capitalized suffix used in stored names (`"Up"` / `"Down"`).
    pub fn suffix(self) -> &'static str {
        match self {
            Direction::Up => "Up",
            Direction::Down => "Down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A pair of values indexed by [`Direction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByDirection<T> {
    /// Value for the up variation.
    pub up: T,
    /// Value for the down variation.
    pub down: T,
}

impl<T> ByDirection<T> {
    /// Create a pair.
    pub fn new(up: T, down: T) -> Self {
        Self { up, down }
    }

    /// Build a pair by calling `f` for each direction (up first).
    pub fn try_from_fn<F>(mut f: F) -> Result<Self>
    where
        F: FnMut(Direction) -> Result<T>,
    {
        let up = f(Direction::Up)?;
        let down = f(Direction::Down)?;
        Ok(Self { up, down })
    }

    /// Apply `f` to both values.
    pub fn map<U, F>(self, mut f: F) -> ByDirection<U>
    where
        F: FnMut(T) -> U,
    {
        ByDirection { up: f(self.up), down: f(self.down) }
    }

    /// Borrow both values.
    pub fn by_ref(&self) -> ByDirection<&T> {
        ByDirection { up: &self.up, down: &self.down }
    }

    /// Iterate over `(direction, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &T)> {
        [(Direction::Up, &self.up), (Direction::Down, &self.down)].into_iter()
    }
}

impl<T> Index<Direction> for ByDirection<T> {
    type Output = T;

    fn index(&self, direction: Direction) -> &T {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

impl<T> IndexMut<Direction> for ByDirection<T> {
    fn index_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}
