//! Event-weight expressions.
//!
//! Weights are products of column names and numeric constants, e.g.
//! `"WeightGen * Weight_2018 * 0.5"`. Parentheses are accepted as long as
//! they balance; they do not change a pure product.

use std::fmt;

use serde::{Deserialize, Serialize};

use mj_core::{Columns, Error, Result};

/// Generator-level weight column of simulated events.
pub const GENERATOR_WEIGHT: &str = "WeightGen";

/// Factor of a weight product.
#[derive(Debug, Clone, PartialEq)]
enum Factor {
    Constant(f64),
    Column(String),
}

/// A parsed product of columns and constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WeightExpr {
    factors: Vec<Factor>,
}

impl WeightExpr {
    /// Parse an expression of the form `a * b * 2.5`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut depth = 0i32;
        for c in input.chars() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::Config(format!("unbalanced ')' in weight '{input}'")));
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(Error::Config(format!("unbalanced '(' in weight '{input}'")));
        }

        let stripped: String = input.chars().filter(|c| *c != '(' && *c != ')').collect();
        if stripped.trim().is_empty() {
            return Err(Error::Config("empty weight expression".into()));
        }

        let factors = stripped
            .split('*')
            .map(|tok| parse_factor(tok.trim(), input))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { factors })
    }

    /// Expression that is identically 1.
    pub fn unit() -> Self {
        Self { factors: Vec::new() }
    }

    /// Weight of a single column.
    pub fn column(name: impl Into<String>) -> Self {
        Self { factors: vec![Factor::Column(name.into())] }
    }

    /// Weight of simulated events in the given era: generator weight times the
    /// period weight `Weight_<era>`, times `additional` if given.
    pub fn simulation(era: &str, additional: Option<&WeightExpr>) -> Self {
        let base = Self {
            factors: vec![
                Factor::Column(GENERATOR_WEIGHT.to_string()),
                Factor::Column(format!("Weight_{era}")),
            ],
        };
        match additional {
            Some(extra) => base.product(extra),
            None => base,
        }
    }

    /// Product of two expressions.
    pub fn product(&self, other: &WeightExpr) -> Self {
        let mut factors = self.factors.clone();
        factors.extend(other.factors.iter().cloned());
        Self { factors }
    }

    /// Whether the expression is the constant 1.
    pub fn is_unit(&self) -> bool {
        self.factors.iter().all(|f| matches!(f, Factor::Constant(c) if *c == 1.0))
    }

    /// Column names referenced, in order of first occurrence.
    pub fn required_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for f in &self.factors {
            if let Factor::Column(name) = f
                && !names.contains(&name.as_str())
            {
                names.push(name);
            }
        }
        names
    }

    /// Evaluate for every event in `columns`.
    pub fn eval(&self, columns: &Columns) -> Result<Vec<f64>> {
        let mut out = vec![1.0; columns.n_entries()];
        for f in &self.factors {
            match f {
                Factor::Constant(c) => out.iter_mut().for_each(|w| *w *= c),
                Factor::Column(name) => {
                    let values = columns.get(name)?;
                    out.iter_mut().zip(values).for_each(|(w, v)| *w *= v);
                }
            }
        }
        Ok(out)
    }
}

impl Default for WeightExpr {
    fn default() -> Self {
        Self::unit()
    }
}

impl fmt::Display for WeightExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return f.write_str("1");
        }
        for (i, factor) in self.factors.iter().enumerate() {
            if i > 0 {
                f.write_str(" * ")?;
            }
            match factor {
                Factor::Constant(c) => write!(f, "{c}")?,
                Factor::Column(name) => f.write_str(name)?,
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for WeightExpr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<WeightExpr> for String {
    fn from(expr: WeightExpr) -> Self {
        expr.to_string()
    }
}

fn parse_factor(tok: &str, input: &str) -> Result<Factor> {
    if tok.is_empty() {
        return Err(Error::Config(format!("empty factor in weight '{input}'")));
    }
    if let Ok(c) = tok.parse::<f64>() {
        if !c.is_finite() {
            return Err(Error::Config(format!("non-finite constant '{tok}' in weight '{input}'")));
        }
        return Ok(Factor::Constant(c));
    }
    let mut chars = tok.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        Ok(Factor::Column(tok.to_string()))
    } else {
        Err(Error::Config(format!(
            "unsupported term '{tok}' in weight '{input}': only products of columns and constants are allowed"
        )))
    }
}
