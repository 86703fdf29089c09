//! Configuration of systematic variations.
//!
//! The configuration is a JSON document:
//!
//! ```json
//! {
//!   "directory": "/optional/prefix",
//!   "eras": ["2016BCD", "2016EF"],
//!   "period_weight": "2016All",
//!   "nominal": {"data": ["data_{era}.json"], "sim": ["sim.json"]},
//!   "variations": {
//!     "JER": {
//!       "up": {"sim": ["sim_jer_up.json"]},
//!       "down": {"sim": ["sim_jer_down.json"]},
//!       "legend_label": "JER"
//!     },
//!     "L1Res": {
//!       "up": {"data": ["data_l1res_up_{era}.json"]},
//!       "down": {"data": ["data_l1res_down_{era}.json"]}
//!     }
//!   }
//! }
//! ```
//!
//! A sample group may also carry `"add_weight"`, an additional weight
//! expression for simulation. Paths containing `{era}` are expanded once per
//! era and all paths are resolved relative to `directory`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use mj_core::{ByDirection, Direction, Error, Result};
use mj_hist::WeightExpr;

const ERA_PLACEHOLDER: &str = "{era}";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSamples {
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    sim: Vec<String>,
    #[serde(default)]
    add_weight: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariation {
    up: RawSamples,
    down: RawSamples,
    #[serde(default)]
    legend_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    eras: Vec<String>,
    #[serde(default)]
    period_weight: Option<String>,
    nominal: RawSamples,
    #[serde(default)]
    variations: BTreeMap<String, RawVariation>,
}

/// Inputs for one variation (or for the nominal configuration).
///
/// An empty list of data or simulation paths means that the variation does
/// not affect that part.
#[derive(Debug, Clone, PartialEq)]
pub struct VariationSamples {
    /// Fully qualified paths to data files.
    pub data_paths: Vec<PathBuf>,
    /// Fully qualified paths to simulation files.
    pub sim_paths: Vec<PathBuf>,
    /// Additional weight applied to simulation.
    pub add_weight: Option<WeightExpr>,
}

impl VariationSamples {
    fn from_raw(
        raw: RawSamples,
        directory: &Path,
        eras: &[String],
        period_weight: Option<&str>,
    ) -> Result<Self> {
        let data_paths = qualify_paths(&raw.data, directory, eras)?;
        let sim_paths = qualify_paths(&raw.sim, directory, eras)?;
        let add_weight = raw.add_weight.as_deref().map(WeightExpr::parse).transpose()?;

        if add_weight.is_some() && sim_paths.is_empty() {
            return Err(Error::Config(
                "additional weights can only be specified together with simulation files".into(),
            ));
        }
        if !sim_paths.is_empty() && period_weight.is_none() {
            return Err(Error::Config(
                "when using simulation, a period weight must be specified".into(),
            ));
        }
        Ok(Self { data_paths, sim_paths, add_weight })
    }

    /// Whether data files are given.
    pub fn has_data(&self) -> bool {
        !self.data_paths.is_empty()
    }

    /// Whether simulation files are given.
    pub fn has_sim(&self) -> bool {
        !self.sim_paths.is_empty()
    }
}

/// Expand `{era}` for every era and prepend `directory`.
fn qualify_paths(paths: &[String], directory: &Path, eras: &[String]) -> Result<Vec<PathBuf>> {
    let mut full = Vec::with_capacity(paths.len());
    for path in paths {
        if path.contains(ERA_PLACEHOLDER) {
            if eras.is_empty() {
                return Err(Error::Config(format!(
                    "path \"{path}\" requires a substitution with era label but no eras have been provided"
                )));
            }
            full.extend(eras.iter().map(|era| directory.join(path.replace(ERA_PLACEHOLDER, era))));
        } else {
            full.push(directory.join(path));
        }
    }
    Ok(full)
}

/// Up and down samples of one systematic uncertainty.
#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    /// Samples per direction.
    pub samples: ByDirection<VariationSamples>,
    /// Label for plots.
    pub legend_label: Option<String>,
}

/// Subset of systematic uncertainties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariationGroup {
    /// Variations that affect data.
    Data,
    /// Variations that affect simulation.
    Sim,
    /// All variations.
    #[default]
    All,
}

impl VariationGroup {
    fn accepts(self, variation: &Variation) -> bool {
        match self {
            VariationGroup::Data => variation.samples.up.has_data(),
            VariationGroup::Sim => variation.samples.up.has_sim(),
            VariationGroup::All => true,
        }
    }
}

impl FromStr for VariationGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(VariationGroup::Data),
            "sim" => Ok(VariationGroup::Sim),
            "all" => Ok(VariationGroup::All),
            other => Err(Error::Config(format!("unknown group \"{other}\""))),
        }
    }
}

impl fmt::Display for VariationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VariationGroup::Data => "data",
            VariationGroup::Sim => "sim",
            VariationGroup::All => "all",
        })
    }
}

/// Systematic variations with their input files.
#[derive(Debug, Clone, PartialEq)]
pub struct SystConfig {
    /// Eras used to expand `{era}` in paths.
    pub eras: Vec<String>,
    /// Era label of the period weight applied to simulation.
    pub period_weight: Option<String>,
    /// Nominal samples.
    pub nominal: VariationSamples,
    variations: BTreeMap<String, Variation>,
}

impl SystConfig {
    /// Read a configuration file.
    ///
    /// `era` overrides the list of eras with this single era and also sets the
    /// period weight to it.
    pub fn load(path: &Path, era: Option<&str>) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read systematics configuration {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json, era)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str, era: Option<&str>) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let (eras, period_weight) = match era {
            Some(era) => (vec![era.to_string()], Some(era.to_string())),
            None => (raw.eras, raw.period_weight),
        };
        let directory = PathBuf::from(raw.directory.unwrap_or_default());

        let nominal =
            VariationSamples::from_raw(raw.nominal, &directory, &eras, period_weight.as_deref())?;
        let mut variations = BTreeMap::new();
        for (label, entry) in raw.variations {
            let qualify = |samples| {
                VariationSamples::from_raw(samples, &directory, &eras, period_weight.as_deref())
                    .map_err(|e| Error::Config(format!("variation \"{label}\": {e}")))
            };
            let up = qualify(entry.up)?;
            let down = qualify(entry.down)?;
            variations.insert(
                label.clone(),
                Variation { samples: ByDirection::new(up, down), legend_label: entry.legend_label },
            );
        }

        log::debug!("systematics configuration with {} variations for eras {eras:?}", variations.len());
        Ok(Self { eras, period_weight, nominal, variations })
    }

    /// Period weight label, required for simulation.
    pub fn require_period_weight(&self) -> Result<&str> {
        self.period_weight
            .as_deref()
            .ok_or_else(|| Error::Config("no period weight specified".into()))
    }

    /// Variation with the given label.
    pub fn variation(&self, label: &str) -> Result<&Variation> {
        self.variations
            .get(label)
            .ok_or_else(|| Error::NotFound(format!("systematic variation \"{label}\"")))
    }

    /// Samples of a variation in one direction.
    pub fn samples(&self, label: &str, direction: Direction) -> Result<&VariationSamples> {
        Ok(&self.variation(label)?.samples[direction])
    }

    /// Legend label of a variation, or the label itself if none is given.
    pub fn legend_label<'a>(&'a self, label: &'a str) -> &'a str {
        self.variations.get(label).and_then(|v| v.legend_label.as_deref()).unwrap_or(label)
    }

    /// Labels of all variations.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.variations.keys().map(String::as_str)
    }

    /// Labels of variations in the given group.
    pub fn iter_group(&self, group: VariationGroup) -> impl Iterator<Item = &str> {
        self.variations.iter().filter(move |(_, v)| group.accepts(v)).map(|(k, _)| k.as_str())
    }

    /// Number of variations.
    pub fn len(&self) -> usize {
        self.variations.len()
    }

    /// Whether no variations are defined.
    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "directory": "/store",
        "eras": ["B", "C"],
        "period_weight": "BC",
        "nominal": {"data": ["data_{era}.json"], "sim": ["sim.json"]},
        "variations": {
            "JER": {
                "up": {"sim": ["jer_up.json"], "add_weight": "WeightJER*2"},
                "down": {"sim": ["jer_down.json"]},
                "legend_label": "Jet energy resolution"
            },
            "L1Res": {
                "up": {"data": ["l1_up_{era}.json"]},
                "down": {"data": ["l1_down_{era}.json"]}
            }
        }
    }"#;

    #[test]
    fn paths_are_expanded_and_qualified() {
        let cfg = SystConfig::from_json_str(CONFIG, None).unwrap();
        assert_eq!(
            cfg.nominal.data_paths,
            vec![PathBuf::from("/store/data_B.json"), PathBuf::from("/store/data_C.json")]
        );
        assert_eq!(cfg.nominal.sim_paths, vec![PathBuf::from("/store/sim.json")]);
        assert_eq!(cfg.period_weight.as_deref(), Some("BC"));
        let jer = cfg.samples("JER", Direction::Up).unwrap();
        assert_eq!(jer.add_weight.as_ref().unwrap().required_columns(), vec!["WeightJER"]);
    }

    #[test]
    fn era_override_replaces_eras_and_period_weight() {
        let cfg = SystConfig::from_json_str(CONFIG, Some("D")).unwrap();
        assert_eq!(cfg.eras, vec!["D"]);
        assert_eq!(cfg.require_period_weight().unwrap(), "D");
        assert_eq!(cfg.nominal.data_paths, vec![PathBuf::from("/store/data_D.json")]);
    }

    #[test]
    fn groups_and_labels() {
        let cfg = SystConfig::from_json_str(CONFIG, None).unwrap();
        assert_eq!(cfg.iter_group(VariationGroup::Sim).collect::<Vec<_>>(), vec!["JER"]);
        assert_eq!(cfg.iter_group(VariationGroup::Data).collect::<Vec<_>>(), vec!["L1Res"]);
        assert_eq!(cfg.iter_group(VariationGroup::All).count(), 2);
        assert_eq!(cfg.legend_label("JER"), "Jet energy resolution");
        assert_eq!(cfg.legend_label("L1Res"), "L1Res");
        assert!(matches!(cfg.variation("PU"), Err(Error::NotFound(_))));
        assert_eq!("sim".parse::<VariationGroup>().unwrap(), VariationGroup::Sim);
        assert!("mc".parse::<VariationGroup>().is_err());
    }

    #[test]
    fn era_placeholder_without_eras_fails() {
        let json = r#"{"nominal": {"data": ["data_{era}.json"]}}"#;
        assert!(matches!(SystConfig::from_json_str(json, None), Err(Error::Config(_))));
    }

    #[test]
    fn weight_requires_simulation() {
        let json = r#"{"period_weight": "B", "nominal": {"data": ["d.json"], "add_weight": "W"}}"#;
        assert!(matches!(SystConfig::from_json_str(json, None), Err(Error::Config(_))));
    }

    #[test]
    fn simulation_requires_period_weight() {
        let json = r#"{"nominal": {"sim": ["s.json"]}}"#;
        assert!(matches!(SystConfig::from_json_str(json, None), Err(Error::Config(_))));
        let data_only = r#"{"period_weight": "B", "nominal": {"data": ["d.json"]}}"#;
        let cfg = SystConfig::from_json_str(data_only, None).unwrap();
        assert!(cfg.is_empty());
        assert_eq!(cfg.nominal.data_paths, vec![PathBuf::from("d.json")]);
    }
}
