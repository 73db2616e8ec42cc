use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::compare::SimilarityMethod;
use crate::decision::{default_weights, Thresholds, DEFAULT_MATCH_THRESHOLD, DEFAULT_POSSIBLE_THRESHOLD};
use crate::em::EmConfig;
use crate::error::{ensure_finite, LinkError};
use crate::model::Side;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub blocking: Vec<BlockingKeyConfig>,
    pub features: Vec<FeatureConfig>,
    #[serde(default)]
    pub deterministic: DeterministicConfig,
    #[serde(default)]
    pub probabilistic: ProbabilisticConfig,
}

fn default_name() -> String {
    "linkage".to_string()
}

/// Year-of-birth blocking and first/last/city Jaro-Winkler features, scored
/// by the default weights. The probabilistic path is off.
impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            blocking: vec![BlockingKeyConfig {
                name: "yob".into(),
                field: "dob".into(),
                right_field: None,
                kind: KeyKind::Year,
                length: None,
            }],
            features: ["first", "last", "city"]
                .iter()
                .map(|field| FeatureConfig {
                    name: format!("sim_{field}"),
                    field: (*field).into(),
                    right_field: None,
                    method: SimilarityMethod::JaroWinkler,
                    threshold: None,
                    missing_value: 0.0,
                })
                .collect(),
            deterministic: DeterministicConfig::default(),
            probabilistic: ProbabilisticConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BlockingKeyConfig {
    pub name: String,
    pub field: String,
    /// Field to read on the right dataset when it differs from `field`.
    #[serde(default)]
    pub right_field: Option<String>,
    #[serde(default)]
    pub kind: KeyKind,
    /// Prefix length in characters (`kind = "prefix"` only).
    #[serde(default)]
    pub length: Option<usize>,
}

impl BlockingKeyConfig {
    pub fn field_for(&self, side: Side) -> &str {
        match (side, &self.right_field) {
            (Side::Right, Some(field)) => field,
            _ => &self.field,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Year component of a date.
    Year,
    /// Whole canonical value.
    #[default]
    Exact,
    /// First `length` characters of the canonical value.
    Prefix,
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    pub field: String,
    #[serde(default)]
    pub right_field: Option<String>,
    #[serde(default)]
    pub method: SimilarityMethod,
    /// When set, similarity >= threshold becomes 1.0, anything else 0.0.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Value used when either side is empty.
    #[serde(default)]
    pub missing_value: f64,
}

impl FeatureConfig {
    pub fn field_for(&self, side: Side) -> &str {
        match (side, &self.right_field) {
            (Side::Right, Some(field)) => field,
            _ => &self.field,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeterministicConfig {
    pub enabled: bool,
    pub weights: BTreeMap<String, f64>,
    pub match_threshold: f64,
    pub possible_threshold: f64,
}

impl Default for DeterministicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: default_weights(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            possible_threshold: DEFAULT_POSSIBLE_THRESHOLD,
        }
    }
}

impl DeterministicConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            match_threshold: self.match_threshold,
            possible_threshold: self.possible_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbabilisticConfig {
    pub enabled: bool,
    /// Posterior at or above which a pair is a match.
    pub threshold: f64,
    /// Lower edge of the possible band; `None` keeps the decision two-way.
    pub possible_threshold: Option<f64>,
    #[serde(flatten)]
    pub em: EmConfig,
}

impl Default for ProbabilisticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.5,
            possible_threshold: None,
            em: EmConfig::default(),
        }
    }
}

impl ProbabilisticConfig {
    /// Decision bands for posteriors. Without a possible band both cut
    /// points coincide, so `decide` never returns `Possible`.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            match_threshold: self.threshold,
            possible_threshold: self.possible_threshold.unwrap_or(self.threshold),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl LinkConfig {
    pub fn from_toml(input: &str) -> Result<Self, LinkError> {
        let config: LinkConfig =
            toml::from_str(input).map_err(|e| LinkError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.blocking.is_empty() {
            return Err(LinkError::Configuration(
                "at least one blocking key is required".into(),
            ));
        }
        if self.features.is_empty() {
            return Err(LinkError::Configuration(
                "at least one feature is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for key in &self.blocking {
            if !seen.insert(key.name.as_str()) {
                return Err(LinkError::Configuration(format!(
                    "duplicate blocking key '{}'",
                    key.name
                )));
            }
            match (key.kind, key.length) {
                (KeyKind::Prefix, Some(length)) if length > 0 => {}
                (KeyKind::Prefix, _) => {
                    return Err(LinkError::Configuration(format!(
                        "blocking key '{}': prefix requires a positive length",
                        key.name
                    )));
                }
                _ => {}
            }
        }

        let mut seen = HashSet::new();
        for feature in &self.features {
            if !seen.insert(feature.name.as_str()) {
                return Err(LinkError::Configuration(format!(
                    "duplicate feature '{}'",
                    feature.name
                )));
            }
            if let Some(threshold) = feature.threshold {
                ensure_unit(&format!("features.{}.threshold", feature.name), threshold)?;
            }
            ensure_unit(
                &format!("features.{}.missing_value", feature.name),
                feature.missing_value,
            )?;
        }

        for (name, &weight) in &self.deterministic.weights {
            ensure_finite(&format!("deterministic.weights.{name}"), weight)?;
            if !seen.contains(name.as_str()) {
                log::warn!("weight '{name}' names no configured feature and contributes nothing");
            }
        }
        self.deterministic.thresholds().validate()?;

        self.probabilistic.thresholds().validate()?;
        ensure_unit("probabilistic.threshold", self.probabilistic.threshold)?;
        self.probabilistic.em.validate()?;
        for name in self.probabilistic.em.initial.keys() {
            if !seen.contains(name.as_str()) {
                return Err(LinkError::Configuration(format!(
                    "probabilistic.initial names unknown feature '{name}'"
                )));
            }
        }

        Ok(())
    }
}

/// Finite and inside [0,1].
pub(crate) fn ensure_unit(name: &str, value: f64) -> Result<(), LinkError> {
    ensure_finite(name, value)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(LinkError::Configuration(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
