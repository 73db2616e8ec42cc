use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::LinkError;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A single raw row from one of the two datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter. `None` marks the value as absent.
    pub fn with<V: Into<String>>(mut self, field: &str, value: Option<V>) -> Self {
        self.fields.insert(field.to_string(), value.map(Into::into));
        self
    }

    /// Raw value, `None` when the field is missing or null.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }
}

/// Which dataset a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Derived blocking key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum BlockKey {
    Int(i64),
    Text(String),
}

/// Canonicalized view of a [`Record`]. Missing values are empty strings,
/// failed derivations are `None` keys.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    pub fields: BTreeMap<String, String>,
    pub keys: BTreeMap<String, Option<BlockKey>>,
}

impl NormalizedRecord {
    /// Canonical value of a field; empty when absent.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    /// Derived key by name; `None` for null or unknown keys.
    pub fn key(&self, name: &str) -> Option<&BlockKey> {
        self.keys.get(name).and_then(Option::as_ref)
    }
}

// ---------------------------------------------------------------------------
// Pairs + features
// ---------------------------------------------------------------------------

/// Candidate pair as positions into the left and right normalized datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidatePair {
    pub left: usize,
    pub right: usize,
}

impl CandidatePair {
    pub fn new(left: usize, right: usize) -> Self {
        Self { left, right }
    }
}

/// Fixed-order feature values for one candidate pair.
///
/// The name list is shared between all vectors produced by one builder, so
/// the consistency check in the EM estimator is usually a pointer compare.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    names: Arc<[String]>,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Every value must be finite and inside [0,1].
    pub fn new(names: Arc<[String]>, values: Vec<f64>) -> Result<Self, LinkError> {
        if names.len() != values.len() {
            return Err(LinkError::Configuration(format!(
                "feature vector has {} names but {} values",
                names.len(),
                values.len()
            )));
        }
        for (name, &value) in names.iter().zip(&values) {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(LinkError::FeatureValue {
                    feature: name.clone(),
                    value,
                });
            }
        }
        Ok(Self { names, values })
    }

    /// Caller guarantees matching lengths and values inside [0,1].
    pub(crate) fn from_trusted(names: Arc<[String]>, values: Vec<f64>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self { names, values }
    }

    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Result<Self, LinkError> {
        let (names, values): (Vec<String>, Vec<f64>) = pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .unzip();
        Self::new(names.into(), values)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Same feature names in the same order.
    pub fn same_features(&self, other: &FeatureVector) -> bool {
        Arc::ptr_eq(&self.names, &other.names) || self.names == other.names
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.names.iter().zip(&self.values) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "match")]
    Match,
    #[serde(rename = "possible")]
    Possible,
    #[serde(rename = "non-match")]
    NonMatch,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Match => write!(f, "match"),
            Self::Possible => write!(f, "possible"),
            Self::NonMatch => write!(f, "non-match"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    #[serde(rename = "match")]
    pub matches: usize,
    pub possible: usize,
    #[serde(rename = "non-match")]
    pub non_matches: usize,
}

impl DecisionCounts {
    pub fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Match => self.matches += 1,
            Decision::Possible => self.possible += 1,
            Decision::NonMatch => self.non_matches += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.matches + self.possible + self.non_matches
    }

    pub fn get(&self, decision: Decision) -> usize {
        match decision {
            Decision::Match => self.matches,
            Decision::Possible => self.possible,
            Decision::NonMatch => self.non_matches,
        }
    }
}

impl FromIterator<Decision> for DecisionCounts {
    fn from_iter<I: IntoIterator<Item = Decision>>(iter: I) -> Self {
        let mut counts = Self::default();
        for decision in iter {
            counts.record(decision);
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// EM parameters
// ---------------------------------------------------------------------------

/// Per-feature Fellegi-Sunter parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureParameters {
    pub name: String,
    /// P(feature agrees | match).
    pub m: f64,
    /// P(feature agrees | non-match).
    pub u: f64,
}

impl FeatureParameters {
    /// log2(m/u): evidence added by full agreement.
    pub fn agreement_weight(&self) -> f64 {
        (self.m / self.u).log2()
    }

    /// log2((1-m)/(1-u)): evidence added by full disagreement.
    pub fn disagreement_weight(&self) -> f64 {
        ((1.0 - self.m) / (1.0 - self.u)).log2()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmParameters {
    /// Fraction of candidate pairs that are true matches.
    pub prior: f64,
    pub features: Vec<FeatureParameters>,
}

/// Outcome of one EM fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmFit {
    pub iterations: usize,
    pub converged: bool,
    pub log_likelihood: f64,
    /// Features whose m or u was held at a clip bound after the last M-step.
    pub clipped: Vec<String>,
    /// The fitted classes were swapped so that m > u on balance.
    pub labels_swapped: bool,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LinkRow {
    pub left_id: String,
    pub right_id: String,
    #[serde(skip)]
    pub pair: CandidatePair,
    pub features: FeatureVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilistic_decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub total_pairs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deterministic: Option<DecisionCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilistic: Option<DecisionCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMeta {
    pub config_name: String,
    pub engine_version: String,
    pub run_at: String,
    pub left_records: usize,
    pub right_records: usize,
    pub candidate_pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmReport {
    pub parameters: EmParameters,
    pub fit: EmFit,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub meta: LinkMeta,
    pub summary: LinkSummary,
    pub rows: Vec<LinkRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub em: Option<EmReport>,
}
