use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{ensure_finite, LinkError};
use crate::model::{Decision, FeatureVector};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.85;
pub const DEFAULT_POSSIBLE_THRESHOLD: f64 = 0.75;

/// Default feature weights: last name dominant, city minor.
pub fn default_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("sim_last".to_string(), 0.6),
        ("sim_first".to_string(), 0.3),
        ("sim_city".to_string(), 0.1),
    ])
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Two ordered cut points splitting the score line into three bands.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    pub match_threshold: f64,
    pub possible_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            possible_threshold: DEFAULT_POSSIBLE_THRESHOLD,
        }
    }
}

impl Thresholds {
    pub fn new(match_threshold: f64, possible_threshold: f64) -> Result<Self, LinkError> {
        let thresholds = Self {
            match_threshold,
            possible_threshold,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        ensure_finite("match_threshold", self.match_threshold)?;
        ensure_finite("possible_threshold", self.possible_threshold)?;
        if self.match_threshold < self.possible_threshold || self.possible_threshold < 0.0 {
            return Err(LinkError::ThresholdOrder {
                match_threshold: self.match_threshold,
                possible_threshold: self.possible_threshold,
            });
        }
        Ok(())
    }

    pub fn decide(&self, score: f64) -> Decision {
        decide(score, self.match_threshold, self.possible_threshold)
    }
}

/// Map a score to a decision.
///
/// `score >= match_t` is a match, `possible_t <= score < match_t` is possible,
/// anything lower (including NaN) is a non-match.
pub fn decide(score: f64, match_t: f64, possible_t: f64) -> Decision {
    if score >= match_t {
        Decision::Match
    } else if score >= possible_t {
        Decision::Possible
    } else {
        Decision::NonMatch
    }
}

// ---------------------------------------------------------------------------
// Weighted sum
// ---------------------------------------------------------------------------

/// Σ weight_k · feature_k. Weights naming a feature the vector lacks add 0.
pub fn score(vector: &FeatureVector, weights: &BTreeMap<String, f64>) -> f64 {
    weights
        .iter()
        .map(|(name, weight)| weight * vector.get(name).unwrap_or(0.0))
        .sum()
}

/// Weighted-sum scorer with fixed thresholds.
#[derive(Debug, Clone)]
pub struct DeterministicClassifier {
    weights: BTreeMap<String, f64>,
    thresholds: Thresholds,
}

impl Default for DeterministicClassifier {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            thresholds: Thresholds::default(),
        }
    }
}

impl DeterministicClassifier {
    /// Weights need not sum to 1 but each must be finite.
    pub fn new(weights: BTreeMap<String, f64>, thresholds: Thresholds) -> Result<Self, LinkError> {
        for (name, &weight) in &weights {
            ensure_finite(&format!("weights.{name}"), weight)?;
        }
        thresholds.validate()?;
        Ok(Self {
            weights,
            thresholds,
        })
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn score(&self, vector: &FeatureVector) -> f64 {
        score(vector, &self.weights)
    }

    pub fn decide(&self, score: f64) -> Decision {
        self.thresholds.decide(score)
    }

    /// Score and decide in one step.
    pub fn classify(&self, vector: &FeatureVector) -> (f64, Decision) {
        let s = self.score(vector);
        (s, self.decide(s))
    }
}
