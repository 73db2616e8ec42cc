use std::sync::Arc;

use rayon::prelude::*;

use crate::compare::Comparator;
use crate::config::{ensure_unit, FeatureConfig};
use crate::error::LinkError;
use crate::model::{CandidatePair, FeatureVector, NormalizedRecord, Side};

struct FeatureSpec {
    left_field: String,
    right_field: String,
    comparator: Arc<dyn Comparator>,
    threshold: Option<f64>,
    missing_value: f64,
}

impl FeatureSpec {
    fn evaluate(&self, name: &str, left: &str, right: &str) -> f64 {
        if left.is_empty() || right.is_empty() {
            return self.missing_value;
        }
        let raw = self.comparator.compare(left, right);
        let value = if raw.is_nan() {
            log::debug!("feature '{name}': comparator returned NaN, using 0.0");
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        };
        match self.threshold {
            Some(t) if value >= t => 1.0,
            Some(_) => 0.0,
            None => value,
        }
    }
}

/// Computes one fixed-order [`FeatureVector`] per candidate pair.
pub struct FeatureBuilder {
    names: Arc<[String]>,
    specs: Vec<FeatureSpec>,
}

impl std::fmt::Debug for FeatureBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureBuilder")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl FeatureBuilder {
    /// One feature per config entry, in config order, each using its
    /// configured stock similarity method. `threshold` and `missing_value`
    /// must lie in [0,1] so every built vector does too.
    pub fn from_config(features: &[FeatureConfig]) -> Result<Self, LinkError> {
        for f in features {
            if let Some(threshold) = f.threshold {
                ensure_unit(&format!("features.{}.threshold", f.name), threshold)?;
            }
            ensure_unit(&format!("features.{}.missing_value", f.name), f.missing_value)?;
        }
        let names: Vec<String> = features.iter().map(|f| f.name.clone()).collect();
        let specs = features
            .iter()
            .map(|f| FeatureSpec {
                left_field: f.field_for(Side::Left).to_string(),
                right_field: f.field_for(Side::Right).to_string(),
                comparator: Arc::new(f.method),
                threshold: f.threshold,
                missing_value: f.missing_value,
            })
            .collect();
        Ok(Self {
            names: names.into(),
            specs,
        })
    }

    /// Replace the comparator of a configured feature.
    pub fn with_comparator(
        mut self,
        feature: &str,
        comparator: impl Comparator + 'static,
    ) -> Result<Self, LinkError> {
        let index = self
            .names
            .iter()
            .position(|n| n == feature)
            .ok_or_else(|| LinkError::Configuration(format!("unknown feature '{feature}'")))?;
        self.specs[index].comparator = Arc::new(comparator);
        Ok(self)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn build(&self, left: &NormalizedRecord, right: &NormalizedRecord) -> FeatureVector {
        let values = self
            .names
            .iter()
            .zip(&self.specs)
            .map(|(name, spec)| {
                spec.evaluate(name, left.field(&spec.left_field), right.field(&spec.right_field))
            })
            .collect();
        FeatureVector::from_trusted(self.names.clone(), values)
    }

    /// Pair indices must be valid positions in `left` and `right`.
    pub fn build_pair(
        &self,
        pair: CandidatePair,
        left: &[NormalizedRecord],
        right: &[NormalizedRecord],
    ) -> FeatureVector {
        self.build(&left[pair.left], &right[pair.right])
    }

    /// One vector per pair, computed in parallel, returned in pair order.
    pub fn build_all(
        &self,
        pairs: &[CandidatePair],
        left: &[NormalizedRecord],
        right: &[NormalizedRecord],
    ) -> Vec<FeatureVector> {
        pairs
            .par_iter()
            .map(|&pair| self.build_pair(pair, left, right))
            .collect()
    }
}
