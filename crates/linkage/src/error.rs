use thiserror::Error;

/// Coarse classification of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or configuration. Surfaced immediately, never recovered.
    Configuration,
    /// Operation invoked in the wrong lifecycle state.
    State,
}

#[derive(Debug, Error)]
pub enum LinkError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (duplicate names, bad ranges, etc.).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An operation received no data to work on.
    #[error("empty input: {0}")]
    EmptyInput(String),
    /// Feature vectors in one run disagree on their feature set.
    #[error("inconsistent feature set at vector {index}: expected [{expected}], found [{found}]")]
    InconsistentFeatures {
        index: usize,
        expected: String,
        found: String,
    },
    /// A weight, threshold or parameter is NaN or infinite.
    #[error("'{name}' must be finite, got {value}")]
    NonFinite { name: String, value: f64 },
    /// match_threshold < possible_threshold, or a negative threshold.
    #[error(
        "thresholds must satisfy match ({match_threshold}) >= possible ({possible_threshold}) >= 0"
    )]
    ThresholdOrder {
        match_threshold: f64,
        possible_threshold: f64,
    },
    /// A feature value outside [0,1].
    #[error("feature '{feature}' value {value} is outside [0, 1]")]
    FeatureValue { feature: String, value: f64 },
    /// Two records in the same dataset share an id.
    #[error("{side} dataset: duplicate record id '{id}'")]
    DuplicateRecordId { side: String, id: String },
    /// Probabilistic model queried before `fit`.
    #[error("probabilistic model has not been fitted")]
    NotFitted,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFitted => ErrorKind::State,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Reject NaN / infinite configuration values.
pub(crate) fn ensure_finite(name: &str, value: f64) -> Result<(), LinkError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(LinkError::NonFinite {
            name: name.to_string(),
            value,
        })
    }
}
