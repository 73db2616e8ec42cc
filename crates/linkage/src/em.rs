//! Unsupervised Fellegi-Sunter classifier fitted by Expectation-Maximization.
//!
//! Features are assumed conditionally independent given the latent match
//! status. A continuous feature value `x` in [0,1] contributes
//! `x·ln(m) + (1-x)·ln(1-m)` to the match log-likelihood (and the same with
//! `u` for non-matches): a linear interpolation between the Bernoulli
//! agreement and disagreement terms, exact Bernoulli when `x` is 0 or 1.
//!
//! The loop always terminates at `max_iterations`. EM only finds a local
//! optimum; callers should check [`EmFit::converged`].

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;

use crate::decision::Thresholds;
use crate::error::{ensure_finite, LinkError};
use crate::model::{Decision, EmFit, EmParameters, FeatureParameters, FeatureVector};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceCriterion {
    /// Stop when the data log-likelihood changes by less than the tolerance.
    #[default]
    LogLikelihood,
    /// Stop when the prior changes by less than the tolerance.
    Prior,
}

/// Starting m/u for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct InitialGuess {
    pub m: f64,
    pub u: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Initial fraction of candidate pairs assumed to be matches.
    pub prior: f64,
    /// Initial m for every feature without an override.
    pub m: f64,
    /// Initial u for every feature without an override.
    pub u: f64,
    pub initial: BTreeMap<String, InitialGuess>,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub criterion: ConvergenceCriterion,
    /// m and u are held inside [clip_min, clip_max].
    pub clip_min: f64,
    pub clip_max: f64,
    /// Distance the prior is kept from 0 and 1 before taking logarithms.
    pub epsilon: f64,
    /// Turn every feature into a boolean (value >= binarize) before fitting.
    pub binarize: Option<f64>,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            prior: 0.1,
            m: 0.9,
            u: 0.1,
            initial: BTreeMap::new(),
            tolerance: 1e-6,
            max_iterations: 100,
            criterion: ConvergenceCriterion::LogLikelihood,
            clip_min: 0.001,
            clip_max: 0.999,
            epsilon: 1e-10,
            binarize: None,
        }
    }
}

impl EmConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        ensure_open_unit("probabilistic.prior", self.prior)?;
        validate_guess("probabilistic", self.m, self.u)?;
        for (name, guess) in &self.initial {
            validate_guess(&format!("probabilistic.initial.{name}"), guess.m, guess.u)?;
        }

        ensure_finite("probabilistic.tolerance", self.tolerance)?;
        if self.tolerance <= 0.0 {
            return Err(LinkError::Configuration(
                "probabilistic.tolerance must be positive".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(LinkError::Configuration(
                "probabilistic.max_iterations must be at least 1".into(),
            ));
        }

        ensure_finite("probabilistic.clip_min", self.clip_min)?;
        ensure_finite("probabilistic.clip_max", self.clip_max)?;
        if !(0.0 < self.clip_min && self.clip_min < self.clip_max && self.clip_max < 1.0) {
            return Err(LinkError::Configuration(format!(
                "probabilistic clip range must satisfy 0 < {} < {} < 1",
                self.clip_min, self.clip_max
            )));
        }

        ensure_finite("probabilistic.epsilon", self.epsilon)?;
        if !(self.epsilon > 0.0 && self.epsilon < 0.5) {
            return Err(LinkError::Configuration(format!(
                "probabilistic.epsilon must be within (0, 0.5), got {}",
                self.epsilon
            )));
        }

        if let Some(binarize) = self.binarize {
            crate::config::ensure_unit("probabilistic.binarize", binarize)?;
        }
        Ok(())
    }
}

fn ensure_open_unit(name: &str, value: f64) -> Result<(), LinkError> {
    ensure_finite(name, value)?;
    if value <= 0.0 || value >= 1.0 {
        return Err(LinkError::Configuration(format!(
            "{name} must be within (0, 1), got {value}"
        )));
    }
    Ok(())
}

/// Matches are assumed to agree more often than non-matches.
fn validate_guess(prefix: &str, m: f64, u: f64) -> Result<(), LinkError> {
    ensure_open_unit(&format!("{prefix}.m"), m)?;
    ensure_open_unit(&format!("{prefix}.u"), u)?;
    if m <= u {
        return Err(LinkError::Configuration(format!(
            "{prefix}: initial m ({m}) must exceed u ({u})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parameter state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct State {
    prior: f64,
    m: Vec<f64>,
    u: Vec<f64>,
}

impl State {
    /// Joint log-densities (match, non-match) of one pair.
    fn log_terms(&self, x: &[f64], epsilon: f64) -> (f64, f64) {
        let p = self.prior.clamp(epsilon, 1.0 - epsilon);
        let mut log_m = p.ln();
        let mut log_u = (1.0 - p).ln();
        for ((&xk, &mk), &uk) in x.iter().zip(&self.m).zip(&self.u) {
            log_m += xk * mk.ln() + (1.0 - xk) * (1.0 - mk).ln();
            log_u += xk * uk.ln() + (1.0 - xk) * (1.0 - uk).ln();
        }
        (log_m, log_u)
    }

    /// Posterior match probability and the pair's log marginal likelihood.
    fn posterior(&self, x: &[f64], epsilon: f64) -> (f64, f64) {
        let (log_m, log_u) = self.log_terms(x, epsilon);
        let hi = log_m.max(log_u);
        let log_total = hi + ((log_m - hi).exp() + (log_u - hi).exp()).ln();
        ((log_m - log_total).exp().clamp(0.0, 1.0), log_total)
    }

    /// Swap the classes when the fitted "match" class agrees less than the
    /// "non-match" class on balance. Returns whether a swap happened.
    fn orient(&mut self) -> bool {
        let margin: f64 = self.m.iter().zip(&self.u).map(|(m, u)| m - u).sum();
        if margin >= 0.0 {
            return false;
        }
        self.prior = 1.0 - self.prior;
        std::mem::swap(&mut self.m, &mut self.u);
        true
    }
}

fn e_step(state: &State, data: &[Vec<f64>], epsilon: f64) -> (Vec<f64>, f64) {
    let terms: Vec<(f64, f64)> = data
        .par_iter()
        .map(|x| state.posterior(x, epsilon))
        .collect();
    // Sequential sum keeps repeated fits bit-identical.
    let log_likelihood = terms.iter().map(|(_, ll)| ll).sum();
    let posteriors = terms.into_iter().map(|(post, _)| post).collect();
    (posteriors, log_likelihood)
}

/// Re-estimate the state from posteriors. Returns indices of features whose
/// m or u had to be clipped.
fn m_step(state: &mut State, data: &[Vec<f64>], posteriors: &[f64], config: &EmConfig) -> Vec<usize> {
    let n = data.len() as f64;
    let match_mass: f64 = posteriors.iter().sum();
    let non_match_mass: f64 = posteriors.iter().map(|p| 1.0 - p).sum();
    state.prior = (match_mass / n).clamp(0.0, 1.0);

    let mut clipped = Vec::new();
    for k in 0..state.m.len() {
        let mut agree_m = 0.0;
        let mut agree_u = 0.0;
        for (x, &post) in data.iter().zip(posteriors) {
            agree_m += post * x[k];
            agree_u += (1.0 - post) * x[k];
        }
        // A class with no mass keeps its previous estimate.
        let raw_m = if match_mass > 0.0 { agree_m / match_mass } else { state.m[k] };
        let raw_u = if non_match_mass > 0.0 { agree_u / non_match_mass } else { state.u[k] };

        state.m[k] = raw_m.clamp(config.clip_min, config.clip_max);
        state.u[k] = raw_u.clamp(config.clip_min, config.clip_max);
        if state.m[k] != raw_m || state.u[k] != raw_u {
            clipped.push(k);
        }
    }
    clipped
}

fn check_consistent(vectors: &[FeatureVector]) -> Result<&FeatureVector, LinkError> {
    let first = vectors.first().ok_or_else(|| {
        LinkError::EmptyInput("EM fit needs at least one feature vector".into())
    })?;
    if first.is_empty() {
        return Err(LinkError::Configuration(
            "feature vectors carry no features".into(),
        ));
    }
    for (index, vector) in vectors.iter().enumerate().skip(1) {
        if !vector.same_features(first) {
            return Err(LinkError::InconsistentFeatures {
                index,
                expected: first.names().join(", "),
                found: vector.names().join(", "),
            });
        }
    }
    Ok(first)
}

fn prepare(values: &[f64], binarize: Option<f64>) -> Vec<f64> {
    match binarize {
        Some(t) => values.iter().map(|&v| if v >= t { 1.0 } else { 0.0 }).collect(),
        None => values.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Frozen model
// ---------------------------------------------------------------------------

/// Parameters frozen at the end of a fit.
#[derive(Debug, Clone)]
pub struct EmModel {
    names: Arc<[String]>,
    state: State,
    epsilon: f64,
    binarize: Option<f64>,
    fit: EmFit,
}

impl EmModel {
    pub fn parameters(&self) -> EmParameters {
        EmParameters {
            prior: self.state.prior,
            features: self
                .names
                .iter()
                .zip(self.state.m.iter().zip(&self.state.u))
                .map(|(name, (&m, &u))| FeatureParameters {
                    name: name.clone(),
                    m,
                    u,
                })
                .collect(),
        }
    }

    pub fn fit_report(&self) -> &EmFit {
        &self.fit
    }

    pub fn feature_names(&self) -> &[String] {
        &self.names
    }

    /// Posterior match probability of one vector.
    pub fn prob(&self, vector: &FeatureVector) -> Result<f64, LinkError> {
        if vector.names() != &*self.names {
            return Err(LinkError::Configuration(format!(
                "vector features [{}] differ from fitted features [{}]",
                vector.names().join(", "),
                self.names.join(", ")
            )));
        }
        let x = prepare(vector.values(), self.binarize);
        Ok(self.state.posterior(&x, self.epsilon).0)
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Owns one EM fit. Not shared between concurrent fits.
#[derive(Debug, Clone)]
pub struct EmClassifier {
    config: EmConfig,
    model: Option<EmModel>,
}

impl EmClassifier {
    pub fn new(config: EmConfig) -> Result<Self, LinkError> {
        config.validate()?;
        Ok(Self {
            config,
            model: None,
        })
    }

    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Result<&EmModel, LinkError> {
        self.model.as_ref().ok_or(LinkError::NotFitted)
    }

    /// Estimate prior, m and u from unlabeled vectors. Refitting replaces
    /// any previous model.
    pub fn fit(&mut self, vectors: &[FeatureVector]) -> Result<&EmModel, LinkError> {
        let first = check_consistent(vectors)?;
        let names: Arc<[String]> = first.names().to_vec().into();
        let config = &self.config;

        let data: Vec<Vec<f64>> = vectors
            .iter()
            .map(|v| prepare(v.values(), config.binarize))
            .collect();

        let mut state = State {
            prior: config.prior,
            m: Vec::with_capacity(names.len()),
            u: Vec::with_capacity(names.len()),
        };
        for name in names.iter() {
            let guess = config.initial.get(name).copied().unwrap_or(InitialGuess {
                m: config.m,
                u: config.u,
            });
            state.m.push(guess.m.clamp(config.clip_min, config.clip_max));
            state.u.push(guess.u.clamp(config.clip_min, config.clip_max));
        }

        let mut previous_ll: Option<f64> = None;
        let mut converged = false;
        let mut iterations = 0;
        let mut clipped = Vec::new();

        while iterations < config.max_iterations {
            iterations += 1;
            let (posteriors, ll) = e_step(&state, &data, config.epsilon);

            if config.criterion == ConvergenceCriterion::LogLikelihood {
                if let Some(previous) = previous_ll {
                    if (ll - previous).abs() < config.tolerance {
                        converged = true;
                        break;
                    }
                }
                previous_ll = Some(ll);
            }

            let previous_prior = state.prior;
            clipped = m_step(&mut state, &data, &posteriors, config);
            log::debug!(
                "em iteration {iterations}: log-likelihood {ll:.6}, prior {:.6}",
                state.prior
            );

            if config.criterion == ConvergenceCriterion::Prior
                && (state.prior - previous_prior).abs() < config.tolerance
            {
                converged = true;
                break;
            }
        }

        let labels_swapped = state.orient();
        let (_, log_likelihood) = e_step(&state, &data, config.epsilon);

        if !converged {
            log::warn!(
                "em did not converge within {} iterations; returning last parameters",
                config.max_iterations
            );
        }
        let clipped: Vec<String> = clipped.into_iter().map(|k| names[k].clone()).collect();
        if !clipped.is_empty() {
            log::warn!("em clipped degenerate parameters for: {}", clipped.join(", "));
        }
        if labels_swapped {
            log::debug!("em classes swapped so that matches agree more than non-matches");
        }

        let fit = EmFit {
            iterations,
            converged,
            log_likelihood,
            clipped,
            labels_swapped,
        };
        Ok(self.model.insert(EmModel {
            names,
            state,
            epsilon: config.epsilon,
            binarize: config.binarize,
            fit,
        }))
    }

    pub fn prob(&self, vector: &FeatureVector) -> Result<f64, LinkError> {
        self.model()?.prob(vector)
    }

    pub fn probs(&self, vectors: &[FeatureVector]) -> Result<Vec<f64>, LinkError> {
        let model = self.model()?;
        vectors.iter().map(|v| model.prob(v)).collect()
    }

    /// Two-way decision: match iff the posterior reaches `threshold`.
    pub fn predict(&self, vector: &FeatureVector, threshold: f64) -> Result<Decision, LinkError> {
        ensure_finite("threshold", threshold)?;
        let p = self.prob(vector)?;
        Ok(if p >= threshold {
            Decision::Match
        } else {
            Decision::NonMatch
        })
    }

    /// Three-way decision over the posterior, same policy as the weighted path.
    pub fn predict_banded(
        &self,
        vector: &FeatureVector,
        thresholds: &Thresholds,
    ) -> Result<Decision, LinkError> {
        thresholds.validate()?;
        Ok(thresholds.decide(self.prob(vector)?))
    }
}
