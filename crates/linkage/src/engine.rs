use std::collections::HashSet;

use crate::blocking::block_union;
use crate::config::{LinkConfig, ProbabilisticConfig};
use crate::decision::DeterministicClassifier;
use crate::em::EmClassifier;
use crate::error::LinkError;
use crate::features::FeatureBuilder;
use crate::model::{EmReport, FeatureVector, LinkMeta, LinkResult, LinkRow, Record, Side};
use crate::normalize::Normalizer;
use crate::summary::compute_summary;
use crate::sweep::{sweep, SweepRow};

/// Run linkage per config using the configured stock comparators.
pub fn run(
    config: &LinkConfig,
    left: &[Record],
    right: &[Record],
) -> Result<LinkResult, LinkError> {
    let builder = FeatureBuilder::from_config(&config.features)?;
    run_with_builder(config, &builder, left, right)
}

/// Run linkage with a caller-assembled feature builder (custom comparators).
/// The builder must produce exactly the features the config names.
pub fn run_with_builder(
    config: &LinkConfig,
    builder: &FeatureBuilder,
    left: &[Record],
    right: &[Record],
) -> Result<LinkResult, LinkError> {
    config.validate()?;
    if builder.names() != config.feature_names().as_slice() {
        return Err(LinkError::Configuration(format!(
            "feature builder produces [{}] but config names [{}]",
            builder.names().join(", "),
            config.feature_names().join(", ")
        )));
    }
    check_input(left, Side::Left)?;
    check_input(right, Side::Right)?;

    // Normalize
    let left_n = Normalizer::new(&config.blocking, Side::Left).normalize_all(left);
    let right_n = Normalizer::new(&config.blocking, Side::Right).normalize_all(right);

    // Block
    let keys: Vec<&str> = config.blocking.iter().map(|k| k.name.as_str()).collect();
    let pairs = block_union(&left_n, &right_n, &keys);
    log::info!(
        "blocking {} x {} records on [{}]: {} candidate pairs",
        left.len(),
        right.len(),
        keys.join(", "),
        pairs.len()
    );

    // Compare
    let vectors = builder.build_all(&pairs, &left_n, &right_n);

    // Classify
    let deterministic = if config.deterministic.enabled {
        Some(DeterministicClassifier::new(
            config.deterministic.weights.clone(),
            config.deterministic.thresholds(),
        )?)
    } else {
        None
    };

    let (posteriors, em) = if config.probabilistic.enabled {
        run_probabilistic(&config.probabilistic, &vectors)?
    } else {
        (None, None)
    };
    let posterior_bands = config.probabilistic.thresholds();

    let rows: Vec<LinkRow> = pairs
        .iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (&pair, features))| {
            let scored = deterministic.as_ref().map(|clf| clf.classify(&features));
            let probability = posteriors.as_ref().map(|p| p[i]);
            LinkRow {
                left_id: left_n[pair.left].id.clone(),
                right_id: right_n[pair.right].id.clone(),
                pair,
                features,
                score: scored.map(|(s, _)| s),
                decision: scored.map(|(_, d)| d),
                probability,
                probabilistic_decision: probability.map(|p| posterior_bands.decide(p)),
            }
        })
        .collect();

    let summary = compute_summary(&rows, deterministic.is_some(), em.is_some());
    if let Some(counts) = &summary.deterministic {
        log::info!(
            "deterministic: {} match, {} possible, {} non-match",
            counts.matches,
            counts.possible,
            counts.non_matches
        );
    }

    Ok(LinkResult {
        meta: LinkMeta {
            config_name: config.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
            left_records: left.len(),
            right_records: right.len(),
            candidate_pairs: rows.len(),
        },
        summary,
        rows,
        em,
    })
}

/// Posteriors per vector plus the frozen parameters. An empty candidate set
/// skips the fit instead of failing the run.
fn run_probabilistic(
    config: &ProbabilisticConfig,
    vectors: &[FeatureVector],
) -> Result<(Option<Vec<f64>>, Option<EmReport>), LinkError> {
    if vectors.is_empty() {
        log::warn!("no candidate pairs; skipping probabilistic fit");
        return Ok((None, None));
    }
    let mut classifier = EmClassifier::new(config.em.clone())?;
    let model = classifier.fit(vectors)?;
    let report = EmReport {
        parameters: model.parameters(),
        fit: model.fit_report().clone(),
    };
    log::info!(
        "em: prior {:.4} after {} iterations (converged: {})",
        report.parameters.prior,
        report.fit.iterations,
        report.fit.converged
    );
    let posteriors = classifier.probs(vectors)?;
    Ok((Some(posteriors), Some(report)))
}

fn check_input(records: &[Record], side: Side) -> Result<(), LinkError> {
    if records.is_empty() {
        return Err(LinkError::EmptyInput(format!("{side} dataset has no records")));
    }
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(LinkError::DuplicateRecordId {
                side: side.to_string(),
                id: record.id.clone(),
            });
        }
    }
    Ok(())
}

impl LinkResult {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deterministic scores in row order (empty when that path is disabled).
    pub fn scores(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.score).collect()
    }

    /// Posterior match probabilities in row order.
    pub fn probabilities(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.probability).collect()
    }

    /// Threshold sweep over the deterministic scores.
    pub fn sweep_scores(
        &self,
        match_thresholds: &[f64],
        possible_threshold: f64,
    ) -> Result<Vec<SweepRow>, LinkError> {
        sweep(&self.scores(), match_thresholds, possible_threshold)
    }

    /// Rows ordered best first: by score, then posterior, then pair.
    pub fn ranked(&self) -> Vec<&LinkRow> {
        let key = |r: &LinkRow| {
            (
                r.score.unwrap_or(f64::NEG_INFINITY),
                r.probability.unwrap_or(f64::NEG_INFINITY),
            )
        };
        let mut rows: Vec<&LinkRow> = self.rows.iter().collect();
        rows.sort_by(|a, b| {
            let (sa, pa) = key(*a);
            let (sb, pb) = key(*b);
            sb.total_cmp(&sa)
                .then(pb.total_cmp(&pa))
                .then(a.pair.cmp(&b.pair))
        });
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Decision;

    fn person(id: &str, first: &str, last: &str, dob: Option<&str>, city: &str) -> Record {
        Record::new(id)
            .with("first", Some(first))
            .with("last", Some(last))
            .with("dob", dob)
            .with("city", Some(city))
    }

    fn exact_config() -> LinkConfig {
        let mut config = LinkConfig::default();
        for f in &mut config.features {
            f.method = crate::compare::SimilarityMethod::Exact;
        }
        config
    }

    #[test]
    fn identical_records_match() {
        let mut config = exact_config();
        config.deterministic.weights = config
            .feature_names()
            .into_iter()
            .map(|name| (name, 1.0 / 3.0))
            .collect();
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let right = vec![person("12", " anne", "BROWN ", Some("1990-06-30"), "uppsala")];

        let result = run(&config, &left, &right).unwrap();
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_eq!((row.left_id.as_str(), row.right_id.as_str()), ("1", "12"));
        assert!((row.score.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(row.decision, Some(Decision::Match));
        assert!(row.probability.is_none());
        assert!(result.em.is_none());
    }

    #[test]
    fn city_difference_still_matches() {
        let config = exact_config();
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Gothenburg")];
        let right = vec![person("12", "Anne", "Brown", Some("1990-01-01"), "Malmo")];
        let result = run(&config, &left, &right).unwrap();
        let row = &result.rows[0];
        assert_eq!(row.features.get("sim_city"), Some(0.0));
        assert!((row.score.unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(row.decision, Some(Decision::Match));
    }

    #[test]
    fn missing_dob_is_excluded_by_blocking() {
        let left = vec![
            person("1", "Alice", "Andersson", Some("1990-01-01"), "Stockholm"),
            person("2", "Beatrice", "Berg", None, "Uppsala"),
        ];
        let right = vec![
            person("10", "Alicia", "Andersson", Some("1990-01-01"), "Stockholm"),
            person("11", "Bea", "Berg", Some("1985-06-06"), "Uppsala"),
        ];
        let result = run(&LinkConfig::default(), &left, &right).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].left_id, "1");
        assert_eq!(result.meta.candidate_pairs, 1);
    }

    #[test]
    fn no_candidate_pairs_skips_em() {
        let mut config = LinkConfig::default();
        config.probabilistic.enabled = true;
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let right = vec![person("10", "Anne", "Brown", Some("1991-01-01"), "Uppsala")];
        let result = run(&config, &left, &right).unwrap();
        assert!(result.rows.is_empty());
        assert!(result.em.is_none());
        assert_eq!(result.summary.total_pairs, 0);
    }

    #[test]
    fn probabilistic_path_fills_posteriors() {
        let mut config = exact_config();
        config.deterministic.enabled = false;
        config.probabilistic.enabled = true;
        let left = vec![
            person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala"),
            person("2", "Jo", "Smith", Some("1990-02-01"), "Stockholm"),
        ];
        let right = vec![
            person("10", "Anne", "Brown", Some("1990-03-01"), "Uppsala"),
            person("11", "John", "Smyth", Some("1990-04-01"), "Lund"),
        ];
        let result = run(&config, &left, &right).unwrap();
        assert_eq!(result.rows.len(), 4);
        assert!(result.summary.deterministic.is_none());
        assert_eq!(result.summary.probabilistic.unwrap().total(), 4);
        let em = result.em.as_ref().unwrap();
        assert_eq!(em.parameters.features.len(), 3);
        for row in &result.rows {
            let p = row.probability.unwrap();
            assert!((0.0..=1.0).contains(&p));
            assert!(row.score.is_none());
            assert!(row.probabilistic_decision.is_some());
        }
    }

    #[test]
    fn rejects_empty_dataset() {
        let right = vec![person("10", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let err = run(&LinkConfig::default(), &[], &right).unwrap_err();
        assert!(matches!(err, LinkError::EmptyInput(_)));
        assert!(err.to_string().contains("left"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let left = vec![
            person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala"),
            person("1", "Jo", "Smith", Some("1988-01-01"), "Lund"),
        ];
        let right = vec![person("10", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let err = run(&LinkConfig::default(), &left, &right).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateRecordId { .. }));
    }

    #[test]
    fn custom_comparator_via_builder() {
        let config = LinkConfig::default();
        let builder = FeatureBuilder::from_config(&config.features)
            .unwrap()
            .with_comparator("sim_city", |_: &str, _: &str| 1.0)
            .unwrap();
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Gothenburg")];
        let right = vec![person("12", "Anne", "Brown", Some("1990-01-01"), "Malmo")];
        let result = run_with_builder(&config, &builder, &left, &right).unwrap();
        assert_eq!(result.rows[0].features.get("sim_city"), Some(1.0));
    }

    #[test]
    fn builder_must_match_config() {
        let config = LinkConfig::default();
        let builder = FeatureBuilder::from_config(&config.features[..1]).unwrap();
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let err = run_with_builder(&config, &builder, &left, &left).unwrap_err();
        assert!(err.to_string().contains("feature builder"));
    }

    #[test]
    fn out_of_range_missing_value_is_rejected() {
        let mut config = LinkConfig::default();
        config.features[2].missing_value = 2.5;
        assert!(FeatureBuilder::from_config(&config.features).is_err());

        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let right = vec![Record::new("10").with("dob", Some("1990-01-01"))];
        let err = run(&config, &left, &right).unwrap_err();
        assert!(err.to_string().contains("missing_value"));
    }

    #[test]
    fn ranked_orders_by_score() {
        let config = exact_config();
        let left = vec![
            person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala"),
            person("2", "Jo", "Brown", Some("1990-02-01"), "Lund"),
        ];
        let right = vec![person("10", "Anne", "Brown", Some("1990-03-01"), "Uppsala")];
        let result = run(&config, &left, &right).unwrap();
        let ranked = result.ranked();
        assert_eq!(ranked[0].left_id, "1");
        assert_eq!(ranked[1].left_id, "2");
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[test]
    fn json_output() {
        let left = vec![person("1", "Anne", "Brown", Some("1990-01-01"), "Uppsala")];
        let right = vec![person("12", "Ann", "Brown", Some("1990-01-01"), "Uppsala")];
        let result = run(&LinkConfig::default(), &left, &right).unwrap();
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["meta"]["candidate_pairs"], 1);
        assert_eq!(json["rows"][0]["left_id"], "1");
        assert!(json["rows"][0]["features"]["sim_last"].is_number());
        assert!(json["rows"][0].get("probability").is_none());
        assert!(json.get("em").is_none());
    }
}
