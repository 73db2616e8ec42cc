//! `reclink-linkage` — Record-linkage engine for two person-record datasets.
//!
//! Pure engine crate: receives pre-loaded records, returns scored and
//! classified candidate pairs. No CLI or IO dependencies.
//!
//! Pipeline: normalize -> block -> compare -> classify (deterministic
//! weighted score and/or Fellegi-Sunter EM) -> summarize.

pub mod blocking;
pub mod compare;
pub mod config;
pub mod decision;
pub mod em;
pub mod engine;
pub mod error;
pub mod features;
pub mod model;
pub mod normalize;
pub mod summary;
pub mod sweep;

pub use compare::{Comparator, SimilarityMethod};
pub use config::LinkConfig;
pub use decision::{DeterministicClassifier, Thresholds};
pub use em::{EmClassifier, EmConfig, EmModel};
pub use engine::{run, run_with_builder};
pub use error::LinkError;
pub use features::FeatureBuilder;
pub use model::{Decision, FeatureVector, LinkResult, LinkRow, Record};
pub use sweep::{sweep, SweepRow};
