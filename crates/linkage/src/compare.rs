//! Comparator capability and the stock similarity methods.
//!
//! A comparator maps two canonical field values to a similarity in [0,1].
//! Callers pick a [`SimilarityMethod`] in the config or supply their own
//! implementation; both go through the same trait.

use serde::Deserialize;
use strsim::{
    jaro, jaro_winkler, normalized_damerau_levenshtein, normalized_levenshtein, sorensen_dice,
};

pub trait Comparator: Send + Sync {
    /// Similarity of two non-empty canonical values, expected in [0,1].
    fn compare(&self, left: &str, right: &str) -> f64;
}

impl<F> Comparator for F
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn compare(&self, left: &str, right: &str) -> f64 {
        self(left, right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    /// 1.0 on equality, else 0.0.
    Exact,
    Jaro,
    #[default]
    JaroWinkler,
    /// 1 - edit distance / longer length.
    Levenshtein,
    DamerauLevenshtein,
    /// Bigram overlap.
    SorensenDice,
    /// Jaro-Winkler over alphabetically sorted whitespace tokens.
    TokenSort,
}

impl std::fmt::Display for SimilarityMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Jaro => write!(f, "jaro"),
            Self::JaroWinkler => write!(f, "jaro_winkler"),
            Self::Levenshtein => write!(f, "levenshtein"),
            Self::DamerauLevenshtein => write!(f, "damerau_levenshtein"),
            Self::SorensenDice => write!(f, "sorensen_dice"),
            Self::TokenSort => write!(f, "token_sort"),
        }
    }
}

impl Comparator for SimilarityMethod {
    fn compare(&self, left: &str, right: &str) -> f64 {
        match self {
            Self::Exact => {
                if left == right {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Jaro => jaro(left, right),
            Self::JaroWinkler => jaro_winkler(left, right),
            Self::Levenshtein => normalized_levenshtein(left, right),
            Self::DamerauLevenshtein => normalized_damerau_levenshtein(left, right),
            Self::SorensenDice => sorensen_dice(left, right),
            Self::TokenSort => token_sort(left, right),
        }
    }
}

/// Word-order-insensitive Jaro-Winkler.
pub fn token_sort(left: &str, right: &str) -> f64 {
    jaro_winkler(&sorted_tokens(left), &sorted_tokens(right))
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}
