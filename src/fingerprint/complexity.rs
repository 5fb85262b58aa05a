//! Text complexity scoring used to pick how many fingerprint resolutions a text needs.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::cache::EngineCaches;
use crate::domain::{Resolution, TextDigest};

const LENGTH_WEIGHT: f64 = 0.3;
const WORD_COUNT_WEIGHT: f64 = 0.2;
const UNIQUE_WORDS_WEIGHT: f64 = 0.2;
const AVG_WORD_LENGTH_WEIGHT: f64 = 0.1;
const PUNCTUATION_WEIGHT: f64 = 0.1;
const CODE_WEIGHT: f64 = 0.1;

const LENGTH_CAP_CHARS: f64 = 10_000.0;
const WORD_COUNT_CAP: f64 = 2_000.0;
const WORD_LENGTH_CAP: f64 = 15.0;
const PUNCTUATION_SCALE: f64 = 10.0;

const LOW_COMPLEXITY: f64 = 0.3;
const MEDIUM_COMPLEXITY: f64 = 0.6;
const LOW_MAX_RESOLUTION: Resolution = 256;
const MEDIUM_MAX_RESOLUTION: Resolution = 512;
const LOW_MIN_COUNT: usize = 2;
const MEDIUM_MIN_COUNT: usize = 3;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").expect("word pattern is valid"));
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[.,;:!?\-()\[\]{}"'\\/]"#).expect("punctuation pattern is valid")
});
static CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(import|from|def|class|return|if|else|for|while|try|except|finally|with|lambda)\b|",
        r"\b(true|false|null|undefined|None)\b|",
        r"[{};()<>=\[\]]|",
        r"\.[a-zA-Z_]+|",
        r#""[^"]*"|"#,
        r"'[^']*'",
    ))
    .expect("code pattern is valid")
});

/// Normalized sub-metrics, each in `[0, 1]`, and their weighted sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ComplexityReport {
    pub length: f64,
    pub word_count: f64,
    pub unique_words: f64,
    pub avg_word_length: f64,
    pub punctuation_density: f64,
    pub code_content: f64,
    pub score: f64,
}

impl ComplexityReport {
    fn measure(text: &str) -> Self {
        let length = text.chars().count();
        let lowered = text.to_lowercase();
        let words: Vec<&str> = WORD.find_iter(&lowered).map(|word| word.as_str()).collect();
        let word_count = words.len();

        let (unique_ratio, avg_word_length, code_ratio) = if word_count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let unique: HashSet<&str> = words.iter().copied().collect();
            let total_chars: usize = words.iter().map(|word| word.chars().count()).sum();
            let code_matches = CODE.find_iter(text).count();
            (
                unique.len() as f64 / word_count as f64,
                total_chars as f64 / word_count as f64,
                (code_matches as f64 / word_count as f64).min(1.0),
            )
        };

        let punctuation_density = if length == 0 {
            0.0
        } else {
            PUNCTUATION.find_iter(text).count() as f64 / length as f64
        };

        let mut report = Self {
            length: (length as f64 / LENGTH_CAP_CHARS).min(1.0),
            word_count: (word_count as f64 / WORD_COUNT_CAP).min(1.0),
            unique_words: unique_ratio,
            avg_word_length: (avg_word_length / WORD_LENGTH_CAP).min(1.0),
            punctuation_density: (punctuation_density * PUNCTUATION_SCALE).min(1.0),
            code_content: code_ratio,
            score: 0.0,
        };
        report.score = report.length * LENGTH_WEIGHT
            + report.word_count * WORD_COUNT_WEIGHT
            + report.unique_words * UNIQUE_WORDS_WEIGHT
            + report.avg_word_length * AVG_WORD_LENGTH_WEIGHT
            + report.punctuation_density * PUNCTUATION_WEIGHT
            + report.code_content * CODE_WEIGHT;
        report
    }
}

/// Scores text complexity, caching reports per text digest.
#[derive(Clone)]
pub struct ComplexityAnalyzer {
    caches: Arc<EngineCaches>,
}

impl ComplexityAnalyzer {
    pub fn new(caches: Arc<EngineCaches>) -> Self {
        Self { caches }
    }

    pub fn analyze(&self, text: &str) -> ComplexityReport {
        if text.trim().is_empty() {
            return ComplexityReport::default();
        }

        let digest = TextDigest::of(text);
        if let Some(report) = self.caches.complexity().get(&digest) {
            return report;
        }

        let report = ComplexityReport::measure(text);
        debug!(score = report.score, "Measured text complexity");
        self.caches.complexity().put(digest, report);
        report
    }

    /// Subset of `resolutions` (ascending) worth computing for `text`.
    ///
    /// Low scores keep resolutions up to 256 (at least two), medium up to 512 (at least
    /// three), high keep all. Only configured resolutions are ever returned.
    pub fn adaptive_resolutions(&self, text: &str, resolutions: &[Resolution]) -> Vec<Resolution> {
        let score = self.analyze(text).score;
        let selected = select_resolutions(score, resolutions);
        debug!(
            complexity = score,
            resolutions = ?selected,
            "Selected adaptive resolutions"
        );
        selected
    }
}

pub(crate) fn select_resolutions(score: f64, resolutions: &[Resolution]) -> Vec<Resolution> {
    let (limit, minimum) = if score < LOW_COMPLEXITY {
        (LOW_MAX_RESOLUTION, LOW_MIN_COUNT)
    } else if score < MEDIUM_COMPLEXITY {
        (MEDIUM_MAX_RESOLUTION, MEDIUM_MIN_COUNT)
    } else {
        return resolutions.to_vec();
    };

    let selected: Vec<Resolution> = resolutions
        .iter()
        .copied()
        .filter(|resolution| *resolution <= limit)
        .collect();
    if selected.len() >= minimum {
        return selected;
    }

    // Too few small resolutions configured: keep the smallest ones available.
    let mut smallest = resolutions.to_vec();
    smallest.sort_unstable();
    smallest.truncate(minimum);
    smallest
}
