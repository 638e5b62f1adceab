//! Decides whether a task is worth decomposing.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::config::ComplexityConfig;

/// Injected predicate consulted for every non-phase task.
pub trait ComplexityPolicy: Send + Sync {
    fn is_complex(&self, task: &str) -> bool;
}

/// Never decomposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverComplex;

impl ComplexityPolicy for NeverComplex {
    fn is_complex(&self, _task: &str) -> bool {
        false
    }
}

static CONJUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:and|then|also|plus)\b").expect("invalid conjunction regex"));

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;]").expect("invalid separator regex"));

static BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*]|\d+[.)])\s+").expect("invalid bullet regex"));

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("invalid word regex"));

/// Counts structural signals in the task text.
///
/// Each conjunction, list separator and bullet counts once, and so does each
/// distinct area keyword. The task is complex once the count reaches
/// `min_signals`.
#[derive(Debug, Clone)]
pub struct KeywordComplexity {
    min_signals: usize,
    keywords: HashSet<String>,
}

impl Default for KeywordComplexity {
    fn default() -> Self {
        Self::from_config(&ComplexityConfig::default())
    }
}

impl KeywordComplexity {
    pub fn new<I, S>(min_signals: usize, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            min_signals: min_signals.max(1),
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &ComplexityConfig) -> Self {
        Self::new(config.min_signals, &config.keywords)
    }

    pub fn signals(&self, task: &str) -> usize {
        let structural = CONJUNCTION.find_iter(task).count()
            + SEPARATOR.find_iter(task).count()
            + BULLET.find_iter(task).count();

        let areas: HashSet<String> = WORD
            .find_iter(task)
            .map(|m| m.as_str().to_lowercase())
            .filter(|w| self.keywords.contains(w))
            .collect();

        structural + areas.len()
    }
}

impl ComplexityPolicy for KeywordComplexity {
    fn is_complex(&self, task: &str) -> bool {
        self.signals(task) >= self.min_signals
    }
}
