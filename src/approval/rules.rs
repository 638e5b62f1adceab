//! Path rules deciding which writes need a human decision.

use glob::{MatchOptions, Pattern, PatternError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled protected/allow/forbidden pattern sets.
///
/// A path is protected when it matches a `protected` pattern and no `allow`
/// pattern. Forbidden paths are refused outright, approval or not. A pattern
/// matches the whole relative path or any trailing component sequence of it,
/// so `core.cfg` also covers `nested/control/core.cfg`.
#[derive(Debug, Clone, Default)]
pub struct ProtectionRules {
    protected: Vec<Pattern>,
    allow: Vec<Pattern>,
    forbidden: Vec<Pattern>,
}

impl ProtectionRules {
    pub fn new<S: AsRef<str>>(
        protected: &[S],
        allow: &[S],
        forbidden: &[S],
    ) -> Result<Self, PatternError> {
        Ok(Self {
            protected: compile(protected)?,
            allow: compile(allow)?,
            forbidden: compile(forbidden)?,
        })
    }

    /// Normalize to a forward-slash path relative to the project root.
    pub fn normalize(path: &str) -> String {
        let mut normalized = path.replace('\\', "/");
        loop {
            if let Some(rest) = normalized.strip_prefix("./") {
                normalized = rest.to_string();
            } else if let Some(rest) = normalized.strip_prefix('/') {
                normalized = rest.to_string();
            } else {
                break;
            }
        }
        normalized
    }

    /// Whether the normalized path climbs out of the project root.
    pub fn escapes_root(normalized: &str) -> bool {
        normalized.split('/').any(|part| part == "..")
    }

    pub fn is_protected(&self, path: &str) -> bool {
        let normalized = Self::normalize(path);
        matches_any(&self.protected, &normalized) && !matches_any(&self.allow, &normalized)
    }

    pub fn is_forbidden(&self, path: &str) -> bool {
        matches_any(&self.forbidden, &Self::normalize(path))
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>, PatternError> {
    patterns
        .iter()
        .map(|p| Pattern::new(&ProtectionRules::normalize(p.as_ref())))
        .collect()
}

fn matches_any(patterns: &[Pattern], normalized: &str) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches_with(normalized, MATCH_OPTIONS)
            || normalized
                .match_indices('/')
                .any(|(i, _)| pattern.matches_with(&normalized[i + 1..], MATCH_OPTIONS))
    })
}
