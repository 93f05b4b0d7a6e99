use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::app::error::AppError;

const DESCRIPTION_LIMIT: usize = 20;

pub type LinePredicate = dyn Fn(&str) -> bool + Send + Sync;

/// A test applied to every log line.
#[derive(Clone)]
pub enum Matcher {
    Pattern(Regex),
    Predicate { label: String, func: Arc<LinePredicate> },
}

impl Matcher {
    /// Compiles `pattern` with default (case-sensitive, unanchored) semantics.
    pub fn pattern(pattern: &str, trace_id: &str) -> Result<Self, AppError> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|err| AppError::validation(format!("Invalid watch pattern: {err}"), trace_id))
    }

    pub fn predicate(
        label: impl Into<String>,
        func: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Predicate {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn is_match(&self, line: &str) -> bool {
        match self {
            Self::Pattern(regex) => regex.is_match(line),
            Self::Predicate { func, .. } => func(line),
        }
    }

    pub fn description(&self) -> String {
        let source = match self {
            Self::Pattern(regex) => regex.as_str(),
            Self::Predicate { label, .. } => label.as_str(),
        };
        truncate_description(source)
    }
}

fn truncate_description(source: &str) -> String {
    if source.chars().count() <= DESCRIPTION_LIMIT {
        return source.to_string();
    }
    let head: String = source.chars().take(DESCRIPTION_LIMIT).collect();
    format!("{head}...")
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Self::Predicate { label, .. } => f.debug_struct("Predicate").field("label", label).finish(),
        }
    }
}

impl From<Regex> for Matcher {
    fn from(regex: Regex) -> Self {
        Self::Pattern(regex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_search_is_unanchored_and_case_sensitive() {
        let matcher = Matcher::pattern("button clicked", "t").expect("compile");
        assert!(matcher.is_match("I/Calc( 123): button clicked id=7"));
        assert!(!matcher.is_match("I/Calc( 123): Button Clicked"));
    }

    #[test]
    fn invalid_pattern_is_validation_error() {
        let err = Matcher::pattern("(unclosed", "trace-re").expect_err("expected error");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(err.trace_id, "trace-re");
    }

    #[test]
    fn predicate_matches_with_closure() {
        let matcher = Matcher::predicate("long lines", |line| line.len() > 10);
        assert!(matcher.is_match("0123456789ab"));
        assert!(!matcher.is_match("short"));
        assert_eq!(matcher.description(), "long lines");
    }

    #[test]
    fn description_is_truncated() {
        let matcher = Matcher::pattern("ActivityManager: Displayed com.example", "t").expect("compile");
        assert_eq!(matcher.description(), "ActivityManager: Dis...");
        let short = Matcher::pattern("ready", "t").expect("compile");
        assert_eq!(short.to_string(), "ready");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(25);
        let description = truncate_description(&text);
        assert_eq!(description.chars().count(), DESCRIPTION_LIMIT + 3);
    }
}
