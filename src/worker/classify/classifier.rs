//! Keyword relevance classifier.
//!
//! Every phrase is compiled once into a single `RegexSet` at construction; the
//! per-event path is a single `is_match` call and never allocates.

use regex::{RegexSet, RegexSetBuilder};

use crate::worker::classify::keywords::MENTAL_HEALTH_KEYWORDS;
use crate::worker::core::errors::{IngestError, IngestResult};

/// Case-insensitive whole-word keyword matcher.
#[derive(Clone, Debug)]
pub struct RelevanceClassifier {
    keywords: Vec<String>,
    matchers: RegexSet,
}

impl RelevanceClassifier {
    /// Create a classifier over the built-in mental-health keywords.
    ///
    /// # Errors
    /// Returns an error if a keyword pattern fails to compile.
    pub fn new() -> IngestResult<Self> {
        Self::with_keywords(MENTAL_HEALTH_KEYWORDS)
    }

    /// Create a classifier over a custom keyword list.
    ///
    /// # Errors
    /// Returns an error if the list is empty or a pattern fails to compile.
    pub fn with_keywords<S: AsRef<str>>(keywords: &[S]) -> IngestResult<Self> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(IngestError::InvalidConfig(
                "classifier needs at least one keyword".to_string(),
            ));
        }

        let patterns: Vec<String> = keywords.iter().map(|k| keyword_pattern(k)).collect();
        let matchers = RegexSetBuilder::new(&patterns)
            .case_insensitive(true)
            .build()?;

        Ok(Self { keywords, matchers })
    }

    /// Whether the text mentions any keyword as a whole word or phrase.
    #[must_use]
    pub fn is_relevant(&self, text: &str) -> bool {
        !text.is_empty() && self.matchers.is_match(text)
    }

    /// Keywords found in the text, in keyword-list order.
    #[must_use]
    pub fn matched_keywords(&self, text: &str) -> Vec<&str> {
        if text.is_empty() {
            return Vec::new();
        }
        self.matchers
            .matches(text)
            .into_iter()
            .map(|idx| self.keywords[idx].as_str())
            .collect()
    }

    /// Number of compiled keyword matchers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.keywords.len()
    }

    /// Always false; construction rejects empty keyword lists.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// Escape a phrase, widen apostrophes and spacing, and anchor it on word boundaries.
fn keyword_pattern(keyword: &str) -> String {
    let escaped = regex::escape(keyword)
        .replace(['\'', '’'], "['’]")
        .replace(' ', r"\s+");
    format!(r"\b{escaped}\b")
}
