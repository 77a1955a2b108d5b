use glob::{MatchOptions, Pattern};

use crate::DEFAULT_DOCUMENT;
use crate::error::TsuzuriError;

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// URLs excluded from template interception.
///
/// A URL ending in `/` is tested both as is and with the default document
/// name appended, so `/drafts/**` also covers `/drafts/`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<Pattern>,
}

impl IgnoreMatcher {
    pub fn new<S>(patterns: impl IntoIterator<Item = S>) -> Result<Self, TsuzuriError>
    where
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: patterns
                .into_iter()
                .map(|pattern| Pattern::new(pattern.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, url: &str) -> bool {
        if self.test(url) {
            return true;
        }

        url.ends_with('/') && self.test(&format!("{url}{DEFAULT_DOCUMENT}"))
    }

    fn test(&self, url: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(url, OPTIONS))
    }
}
