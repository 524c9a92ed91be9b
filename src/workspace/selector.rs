//! Include/exclude selection over a workspace subtree
//!
//! A path is a candidate when `includes` is empty or an include pattern
//! matches it or one of its ancestors. The `excludes` list is then scanned
//! in order and the last matching rule decides; a rule written `!pattern`
//! re-admits what it matches. `*` stays within one path component and `**`
//! spans any number of them.

use crate::error::{CairnError, CairnResult};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A requested subset of the workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSelector {
    /// Directory relative to the workspace root
    pub path: String,
    /// Glob patterns relative to `path`; empty selects everything
    #[serde(default)]
    pub includes: Vec<String>,
    /// Ordered glob patterns relative to `path`; `!` prefix re-admits
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl PathSelector {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }
}

#[derive(Debug, Clone)]
struct ExcludeRule {
    pattern: Pattern,
    readmit: bool,
}

/// Compiled form of a selector's patterns
#[derive(Debug, Clone, Default)]
pub struct SelectorMatcher {
    includes: Vec<Pattern>,
    excludes: Vec<ExcludeRule>,
}

impl SelectorMatcher {
    pub fn new(includes: &[String], excludes: &[String]) -> CairnResult<Self> {
        let includes = includes
            .iter()
            .map(|p| compile(p))
            .collect::<CairnResult<Vec<_>>>()?;

        let excludes = excludes
            .iter()
            .map(|raw| {
                let (readmit, body) = match raw.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, raw.as_str()),
                };
                Ok(ExcludeRule {
                    pattern: compile(body)?,
                    readmit,
                })
            })
            .collect::<CairnResult<Vec<_>>>()?;

        Ok(Self { includes, excludes })
    }

    /// Matcher that selects everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Decide whether a `/`-separated relative path is selected
    pub fn matches(&self, rel: &str) -> bool {
        let candidate = self.includes.is_empty()
            || self.includes.iter().any(|p| matches_path_or_ancestor(p, rel));
        if !candidate {
            return false;
        }

        let mut excluded = false;
        for rule in &self.excludes {
            if matches_path_or_ancestor(&rule.pattern, rel) {
                excluded = !rule.readmit;
            }
        }
        !excluded
    }

    /// True when an exclude covers `rel` and everything beneath it: the
    /// last exclude that matches is not followed by any re-admitting rule.
    pub fn prunes_dir(&self, rel: &str) -> bool {
        let last = self
            .excludes
            .iter()
            .rposition(|rule| matches_path_or_ancestor(&rule.pattern, rel));
        match last {
            Some(idx) => {
                !self.excludes[idx].readmit && !self.excludes[idx + 1..].iter().any(|r| r.readmit)
            }
            None => false,
        }
    }
}

fn compile(raw: &str) -> CairnResult<Pattern> {
    let cleaned = raw
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    Pattern::new(cleaned).map_err(|e| CairnError::InvalidPattern {
        pattern: raw.to_string(),
        reason: e.to_string(),
    })
}

/// A pattern naming a directory selects everything beneath it
fn matches_path_or_ancestor(pattern: &Pattern, rel: &str) -> bool {
    if pattern.matches_with(rel, MATCH_OPTIONS) {
        return true;
    }
    rel.match_indices('/')
        .any(|(idx, _)| pattern.matches_with(&rel[..idx], MATCH_OPTIONS))
}
