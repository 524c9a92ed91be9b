//! Live resolution seam
//!
//! The lockfile only pins results. Producing them (registry pulls, git
//! ls-remote, HTTP fetches) belongs to the engine, which plugs in here.

use crate::error::{CairnError, CairnResult};
use crate::lockfile::entry::ResolverCall;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Resolves an impure call to a stable output, typically a content digest
#[async_trait]
pub trait LiveResolver: Send + Sync {
    async fn resolve(&self, call: &ResolverCall) -> CairnResult<String>;
}

/// Resolver answering from a fixed table. Any call not in the table fails,
/// which makes it useful for offline runs where everything must already
/// be pinned or supplied.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    answers: BTreeMap<ResolverCall, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, call: ResolverCall, output: impl Into<String>) -> Self {
        self.answers.insert(call, output.into());
        self
    }
}

#[async_trait]
impl LiveResolver for StaticResolver {
    async fn resolve(&self, call: &ResolverCall) -> CairnResult<String> {
        self.answers
            .get(call)
            .cloned()
            .ok_or_else(|| CairnError::User(format!("{} is not locked and cannot be resolved offline", call)))
    }
}
