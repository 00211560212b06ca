//! Compiled filter patterns, shared through the store.

use std::time::Duration;

use regex::Regex;
use tracing::trace;

use crate::cache::{Namespace, SharedStore, StoredValue};

#[derive(Clone)]
pub struct PatternCache {
    store: SharedStore,
    ttl: Duration,
}

impl PatternCache {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Returns the compiled form of `expr`, compiling and storing it on first
    /// use. A slot holding anything but a pattern is recompiled over.
    pub fn compile(&self, expr: &str) -> Result<Regex, regex::Error> {
        let key = Namespace::Pattern.key(expr);
        if let Some(StoredValue::Pattern(re)) = self.store.peek(&key).map(|item| item.into_value()) {
            return Ok(re);
        }

        let re = Regex::new(expr)?;
        trace!(pattern = expr, "compiled filter pattern");
        self.store.set(key, StoredValue::Pattern(re.clone()), self.ttl);
        Ok(re)
    }
}

impl std::fmt::Debug for PatternCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternCache")
            .field("entries", &self.store.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
