//! Attribute queries over object dictionaries
//!
//! Matching is stringified equality over the object's dictionary form, with
//! three gates: `all` (match everything, trumps the rest), `contains`
//! (attribute presence) and `expr` (arbitrary predicate). A query with no
//! key/value pairs matches nothing unless `all` is set.

use serde_json::{Map, Value};
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct Query {
    all: bool,
    contains: Vec<String>,
    equals: Vec<(String, Value)>,
    expr: Option<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match every object
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Require `key` to equal `value` (stringified comparison)
    pub fn key(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    /// Require the attribute to be present, whatever its value
    pub fn contains(mut self, key: impl Into<String>) -> Self {
        self.contains.push(key.into());
        self
    }

    /// Gate on an arbitrary predicate over the attribute dictionary
    pub fn expr(mut self, f: impl Fn(&Map<String, Value>) -> bool + Send + Sync + 'static) -> Self {
        self.expr = Some(Arc::new(f));
        self
    }

    pub fn matches(&self, d: &Map<String, Value>) -> bool {
        if self.all {
            return true;
        }

        if let Some(expr) = &self.expr {
            if !expr(d) {
                return false;
            }
        }

        for key in &self.contains {
            if !d.contains_key(key) {
                return false;
            }
        }

        // with no pairs there is nothing to match against
        if self.equals.is_empty() {
            return false;
        }

        self.equals
            .iter()
            .all(|(key, want)| d.get(key).map(stringify) == Some(stringify(want)))
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("all", &self.all)
            .field("contains", &self.contains)
            .field("equals", &self.equals)
            .field("expr", &self.expr.is_some())
            .finish()
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
