//! Named statement parameters.
//!
//! Every bound value gets a name of the form `:bind_<alias>_<n>`. Names are
//! unique within one query, and sub-queries seed their counter past the
//! parent's so merging two bags never collides, even when both sides share
//! an alias.

use serde_json::Value;

/// Ordered bag of named parameters for one statement.
#[derive(Debug, Clone)]
pub struct ParamBag {
    alias: String,
    seq: usize,
    values: Vec<(String, Value)>,
}

impl ParamBag {
    pub fn new(alias: impl Into<String>) -> Self {
        Self::with_offset(alias, 0)
    }

    /// Start the counter at `seq`. Used for sub-queries whose parameters will
    /// be merged into a parent statement.
    pub fn with_offset(alias: impl Into<String>, seq: usize) -> Self {
        Self {
            alias: alias.into(),
            seq,
            values: Vec::new(),
        }
    }

    /// Register one value and return its placeholder name, colon included.
    pub fn bind(&mut self, value: Value) -> String {
        let name = format!(":bind_{}_{}", self.alias, self.seq);
        self.seq += 1;
        self.values.push((name.clone(), value));
        name
    }

    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    /// Absorb a sub-query's parameters. The counter advances to cover both
    /// bags so later binds stay unique.
    pub fn merge(&mut self, other: ParamBag) {
        self.values.extend(other.values);
        self.seq = self.seq.max(other.seq);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
