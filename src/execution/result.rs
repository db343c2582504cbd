//! Query output

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::group_keys::GroupKey;
use crate::language::Term;

/// One output row: the group's key path and its select values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub keys: Vec<GroupKey>,
    pub values: Vec<f64>,
}

impl Row {
    pub fn new(keys: Vec<GroupKey>, values: Vec<f64>) -> Self {
        Self { keys, values }
    }

    /// Key labels as text, for display and assertions
    pub fn key_labels(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.to_string()).collect()
    }
}

/// Terms recorded per group by a sample-fields command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledTerms {
    pub field: String,
    pub keys: Vec<GroupKey>,
    pub terms: Vec<Term>,
}

/// Work done by one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub commands: u64,
    pub regroups: u64,
    pub stats_pushed: u64,
    pub ftgs_tuples: u64,
    pub precomputed_slots: u64,
}

/// Everything a session produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Output was cut by a row limit
    pub truncated: bool,
    pub sampled: Vec<SampledTerms>,
    pub counters: ExecutionCounters,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep at most `limit` rows
    pub fn limit(&mut self, limit: usize) {
        if self.rows.len() > limit {
            self.rows.truncate(limit);
            self.truncated = true;
        }
    }

    /// Rows keyed by their label path
    pub fn by_labels(&self) -> BTreeMap<Vec<String>, Vec<f64>> {
        self.rows
            .iter()
            .map(|r| (r.key_labels(), r.values.clone()))
            .collect()
    }
}
