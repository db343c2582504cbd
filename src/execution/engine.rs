//! Protocol spoken with the external columnar engine
//!
//! One `DatasetSession` per dataset of a query. Every document of a session
//! belongs to exactly one group; group 0 means "dropped". A session also
//! keeps a stack of pushed per-document stats; stat indices are 0-based
//! positions in that stack.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::EngineResult;
use crate::actions::StoreQuery;
use crate::language::{PushOp, Term};

/// A per-document test used by regroup rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Query(StoreQuery),
    Term { field: String, term: Term },
    IntIn { field: String, terms: BTreeSet<i64> },
    StringIn { field: String, terms: BTreeSet<String> },
    /// Some term of the field matches the regex
    Regex { field: String, regex: String },
    /// `min <= stat <= max`
    StatRange { stat: usize, min: i64, max: i64 },
    /// Keeps a term with the given probability, decided by hashing the
    /// term with the seed
    Random {
        field: String,
        probability: f64,
        seed: String,
    },
    Always,
}

/// How the documents of one group move
///
/// Groups without a rule keep their documents where they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegroupRule {
    /// First matching condition wins; documents matching none go to
    /// `negative`
    Conditions {
        target: usize,
        conditions: Vec<(Condition, usize)>,
        negative: usize,
    },
    /// Value `v` of `stat` goes to `first + (v - min) / interval` when that
    /// bucket is below `count`, to `below` under `min` and to `above` past
    /// the last bucket
    Buckets {
        target: usize,
        stat: usize,
        min: i64,
        interval: i64,
        count: usize,
        first: usize,
        below: usize,
        above: usize,
    },
}

impl RegroupRule {
    pub fn target(&self) -> usize {
        match self {
            RegroupRule::Conditions { target, .. } | RegroupRule::Buckets { target, .. } => *target,
        }
    }

    /// Everything in `target` moves to `destination`
    pub fn move_all(target: usize, destination: usize) -> Self {
        RegroupRule::Conditions {
            target,
            conditions: Vec::new(),
            negative: destination,
        }
    }

    /// Largest group id the rule can write
    pub fn max_destination(&self) -> usize {
        match self {
            RegroupRule::Conditions {
                conditions,
                negative,
                ..
            } => conditions.iter().map(|(_, g)| *g).fold(*negative, usize::max),
            RegroupRule::Buckets {
                count,
                first,
                below,
                above,
                ..
            } => (*below).max(*above).max(first + count.saturating_sub(1)),
        }
    }
}

/// A field to iterate, by physical name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FtgsField {
    pub name: String,
    pub is_int: bool,
}

impl FtgsField {
    pub fn new(name: impl Into<String>, is_int: bool) -> Self {
        Self {
            name: name.into(),
            is_int,
        }
    }
}

/// One (field, term, group) with the sums of every pushed stat over the
/// documents of `group` holding `term`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtgsTuple {
    pub field: String,
    pub term: Term,
    pub group: usize,
    pub stats: Vec<i64>,
}

/// Term iteration; dropping it releases the engine-side resources
pub type FtgsIterator<'a> = Box<dyn Iterator<Item = EngineResult<FtgsTuple>> + Send + 'a>;

/// Engine-side state of one dataset for one query
pub trait DatasetSession: Send {
    fn name(&self) -> &str;

    /// Push a program; returns the new stack size
    fn push_stat(&mut self, program: &[PushOp]) -> EngineResult<usize>;

    fn pop_stat(&mut self) -> EngineResult<()>;

    fn num_stats(&self) -> usize;

    /// Apply rules; returns the number of groups afterwards
    fn regroup(&mut self, rules: &[RegroupRule]) -> EngineResult<usize>;

    /// Move group `g` to `mapping[g]`; ids past the mapping go to 0
    fn remap_groups(&mut self, mapping: &[usize]) -> EngineResult<usize>;

    /// Drop documents whose `stat` is outside `[min, max]` (inside, when
    /// `negate`) into group 0
    fn metric_filter(&mut self, stat: usize, min: i64, max: i64, negate: bool) -> EngineResult<()>;

    /// Per-group sums of `stat`, indexed by group, length `num_groups + 1`
    fn get_group_stats(&mut self, stat: usize, num_groups: usize) -> EngineResult<Vec<i64>>;

    /// Iterate terms of `fields` with every pushed stat. Sorted iteration
    /// yields fields in order, then terms ascending, then groups ascending.
    fn ftgs_iterator(&mut self, fields: &[FtgsField], sorted: bool) -> EngineResult<FtgsIterator<'_>>;

    /// Distinct term count per group, length `num_groups + 1`
    fn get_distinct(&mut self, field: &FtgsField, num_groups: usize) -> EngineResult<Vec<i64>>;

    /// Release the session. Further calls fail.
    fn close(&mut self);
}

/// Opens dataset sessions
pub trait Engine: Send + Sync {
    /// Every document of `dataset` with a timestamp in `[start, end)` starts
    /// in group 1
    fn open(
        &self,
        dataset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Box<dyn DatasetSession>>;
}
