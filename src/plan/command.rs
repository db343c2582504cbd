//! Wire-level commands
//!
//! The instruction set a session executes, in order. Commands carry
//! expression trees rather than push programs; programs are derived per
//! dataset when a command runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::language::{
    AggregateFilter, AggregateMetric, BootstrapOutput, DocFilter, DocMetric, FieldSet, Scope, Term,
};

/// How child values fold into their parent when a grouping level is undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeType {
    SumAll,
    /// Every child must hold the same value
    TakeTheOneUniqueValue,
    /// Any value at the level being undone is an error
    FailIfPresent,
}

impl MergeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeType::SumAll => "SUM_ALL",
            MergeType::TakeTheOneUniqueValue => "TAKE_THE_ONE_UNIQUE_VALUE",
            MergeType::FailIfPresent => "FAIL_IF_PRESENT",
        }
    }
}

/// A full pass whose per-group results are saved under a name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Computation {
    /// Plain per-group value of a metric
    GroupStats { metric: AggregateMetric },
    /// Distinct term count per group, summed over the last `window` siblings
    Distincts {
        scope: Scope,
        field: FieldSet,
        window: usize,
    },
    Percentiles {
        scope: Scope,
        field: FieldSet,
        percentile: f64,
    },
    SumAcross {
        scope: Scope,
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    /// The term of an int field maximising `metric`
    FieldExtreme {
        scope: Scope,
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    Bootstrap {
        scope: Scope,
        field: FieldSet,
        filter: Option<AggregateFilter>,
        metric: AggregateMetric,
        num_bootstraps: usize,
        seed: String,
        outputs: Vec<BootstrapOutput>,
    },
}

impl Computation {
    pub fn kind(&self) -> &'static str {
        match self {
            Computation::GroupStats { .. } => "GET_GROUP_STATS",
            Computation::Distincts { .. } => "GET_GROUP_DISTINCTS",
            Computation::Percentiles { .. } => "GET_GROUP_PERCENTILES",
            Computation::SumAcross { .. } => "SUM_ACROSS",
            Computation::FieldExtreme { .. } => "COMPUTE_FIELD_EXTREME_VALUE",
            Computation::Bootstrap { .. } => "COMPUTE_BOOTSTRAP",
        }
    }

    /// Whether the pass depends on sorted term order
    pub fn need_sorted(&self) -> bool {
        match self {
            Computation::GroupStats { metric } => metric.need_sorted(),
            Computation::Distincts { window, .. } => *window > 1,
            Computation::Percentiles { .. } => true,
            Computation::SumAcross { metric, filter, .. }
            | Computation::FieldExtreme { metric, filter, .. } => {
                metric.need_sorted() || filter.as_ref().map_or(false, AggregateFilter::need_sorted)
            }
            Computation::Bootstrap { metric, filter, .. } => {
                metric.need_sorted() || filter.as_ref().map_or(false, AggregateFilter::need_sorted)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Drop documents failing a per-dataset filter
    FilterDocs { per_dataset: BTreeMap<String, DocFilter> },
    ApplyActions { actions: Vec<Action> },
    ExplodeByField {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<usize>,
        metric: Option<AggregateMetric>,
        with_default: bool,
    },
    ExplodeFieldIn {
        field: FieldSet,
        terms: Vec<Term>,
        with_default: bool,
    },
    ExplodeMetric {
        scope: Scope,
        metric: DocMetric,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
    },
    /// Buckets `[start + i * period, start + (i + 1) * period)` up to `end`
    ExplodeTime {
        field: FieldSet,
        start: i64,
        end: i64,
        period_seconds: i64,
    },
    /// Buckets between consecutive boundaries
    ExplodeTimeRanges { field: FieldSet, boundaries: Vec<i64> },
    ExplodeDayOfWeek { field: FieldSet },
    ExplodeQuantiles { field: FieldSet, num_buckets: usize },
    ExplodePredicate { scope: Scope, filter: DocFilter },
    ComputeAndCreateGroupStatsLookup { name: String, computation: Computation },
    RegroupIntoParent { merge: MergeType },
    ApplyGroupFilter { filter: AggregateFilter },
    GetGroupStats { metrics: Vec<AggregateMetric> },
    /// A final explode fused with the final stats: rows are produced per
    /// term without building the last grouping level
    SimpleIterate {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<usize>,
        metric: Option<AggregateMetric>,
        selects: Vec<AggregateMetric>,
    },
    SampleFields { fields: Vec<(FieldSet, usize)> },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::FilterDocs { .. } => "FILTER_DOCS",
            Command::ApplyActions { .. } => "APPLY_ACTIONS",
            Command::ExplodeByField { .. } => "EXPLODE_BY_FIELD",
            Command::ExplodeFieldIn { .. } => "EXPLODE_FIELD_IN",
            Command::ExplodeMetric { .. } => "EXPLODE_METRIC",
            Command::ExplodeTime { .. } => "EXPLODE_TIME",
            Command::ExplodeTimeRanges { .. } => "EXPLODE_TIME_RANGES",
            Command::ExplodeDayOfWeek { .. } => "EXPLODE_DAY_OF_WEEK",
            Command::ExplodeQuantiles { .. } => "EXPLODE_QUANTILES",
            Command::ExplodePredicate { .. } => "EXPLODE_PREDICATE",
            Command::ComputeAndCreateGroupStatsLookup { .. } => "COMPUTE_AND_CREATE_LOOKUP",
            Command::RegroupIntoParent { .. } => "REGROUP_INTO_PARENT",
            Command::ApplyGroupFilter { .. } => "APPLY_GROUP_FILTER",
            Command::GetGroupStats { .. } => "GET_GROUP_STATS",
            Command::SimpleIterate { .. } => "SIMPLE_ITERATE",
            Command::SampleFields { .. } => "SAMPLE_FIELDS",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        match self {
            Command::ApplyActions { actions } => write!(f, " ({} actions)", actions.len()),
            Command::ExplodeByField {
                field, limit, ..
            }
            | Command::SimpleIterate {
                field, limit, ..
            } => {
                write!(f, " {}", field.name())?;
                match limit {
                    Some(limit) => write!(f, " top {}", limit),
                    None => Ok(()),
                }
            }
            Command::ExplodeFieldIn { field, terms, .. } => {
                write!(f, " {} ({} terms)", field.name(), terms.len())
            }
            Command::ExplodeTime {
                field,
                period_seconds,
                ..
            } => write!(f, " {} every {}s", field.name(), period_seconds),
            Command::ExplodeTimeRanges { field, boundaries } => write!(
                f,
                " {} ({} ranges)",
                field.name(),
                boundaries.len().saturating_sub(1)
            ),
            Command::ComputeAndCreateGroupStatsLookup { name, computation } => {
                write!(f, " {} = {}", name, computation.kind())
            }
            Command::RegroupIntoParent { merge } => write!(f, " {}", merge.as_str()),
            Command::ApplyGroupFilter { filter } => write!(f, " {}", filter),
            Command::GetGroupStats { metrics } => write!(f, " ({} metrics)", metrics.len()),
            _ => Ok(()),
        }
    }
}
