//! Execution steps
//!
//! The intermediate plan between a staged query and wire commands. Steps
//! still speak in query terms (group-bys, filters, precomputed values);
//! lowering turns each into one or more commands.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::language::{
    AggregateFilter, AggregateMetric, DocFilter, DocMetric, FieldSet, Scope, Term,
};
use crate::passes::Precomputed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionStep {
    /// Per-dataset document filters from the dataset list
    FilterDocs { per_dataset: BTreeMap<String, DocFilter> },
    /// Sampling lifted off the where clause
    SampleDocs { actions: Vec<Action> },
    /// Routing actions of the where clause
    FilterActions { actions: Vec<Action> },
    ExplodeAndRegroup {
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
    /// Fixed-width time buckets; times are unix seconds
    ExplodeTime {
        field: FieldSet,
        period_seconds: i64,
        start: i64,
        end: i64,
    },
    ExplodeTimeBuckets {
        field: FieldSet,
        num_buckets: usize,
        start: i64,
        end: i64,
    },
    ExplodeMonthOfYear { field: FieldSet, start: i64, end: i64 },
    ExplodeDayOfWeek { field: FieldSet },
    ExplodeQuantiles { field: FieldSet, num_buckets: usize },
    /// Binary split: children are `false` then `true`
    ExplodePredicate { scope: Scope, filter: DocFilter },
    ComputePrecomputed {
        scope: Scope,
        precomputed: Precomputed,
        name: String,
    },
    FilterGroups { filter: AggregateFilter },
    GetGroupStats { metrics: Vec<AggregateMetric> },
    SampleFields { fields: Vec<(FieldSet, usize)> },
}

impl ExecutionStep {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionStep::FilterDocs { .. } => "FILTER_DOCS",
            ExecutionStep::SampleDocs { .. } => "SAMPLE_DOCS",
            ExecutionStep::FilterActions { .. } => "FILTER_ACTIONS",
            ExecutionStep::ExplodeAndRegroup { .. } => "EXPLODE_AND_REGROUP",
            ExecutionStep::ExplodeFieldIn { .. } => "EXPLODE_FIELD_IN",
            ExecutionStep::ExplodeMetric { .. } => "EXPLODE_METRIC",
            ExecutionStep::ExplodeTime { .. } => "EXPLODE_TIME",
            ExecutionStep::ExplodeTimeBuckets { .. } => "EXPLODE_TIME_BUCKETS",
            ExecutionStep::ExplodeMonthOfYear { .. } => "EXPLODE_MONTH_OF_YEAR",
            ExecutionStep::ExplodeDayOfWeek { .. } => "EXPLODE_DAY_OF_WEEK",
            ExecutionStep::ExplodeQuantiles { .. } => "EXPLODE_QUANTILES",
            ExecutionStep::ExplodePredicate { .. } => "EXPLODE_PREDICATE",
            ExecutionStep::ComputePrecomputed { .. } => "COMPUTE_PRECOMPUTED",
            ExecutionStep::FilterGroups { .. } => "FILTER_GROUPS",
            ExecutionStep::GetGroupStats { .. } => "GET_GROUP_STATS",
            ExecutionStep::SampleFields { .. } => "SAMPLE_FIELDS",
        }
    }

    /// Whether this step adds a grouping level
    pub fn is_explode(&self) -> bool {
        matches!(
            self,
            ExecutionStep::ExplodeAndRegroup { .. }
                | ExecutionStep::ExplodeFieldIn { .. }
                | ExecutionStep::ExplodeMetric { .. }
                | ExecutionStep::ExplodeTime { .. }
                | ExecutionStep::ExplodeTimeBuckets { .. }
                | ExecutionStep::ExplodeMonthOfYear { .. }
                | ExecutionStep::ExplodeDayOfWeek { .. }
                | ExecutionStep::ExplodeQuantiles { .. }
                | ExecutionStep::ExplodePredicate { .. }
        )
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        match self {
            ExecutionStep::FilterDocs { per_dataset } => {
                let parts: Vec<String> = per_dataset
                    .iter()
                    .map(|(d, filter)| format!("{}: {}", d, filter))
                    .collect();
                write!(f, " {{{}}}", parts.join(", "))
            }
            ExecutionStep::SampleDocs { actions } | ExecutionStep::FilterActions { actions } => {
                write!(f, " [{}]", join(actions))
            }
            ExecutionStep::ExplodeAndRegroup {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => {
                write!(f, " {}", field.name())?;
                if let Some(limit) = limit {
                    write!(f, " top {}", limit)?;
                }
                if let Some(metric) = metric {
                    write!(f, " by {}", metric)?;
                }
                if let Some(filter) = filter {
                    write!(f, " having {}", filter)?;
                }
                if *with_default {
                    write!(f, " with default")?;
                }
                Ok(())
            }
            ExecutionStep::ExplodeFieldIn {
                field,
                terms,
                with_default,
            } => {
                write!(f, " {} in ({})", field.name(), join(terms))?;
                if *with_default {
                    write!(f, " with default")?;
                }
                Ok(())
            }
            ExecutionStep::ExplodeMetric {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
                ..
            } => write!(
                f,
                " {} [{}, {}) step {}{}{}",
                metric,
                min,
                max,
                interval,
                if *exclude_gutters { " no gutters" } else { "" },
                if *with_default { " with default" } else { "" }
            ),
            ExecutionStep::ExplodeTime {
                field,
                period_seconds,
                start,
                end,
            } => write!(f, " {} every {}s in [{}, {})", field.name(), period_seconds, start, end),
            ExecutionStep::ExplodeTimeBuckets {
                field,
                num_buckets,
                start,
                end,
            } => write!(f, " {} into {} in [{}, {})", field.name(), num_buckets, start, end),
            ExecutionStep::ExplodeMonthOfYear { field, start, end } => {
                write!(f, " {} in [{}, {})", field.name(), start, end)
            }
            ExecutionStep::ExplodeDayOfWeek { field } => write!(f, " {}", field.name()),
            ExecutionStep::ExplodeQuantiles { field, num_buckets } => {
                write!(f, " {} into {}", field.name(), num_buckets)
            }
            ExecutionStep::ExplodePredicate { filter, .. } => write!(f, " {}", filter),
            ExecutionStep::ComputePrecomputed {
                precomputed, name, ..
            } => write!(f, " {} = {}", name, precomputed),
            ExecutionStep::FilterGroups { filter } => write!(f, " {}", filter),
            ExecutionStep::GetGroupStats { metrics } => write!(f, " [{}]", join(metrics)),
            ExecutionStep::SampleFields { fields } => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|(field, n)| format!("{} x{}", field.name(), n))
                    .collect();
                write!(f, " [{}]", parts.join(", "))
            }
        }
    }
}
