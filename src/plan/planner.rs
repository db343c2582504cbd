//! Query planner
//!
//! Produces the ordered step list for a query:
//!
//! 1. Per-dataset document filters
//! 2. Sampling lifted off the where clause
//! 3. Where-clause routing actions
//! 4. For every depth `i`: pre-computations at `i`, the group-by at
//!    position `i`, post-computations at `i`, then its HAVING filter
//! 5. The final group stats, then term sampling
//!
//! Planning is deterministic: the same query always yields the same steps.

use std::collections::BTreeMap;

use crate::actions::compile_where;
use crate::language::{
    CompileError, CompileResult, FieldSet, GroupBy, Query, Scope, DEFAULT_TIME_FIELD,
};
use crate::passes::{
    extract_precomputed, validate, ComputationType, Extracted, NamedComputation,
};

use super::step::ExecutionStep;

/// Immutable plan (no runtime state)
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// The staged query every step was derived from
    pub query: Query,
    /// Named full-pass computations, in first-request order
    pub computations: Vec<NamedComputation>,
    pub steps: Vec<ExecutionStep>,
}

impl QueryPlan {
    /// Number of grouping levels the plan builds
    pub fn depth(&self) -> usize {
        self.query.group_bys.len()
    }

    pub fn computation(&self, name: &str) -> Option<&NamedComputation> {
        self.computations.iter().find(|c| c.name == name)
    }
}

/// Planner settings
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    coalesce_actions: bool,
}

impl QueryPlanner {
    pub fn new() -> Self {
        Self {
            coalesce_actions: true,
        }
    }

    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_actions = enabled;
        self
    }

    /// Plans a query, returning an immutable plan or the first compile error
    pub fn plan(&self, query: Query) -> CompileResult<QueryPlan> {
        validate(&query)?;
        let scope = query.scope();
        let (start, end) = query
            .time_range()
            .ok_or_else(|| CompileError::structural("query has no datasets"))?;
        let time_range = (start.timestamp(), end.timestamp());

        let Extracted {
            query,
            computations,
        } = extract_precomputed(query)?;

        let mut steps = Vec::new();

        let per_dataset: BTreeMap<String, _> = query
            .datasets
            .iter()
            .filter_map(|d| d.filter.clone().map(|f| (d.display_name().to_string(), f)))
            .collect();
        if !per_dataset.is_empty() {
            steps.push(ExecutionStep::FilterDocs { per_dataset });
        }

        let lowered = compile_where(query.filter.clone(), &scope, self.coalesce_actions)?;
        if !lowered.samples.is_empty() {
            steps.push(ExecutionStep::SampleDocs {
                actions: lowered.samples,
            });
        }
        if !lowered.actions.is_empty() {
            steps.push(ExecutionStep::FilterActions {
                actions: lowered.actions,
            });
        }

        let group_by_steps = query
            .group_bys
            .iter()
            .map(|entry| explode_step(&entry.group_by, &scope, time_range))
            .collect::<CompileResult<Vec<_>>>()?;

        let last = computations
            .iter()
            .map(|c| c.info.depth)
            .chain(group_by_steps.len().checked_sub(1))
            .max();
        if let Some(last) = last {
            for depth in 0..=last {
                steps.extend(computation_steps(&computations, depth, ComputationType::PreComputation));
                if let Some(step) = group_by_steps.get(depth) {
                    steps.push(step.clone());
                }
                steps.extend(computation_steps(&computations, depth, ComputationType::PostComputation));
                if let Some(filter) = query.group_bys.get(depth).and_then(|e| e.filter.clone()) {
                    steps.push(ExecutionStep::FilterGroups { filter });
                }
            }
        }

        steps.push(ExecutionStep::GetGroupStats {
            metrics: query.selects.clone(),
        });
        if !query.sample_fields.is_empty() {
            steps.push(ExecutionStep::SampleFields {
                fields: query.sample_fields.clone(),
            });
        }

        Ok(QueryPlan {
            query,
            computations,
            steps,
        })
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn computation_steps(
    computations: &[NamedComputation],
    depth: usize,
    kind: ComputationType,
) -> Vec<ExecutionStep> {
    computations
        .iter()
        .filter(|c| c.kind == kind && c.info.depth == depth)
        .map(|c| ExecutionStep::ComputePrecomputed {
            scope: c.info.scope.clone(),
            precomputed: c.info.precomputed.clone(),
            name: c.name.clone(),
        })
        .collect()
}

fn time_field(field: &Option<FieldSet>, scope: &Scope) -> FieldSet {
    field
        .clone()
        .unwrap_or_else(|| FieldSet::uniform(DEFAULT_TIME_FIELD, true, scope.iter().cloned()))
}

/// The explode step of one group-by
pub(crate) fn explode_step(
    group_by: &GroupBy,
    scope: &Scope,
    (start, end): (i64, i64),
) -> CompileResult<ExecutionStep> {
    Ok(match group_by.clone() {
        GroupBy::ByField {
            field,
            filter,
            limit,
            metric,
            with_default,
        } => ExecutionStep::ExplodeAndRegroup {
            field,
            filter,
            limit,
            metric,
            with_default,
        },
        GroupBy::ByFieldIn {
            field,
            terms,
            with_default,
        } => ExecutionStep::ExplodeFieldIn {
            field,
            terms,
            with_default,
        },
        GroupBy::ByMetric {
            metric,
            min,
            max,
            interval,
            exclude_gutters,
            with_default,
        } => ExecutionStep::ExplodeMetric {
            scope: scope.clone(),
            metric,
            min,
            max,
            interval,
            exclude_gutters,
            with_default,
        },
        GroupBy::ByTime {
            period_seconds,
            field,
        } => ExecutionStep::ExplodeTime {
            field: time_field(&field, scope),
            period_seconds,
            start,
            end,
        },
        GroupBy::ByTimeBuckets { num_buckets, field } => ExecutionStep::ExplodeTimeBuckets {
            field: time_field(&field, scope),
            num_buckets,
            start,
            end,
        },
        GroupBy::ByMonth { field } => ExecutionStep::ExplodeMonthOfYear {
            field: time_field(&field, scope),
            start,
            end,
        },
        GroupBy::ByDayOfWeek { field } => ExecutionStep::ExplodeDayOfWeek {
            field: time_field(&field, scope),
        },
        GroupBy::ByQuantiles { field, num_buckets } => {
            if !field.is_int() {
                return Err(CompileError::structural(format!(
                    "quantiles need an int field, '{}' is a string field",
                    field.name()
                )));
            }
            ExecutionStep::ExplodeQuantiles { field, num_buckets }
        }
        GroupBy::ByPredicate(filter) => ExecutionStep::ExplodePredicate {
            scope: scope.clone(),
            filter,
        },
    })
}
