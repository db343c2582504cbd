//! Step to command lowering
//!
//! Most steps map to one command. Precomputed values that need their own
//! grouping level (filtered DISTINCT, SUM_OVER a group-by) expand into
//! explode, store, regroup-into-parent sequences.

use chrono::{Datelike, Months, TimeZone, Utc};

use crate::language::{AggregateFilter, AggregateMetric, CompileError, CompileResult, DocMetric, Scope};
use crate::passes::Precomputed;

use super::command::{Command, Computation, MergeType};
use super::planner::{explode_step, QueryPlan};
use super::step::ExecutionStep;

/// Lowering switches
#[derive(Debug, Clone, Copy)]
pub struct LowerOptions {
    /// Fuse a trailing explode-by-field and the final stats into one pass
    pub optimize_last_iterate: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            optimize_last_iterate: true,
        }
    }
}

/// Lower every step of `plan` into commands
pub fn lower(plan: &QueryPlan, options: LowerOptions) -> CompileResult<Vec<Command>> {
    let time_range = plan
        .query
        .time_range()
        .map(|(start, end)| (start.timestamp(), end.timestamp()))
        .ok_or_else(|| CompileError::structural("query has no datasets"))?;

    let mut steps: &[ExecutionStep] = &plan.steps;
    let mut fused = None;
    if options.optimize_last_iterate {
        if let [rest @ .., ExecutionStep::ExplodeAndRegroup {
            field,
            filter,
            limit,
            metric,
            with_default: false,
        }, ExecutionStep::GetGroupStats { metrics }] = steps
        {
            fused = Some(Command::SimpleIterate {
                field: field.clone(),
                filter: filter.clone(),
                limit: *limit,
                metric: metric.clone(),
                selects: metrics.clone(),
            });
            steps = rest;
        }
    }

    let mut commands = Vec::with_capacity(steps.len() + 1);
    for step in steps {
        lower_step(step, time_range, &mut commands)?;
    }
    commands.extend(fused);
    Ok(commands)
}

fn lower_step(step: &ExecutionStep, time_range: (i64, i64), out: &mut Vec<Command>) -> CompileResult<()> {
    match step.clone() {
        ExecutionStep::FilterDocs { per_dataset } => out.push(Command::FilterDocs { per_dataset }),
        ExecutionStep::SampleDocs { actions } | ExecutionStep::FilterActions { actions } => {
            out.push(Command::ApplyActions { actions })
        }
        ExecutionStep::ExplodeAndRegroup {
            field,
            filter,
            limit,
            metric,
            with_default,
        } => out.push(Command::ExplodeByField {
            field,
            filter,
            limit,
            metric,
            with_default,
        }),
        ExecutionStep::ExplodeFieldIn {
            field,
            terms,
            with_default,
        } => out.push(Command::ExplodeFieldIn {
            field,
            terms,
            with_default,
        }),
        ExecutionStep::ExplodeMetric {
            scope,
            metric,
            min,
            max,
            interval,
            exclude_gutters,
            with_default,
        } => out.push(Command::ExplodeMetric {
            scope,
            metric,
            min,
            max,
            interval,
            exclude_gutters,
            with_default,
        }),
        ExecutionStep::ExplodeTime {
            field,
            period_seconds,
            start,
            end,
        } => out.push(Command::ExplodeTime {
            field,
            start,
            end,
            period_seconds,
        }),
        ExecutionStep::ExplodeTimeBuckets {
            field,
            num_buckets,
            start,
            end,
        } => {
            let span = (end - start).max(1);
            let buckets = num_buckets.max(1) as i64;
            out.push(Command::ExplodeTime {
                field,
                start,
                end,
                period_seconds: (span + buckets - 1) / buckets,
            })
        }
        ExecutionStep::ExplodeMonthOfYear { field, start, end } => out.push(Command::ExplodeTimeRanges {
            field,
            boundaries: month_boundaries(start, end)?,
        }),
        ExecutionStep::ExplodeDayOfWeek { field } => out.push(Command::ExplodeDayOfWeek { field }),
        ExecutionStep::ExplodeQuantiles { field, num_buckets } => {
            out.push(Command::ExplodeQuantiles { field, num_buckets })
        }
        ExecutionStep::ExplodePredicate { scope, filter } => {
            out.push(Command::ExplodePredicate { scope, filter })
        }
        ExecutionStep::ComputePrecomputed {
            scope,
            precomputed,
            name,
        } => lower_precomputed(scope, precomputed, name, time_range, out)?,
        ExecutionStep::FilterGroups { filter } => out.push(Command::ApplyGroupFilter { filter }),
        ExecutionStep::GetGroupStats { metrics } => out.push(Command::GetGroupStats { metrics }),
        ExecutionStep::SampleFields { fields } => out.push(Command::SampleFields { fields }),
    }
    Ok(())
}

fn store(name: String, computation: Computation) -> Command {
    Command::ComputeAndCreateGroupStatsLookup { name, computation }
}

fn lower_precomputed(
    scope: Scope,
    precomputed: Precomputed,
    name: String,
    time_range: (i64, i64),
    out: &mut Vec<Command>,
) -> CompileResult<()> {
    match precomputed {
        Precomputed::Distinct {
            field,
            filter: Some(filter),
            ..
        } => {
            out.push(Command::ExplodeByField {
                field: field.restrict(&scope),
                filter: Some(filter),
                limit: None,
                metric: None,
                with_default: true,
            });
            // the default child keeps the documents of filtered-out terms
            out.push(store(
                name,
                Computation::GroupStats {
                    metric: AggregateMetric::if_then_else(
                        AggregateFilter::IsDefaultGroup,
                        AggregateMetric::Constant(0.0),
                        AggregateMetric::Constant(1.0),
                    ),
                },
            ));
            out.push(Command::RegroupIntoParent {
                merge: MergeType::SumAll,
            });
        }
        Precomputed::Distinct {
            field,
            filter: None,
            window,
        } => out.push(store(
            name,
            Computation::Distincts {
                scope,
                field,
                window: window.unwrap_or(1),
            },
        )),
        Precomputed::Percentile { field, percentile } => out.push(store(
            name,
            Computation::Percentiles {
                scope,
                field,
                percentile,
            },
        )),
        Precomputed::SumAcrossField {
            field,
            metric,
            filter,
        } => out.push(store(
            name,
            Computation::SumAcross {
                scope,
                field,
                metric,
                filter,
            },
        )),
        Precomputed::SumAcrossGroupBy { group_by, metric } => {
            let explode = explode_step(&group_by, &scope, time_range)?;
            lower_step(&explode, time_range, out)?;
            out.push(store(name, Computation::GroupStats { metric }));
            out.push(Command::RegroupIntoParent {
                merge: MergeType::SumAll,
            });
        }
        Precomputed::FieldMin {
            field,
            metric,
            filter,
        }
        | Precomputed::FieldMax {
            field,
            metric,
            filter,
        } => out.push(store(
            name,
            Computation::FieldExtreme {
                scope,
                field,
                metric,
                filter,
            },
        )),
        Precomputed::Bootstrap {
            field,
            filter,
            metric,
            num_bootstraps,
            seed,
            outputs,
        } => out.push(store(
            name,
            Computation::Bootstrap {
                scope,
                field,
                filter,
                metric,
                num_bootstraps,
                seed,
                outputs,
            },
        )),
        Precomputed::RawStats(doc_metric) => {
            out.push(store(
                name,
                Computation::GroupStats {
                    metric: raw_stats_metric(&doc_metric, &scope)?,
                },
            ));
        }
    }
    Ok(())
}

/// Per-dataset sum of `metric` over the datasets it applies to
fn raw_stats_metric(metric: &DocMetric, scope: &Scope) -> CompileResult<AggregateMetric> {
    let qualifications = metric.qualifications();
    let datasets = match qualifications.len() {
        0 => scope.clone(),
        1 => qualifications,
        _ => {
            return Err(CompileError::scope(format!(
                "document metric {} is qualified by several datasets",
                metric
            )))
        }
    };
    Ok(AggregateMetric::add(
        datasets
            .into_iter()
            .map(|dataset| AggregateMetric::DocStatsPushes {
                dataset,
                metric: metric.clone(),
            })
            .collect(),
    ))
}

/// Month starts from the month containing `start` up to the first one at or
/// after `end`
fn month_boundaries(start: i64, end: i64) -> CompileResult<Vec<i64>> {
    let invalid = || CompileError::structural(format!("invalid time range [{}, {})", start, end));
    let first = Utc.timestamp_opt(start, 0).single().ok_or_else(invalid)?;
    let mut month = Utc
        .with_ymd_and_hms(first.year(), first.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;

    let mut boundaries = vec![month.timestamp()];
    while month.timestamp() < end {
        month = month.checked_add_months(Months::new(1)).ok_or_else(invalid)?;
        boundaries.push(month.timestamp());
    }
    if boundaries.len() < 2 {
        boundaries.push(boundaries[0] + 1);
    }
    Ok(boundaries)
}
