//! Scope and shape validation
//!
//! Runs before staging. Every qualified sub-expression must name a subset of
//! the scope enclosing it, and group-bys must describe a finite, non-empty
//! split.

use crate::language::{
    AggregateFilter, AggregateMetric, CompileError, CompileResult, DocFilter, DocMetric, GroupBy,
    Query, Scope,
};

/// Validate a resolved query
pub fn validate(query: &Query) -> CompileResult<()> {
    let scope = query.scope();

    for dataset in &query.datasets {
        if dataset.start > dataset.end {
            return Err(CompileError::structural(format!(
                "dataset '{}' ends before it starts",
                dataset.display_name()
            )));
        }
        if let Some(filter) = &dataset.filter {
            let own: Scope = [dataset.display_name().to_string()].into_iter().collect();
            doc_filter(filter, &own)?;
        }
    }
    if let Some(filter) = &query.filter {
        doc_filter(filter, &scope)?;
    }
    for entry in &query.group_bys {
        group_by(&entry.group_by, &scope)?;
        if let Some(filter) = &entry.filter {
            aggregate_filter(filter, &scope)?;
        }
    }
    for select in &query.selects {
        metric(select, &scope)?;
    }
    Ok(())
}

fn subset(inner: &Scope, outer: &Scope) -> CompileResult<()> {
    if inner.is_subset(outer) {
        Ok(())
    } else {
        Err(CompileError::scope(format!(
            "scope {:?} is not a subset of the enclosing scope {:?}",
            inner, outer
        )))
    }
}

fn contains(dataset: &str, scope: &Scope) -> CompileResult<()> {
    if scope.contains(dataset) {
        Ok(())
    } else {
        Err(CompileError::scope(format!(
            "dataset '{}' is outside the enclosing scope {:?}",
            dataset, scope
        )))
    }
}

fn metric(m: &AggregateMetric, scope: &Scope) -> CompileResult<()> {
    match m {
        AggregateMetric::Qualified { scope: inner, metric: m } => {
            subset(inner, scope)?;
            metric(m, inner)
        }
        AggregateMetric::DocStats(d) => doc_metric(d, scope),
        AggregateMetric::DocStatsPushes { dataset, metric: d } => {
            contains(dataset, scope)?;
            doc_metric(d, scope)
        }
        AggregateMetric::Add(ms) | AggregateMetric::Min(ms) | AggregateMetric::Max(ms) => {
            ms.iter().try_for_each(|m| metric(m, scope))
        }
        AggregateMetric::Binary { left, right, .. } => {
            metric(left, scope)?;
            metric(right, scope)
        }
        AggregateMetric::Negate(m)
        | AggregateMetric::Abs(m)
        | AggregateMetric::Log(m)
        | AggregateMetric::Parent(m)
        | AggregateMetric::Lag { metric: m, .. }
        | AggregateMetric::IterateLag { metric: m, .. }
        | AggregateMetric::Window { metric: m, .. }
        | AggregateMetric::Running(m)
        | AggregateMetric::DivideByCount(m)
        | AggregateMetric::Named { metric: m, .. } => metric(m, scope),
        AggregateMetric::Distinct { filter, window, .. } => {
            if *window == Some(0) {
                return Err(CompileError::structural("DISTINCT window must be positive"));
            }
            filter.as_deref().map_or(Ok(()), |f| aggregate_filter(f, scope))
        }
        AggregateMetric::SumAcross { group_by: g, metric: m } => {
            group_by(g, scope)?;
            metric(m, scope)
        }
        AggregateMetric::FieldMin { metric: m, filter, .. }
        | AggregateMetric::FieldMax { metric: m, filter, .. } => {
            if let Some(m) = m {
                metric(m, scope)?;
            }
            filter.as_deref().map_or(Ok(()), |f| aggregate_filter(f, scope))
        }
        AggregateMetric::Bootstrap {
            filter, metric: m, ..
        } => {
            metric(m, scope)?;
            filter.as_deref().map_or(Ok(()), |f| aggregate_filter(f, scope))
        }
        AggregateMetric::IfThenElse {
            condition,
            then,
            otherwise,
        } => {
            aggregate_filter(condition, scope)?;
            metric(then, scope)?;
            metric(otherwise, scope)
        }
        AggregateMetric::Percentile { percentile, .. } => {
            if (0.0..=100.0).contains(percentile) {
                Ok(())
            } else {
                Err(CompileError::structural(format!(
                    "percentile {} is outside [0, 100]",
                    percentile
                )))
            }
        }
        AggregateMetric::Constant(_)
        | AggregateMetric::GroupStatsLookup(_)
        | AggregateMetric::GroupStatsMultiLookup(_) => Ok(()),
    }
}

fn aggregate_filter(f: &AggregateFilter, scope: &Scope) -> CompileResult<()> {
    match f {
        AggregateFilter::Compare { left, right, .. } => {
            metric(left, scope)?;
            metric(right, scope)
        }
        AggregateFilter::And(a, b) | AggregateFilter::Or(a, b) => {
            aggregate_filter(a, scope)?;
            aggregate_filter(b, scope)
        }
        AggregateFilter::Not(f) => aggregate_filter(f, scope),
        _ => Ok(()),
    }
}

fn doc_metric(m: &DocMetric, scope: &Scope) -> CompileResult<()> {
    match m {
        DocMetric::Qualified { dataset, metric } => {
            contains(dataset, scope)?;
            let inner: Scope = [dataset.clone()].into_iter().collect();
            doc_metric(metric, &inner)
        }
        DocMetric::PerDataset(map) => map.iter().try_for_each(|(dataset, m)| {
            contains(dataset, scope)?;
            let inner: Scope = [dataset.clone()].into_iter().collect();
            doc_metric(m, &inner)
        }),
        DocMetric::Negate(m)
        | DocMetric::Abs(m)
        | DocMetric::Signum(m)
        | DocMetric::Log { metric: m, .. }
        | DocMetric::Exponentiate { metric: m, .. } => doc_metric(m, scope),
        DocMetric::Add(ms) => ms.iter().try_for_each(|m| doc_metric(m, scope)),
        DocMetric::Arith { left, right, .. } | DocMetric::Compare { left, right, .. } => {
            doc_metric(left, scope)?;
            doc_metric(right, scope)
        }
        DocMetric::IfThenElse {
            condition,
            then,
            otherwise,
        } => {
            doc_filter(condition, scope)?;
            doc_metric(then, scope)?;
            doc_metric(otherwise, scope)
        }
        _ => Ok(()),
    }
}

fn doc_filter(f: &DocFilter, scope: &Scope) -> CompileResult<()> {
    match f {
        DocFilter::Qualified { scope: inner, filter } => {
            subset(inner, scope)?;
            doc_filter(filter, inner)
        }
        DocFilter::Compare { left, right, .. } => {
            doc_metric(left, scope)?;
            doc_metric(right, scope)
        }
        DocFilter::And(a, b) | DocFilter::Or(a, b) => {
            doc_filter(a, scope)?;
            doc_filter(b, scope)
        }
        DocFilter::Not(f) => doc_filter(f, scope),
        DocFilter::Sample {
            numerator,
            denominator,
            ..
        } => {
            if *denominator == 0 || numerator > denominator {
                Err(CompileError::structural(format!(
                    "SAMPLE ratio {}/{} is not a probability",
                    numerator, denominator
                )))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

fn group_by(g: &GroupBy, scope: &Scope) -> CompileResult<()> {
    match g {
        GroupBy::ByField { filter, metric: m, limit, .. } => {
            if *limit == Some(0) {
                return Err(CompileError::structural("group-by limit must be positive"));
            }
            if let Some(f) = filter {
                aggregate_filter(f, scope)?;
            }
            m.as_ref().map_or(Ok(()), |m| metric(m, scope))
        }
        GroupBy::ByMetric {
            metric: m,
            min,
            max,
            interval,
            ..
        } => {
            if *interval <= 0 || max <= min {
                return Err(CompileError::structural(format!(
                    "bucket range [{}, {}) with interval {} is empty",
                    min, max, interval
                )));
            }
            doc_metric(m, scope)
        }
        GroupBy::ByTime { period_seconds, .. } if *period_seconds <= 0 => Err(
            CompileError::structural("time bucket period must be positive"),
        ),
        GroupBy::ByTimeBuckets { num_buckets: 0, .. } | GroupBy::ByQuantiles { num_buckets: 0, .. } => {
            Err(CompileError::structural("bucket count must be positive"))
        }
        GroupBy::ByPredicate(f) => doc_filter(f, scope),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{scope_of, Dataset, FieldSet, QueryBuilder};
    use chrono::{TimeZone, Utc};

    fn builder() -> QueryBuilder {
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        QueryBuilder::new()
            .from(Dataset::new("a", day(1), day(2)))
            .from(Dataset::new("b", day(1), day(2)))
    }

    #[test]
    fn test_nested_qualified_must_narrow() {
        let country = FieldSet::string("country", &["a", "b"]);
        let ok = DocFilter::Qualified {
            scope: scope_of(["a", "b"]),
            filter: Box::new(DocFilter::Qualified {
                scope: scope_of(["a"]),
                filter: Box::new(DocFilter::field_is(country.clone(), "us")),
            }),
        };
        assert!(validate(&builder().filter(ok).build().unwrap()).is_ok());

        let widened = DocFilter::Qualified {
            scope: scope_of(["a"]),
            filter: Box::new(DocFilter::Qualified {
                scope: scope_of(["a", "b"]),
                filter: Box::new(DocFilter::field_is(country, "us")),
            }),
        };
        let err = validate(&builder().filter(widened).build().unwrap()).unwrap_err();
        assert!(matches!(err, CompileError::Scope(_)));
    }

    #[test]
    fn test_qualified_doc_metric_outside_scope() {
        let metric = AggregateMetric::Qualified {
            scope: scope_of(["a"]),
            metric: Box::new(AggregateMetric::doc_stats(DocMetric::qualified(
                "b",
                DocMetric::Count,
            ))),
        };
        let err = validate(&builder().select(vec![metric]).build().unwrap()).unwrap_err();
        assert!(matches!(err, CompileError::Scope(_)));
    }

    #[test]
    fn test_empty_bucket_range_rejected() {
        let g = GroupBy::ByMetric {
            metric: DocMetric::Field(FieldSet::int("x", &["a"])),
            min: 10,
            max: 10,
            interval: 1,
            exclude_gutters: false,
            with_default: false,
        };
        let err = validate(&builder().group_by(g).build().unwrap()).unwrap_err();
        assert!(matches!(err, CompileError::Structural(_)));
    }

    #[test]
    fn test_sample_ratio_checked() {
        let sample = DocFilter::Sample {
            field: FieldSet::string("user", &["a"]),
            numerator: 3,
            denominator: 2,
            seed: "x".into(),
        };
        assert!(validate(&builder().filter(sample).build().unwrap()).is_err());
    }
}
