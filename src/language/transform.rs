//! Uniform rewrite contract shared by every expression family
//!
//! `transform` is a full bottom-up rewrite: every node of every family is
//! rebuilt from its rewritten children and then handed to the matching
//! `Rewriter` callback. `traverse1` (on `AggregateMetric`, `AggregateFilter`
//! and `GroupBy`) is shallow: it only applies a callback at the next
//! `AggregateMetric` positions and leaves recursion to the callback.

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::AggregateMetric;
use super::doc_filter::DocFilter;
use super::doc_metric::DocMetric;
use super::errors::CompileResult;
use super::group_by::GroupBy;

/// Node callbacks for `transform`. Every method defaults to identity.
pub trait Rewriter {
    fn group_by(&mut self, group_by: GroupBy) -> CompileResult<GroupBy> {
        Ok(group_by)
    }

    fn metric(&mut self, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        Ok(metric)
    }

    fn doc_metric(&mut self, metric: DocMetric) -> CompileResult<DocMetric> {
        Ok(metric)
    }

    fn filter(&mut self, filter: AggregateFilter) -> CompileResult<AggregateFilter> {
        Ok(filter)
    }

    fn doc_filter(&mut self, filter: DocFilter) -> CompileResult<DocFilter> {
        Ok(filter)
    }
}

/// Callback type for `traverse1`
pub type MetricFn<'a> = dyn FnMut(AggregateMetric) -> CompileResult<AggregateMetric> + 'a;

/// Rewriter that only looks at aggregate metrics
pub struct MetricRewriter<F>(pub F);

impl<F> Rewriter for MetricRewriter<F>
where
    F: FnMut(AggregateMetric) -> CompileResult<AggregateMetric>,
{
    fn metric(&mut self, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        (self.0)(metric)
    }
}

/// Rewriter that only looks at document metrics
pub struct DocMetricRewriter<F>(pub F);

impl<F> Rewriter for DocMetricRewriter<F>
where
    F: FnMut(DocMetric) -> CompileResult<DocMetric>,
{
    fn doc_metric(&mut self, metric: DocMetric) -> CompileResult<DocMetric> {
        (self.0)(metric)
    }
}

pub(crate) fn transform_box<T>(
    value: Box<T>,
    f: impl FnOnce(T) -> CompileResult<T>,
) -> CompileResult<Box<T>> {
    f(*value).map(Box::new)
}

pub(crate) fn transform_opt<T>(
    value: Option<T>,
    f: impl FnOnce(T) -> CompileResult<T>,
) -> CompileResult<Option<T>> {
    value.map(f).transpose()
}

pub(crate) fn transform_vec<T>(
    values: Vec<T>,
    mut f: impl FnMut(T) -> CompileResult<T>,
) -> CompileResult<Vec<T>> {
    values.into_iter().map(&mut f).collect()
}
