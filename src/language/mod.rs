//! Expression IR for grouped aggregation queries
//!
//! Five closed expression families make up a query:
//!
//! - `DocMetric`: per-document arithmetic, compiled to push programs
//! - `DocFilter`: per-document predicates
//! - `AggregateMetric`: per-group values
//! - `AggregateFilter`: per-group predicates
//! - `GroupBy`: how a group splits into children
//!
//! Every family supports `transform` (full bottom-up rewrite through a
//! `Rewriter`). Aggregate metrics, aggregate filters and group-bys also
//! support `traverse1` (shallow rewrite of the nearest aggregate metrics).
//!
//! Field names are resolved before a query reaches this layer; `FieldSet`
//! carries the per-dataset physical name of every referenced field.

mod aggregate_filter;
mod aggregate_metric;
mod doc_filter;
mod doc_metric;
mod errors;
mod field;
mod group_by;
mod push;
mod query;
mod term;
mod transform;

pub use aggregate_filter::AggregateFilter;
pub use aggregate_metric::{AggOp, AggregateMetric, BootstrapOutput};
pub use doc_filter::DocFilter;
pub use doc_metric::{ArithOp, CompareOp, DocMetric};
pub use errors::{CompileError, CompileResult};
pub use field::{scope_of, DatasetSchema, FieldResolver, FieldSet, SchemaResolver, Scope};
pub use group_by::{GroupBy, DEFAULT_TIME_FIELD};
pub use push::{PushOp, QualifiedPush};
pub use query::{Dataset, GroupByEntry, Query, QueryBuilder};
pub use term::Term;
pub use transform::{DocMetricRewriter, MetricFn, MetricRewriter, Rewriter};
