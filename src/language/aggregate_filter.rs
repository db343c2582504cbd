//! Per-group aggregate filters

use std::fmt;

use serde::{Deserialize, Serialize};

use super::aggregate_metric::AggregateMetric;
use super::doc_metric::CompareOp;
use super::errors::CompileResult;
use super::field::FieldSet;
use super::term::Term;
use super::transform::{transform_box, MetricFn, Rewriter};

/// A boolean predicate over groups (or over terms while iterating a field)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateFilter {
    /// The current term, or the group's own label outside iteration
    TermIs(Term),
    TermRegex(String),
    Compare {
        op: CompareOp,
        left: AggregateMetric,
        right: AggregateMetric,
    },
    And(Box<AggregateFilter>, Box<AggregateFilter>),
    Or(Box<AggregateFilter>, Box<AggregateFilter>),
    Not(Box<AggregateFilter>),
    Regex { field: FieldSet, regex: String },
    Always,
    Never,
    /// True for the default (gutter) bucket of the latest explode
    IsDefaultGroup,
}

impl AggregateFilter {
    pub fn compare(op: CompareOp, left: AggregateMetric, right: AggregateMetric) -> Self {
        AggregateFilter::Compare { op, left, right }
    }

    pub fn and(left: AggregateFilter, right: AggregateFilter) -> Self {
        AggregateFilter::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: AggregateFilter, right: AggregateFilter) -> Self {
        AggregateFilter::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: AggregateFilter) -> Self {
        AggregateFilter::Not(Box::new(filter))
    }

    /// Whether any metric in the filter needs a dedicated full pass
    pub fn needs_precomputation(&self) -> bool {
        let mut found = false;
        self.visit_metrics(&mut |m: &AggregateMetric| found |= m.requires_ftgs());
        found
    }

    /// Calls `f` on every aggregate metric in the filter and below it
    pub fn visit_metrics(&self, f: &mut dyn FnMut(&AggregateMetric)) {
        match self {
            AggregateFilter::Compare { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            AggregateFilter::And(a, b) | AggregateFilter::Or(a, b) => {
                a.visit_metrics(f);
                b.visit_metrics(f);
            }
            AggregateFilter::Not(x) => x.visit_metrics(f),
            _ => {}
        }
    }

    pub fn need_sorted(&self) -> bool {
        match self {
            AggregateFilter::Compare { left, right, .. } => left.need_sorted() || right.need_sorted(),
            AggregateFilter::And(a, b) | AggregateFilter::Or(a, b) => a.need_sorted() || b.need_sorted(),
            AggregateFilter::Not(f) => f.need_sorted(),
            _ => false,
        }
    }

    /// Full bottom-up rewrite
    pub fn transform(self, r: &mut dyn Rewriter) -> CompileResult<AggregateFilter> {
        let rebuilt = match self {
            AggregateFilter::Compare { op, left, right } => AggregateFilter::Compare {
                op,
                left: left.transform(r)?,
                right: right.transform(r)?,
            },
            AggregateFilter::And(a, b) => AggregateFilter::And(
                transform_box(a, |f| f.transform(r))?,
                transform_box(b, |f| f.transform(r))?,
            ),
            AggregateFilter::Or(a, b) => AggregateFilter::Or(
                transform_box(a, |f| f.transform(r))?,
                transform_box(b, |f| f.transform(r))?,
            ),
            AggregateFilter::Not(f) => AggregateFilter::Not(transform_box(f, |f| f.transform(r))?),
            leaf => leaf,
        };
        r.filter(rebuilt)
    }

    /// Applies `f` to the metrics directly compared by this filter tree
    pub fn traverse1(self, f: &mut MetricFn<'_>) -> CompileResult<AggregateFilter> {
        Ok(match self {
            AggregateFilter::Compare { op, left, right } => AggregateFilter::Compare {
                op,
                left: f(left)?,
                right: f(right)?,
            },
            AggregateFilter::And(a, b) => AggregateFilter::And(
                transform_box(a, |x| x.traverse1(f))?,
                transform_box(b, |x| x.traverse1(f))?,
            ),
            AggregateFilter::Or(a, b) => AggregateFilter::Or(
                transform_box(a, |x| x.traverse1(f))?,
                transform_box(b, |x| x.traverse1(f))?,
            ),
            AggregateFilter::Not(x) => AggregateFilter::Not(transform_box(x, |x| x.traverse1(f))?),
            leaf => leaf,
        })
    }
}

impl fmt::Display for AggregateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFilter::TermIs(term) => write!(f, "term()={}", term),
            AggregateFilter::TermRegex(regex) => write!(f, "term()=~\"{}\"", regex),
            AggregateFilter::Compare { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            AggregateFilter::And(a, b) => write!(f, "({} AND {})", a, b),
            AggregateFilter::Or(a, b) => write!(f, "({} OR {})", a, b),
            AggregateFilter::Not(x) => write!(f, "NOT({})", x),
            AggregateFilter::Regex { field, regex } => write!(f, "{}=~\"{}\"", field.name(), regex),
            AggregateFilter::Always => write!(f, "TRUE"),
            AggregateFilter::Never => write!(f, "FALSE"),
            AggregateFilter::IsDefaultGroup => write!(f, "is_default_group()"),
        }
    }
}
