//! Per-document filters

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::doc_metric::{CompareOp, DocMetric};
use super::errors::{CompileError, CompileResult};
use super::field::{FieldSet, Scope};
use super::term::Term;
use super::transform::{transform_box, Rewriter};

/// A boolean predicate over documents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocFilter {
    FieldIs { field: FieldSet, term: Term },
    FieldIsnt { field: FieldSet, term: Term },
    /// `lower <= field < upper`, or `<= upper` when `upper_inclusive`
    Between {
        field: FieldSet,
        lower: i64,
        upper: i64,
        upper_inclusive: bool,
    },
    Compare { op: CompareOp, left: DocMetric, right: DocMetric },
    And(Box<DocFilter>, Box<DocFilter>),
    Or(Box<DocFilter>, Box<DocFilter>),
    Not(Box<DocFilter>),
    Regex { field: FieldSet, regex: String },
    NotRegex { field: FieldSet, regex: String },
    Qualified { scope: Scope, filter: Box<DocFilter> },
    /// Keep roughly `numerator / denominator` of the terms of `field`,
    /// chosen deterministically from `seed`
    Sample {
        field: FieldSet,
        numerator: u64,
        denominator: u64,
        seed: String,
    },
    Lucene(String),
    FieldIn {
        field: FieldSet,
        terms: BTreeSet<Term>,
        negated: bool,
    },
    Always,
    Never,
}

impl DocFilter {
    pub fn field_is(field: FieldSet, term: impl Into<Term>) -> Self {
        DocFilter::FieldIs {
            field,
            term: term.into(),
        }
    }

    pub fn and(left: DocFilter, right: DocFilter) -> Self {
        DocFilter::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: DocFilter, right: DocFilter) -> Self {
        DocFilter::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: DocFilter) -> Self {
        DocFilter::Not(Box::new(filter))
    }

    /// Conjunction of all filters, `Always` when empty
    pub fn and_all(filters: Vec<DocFilter>) -> Self {
        filters
            .into_iter()
            .reduce(DocFilter::and)
            .unwrap_or(DocFilter::Always)
    }

    pub fn compare(op: CompareOp, left: DocMetric, right: DocMetric) -> Self {
        DocFilter::Compare { op, left, right }
    }

    /// Full bottom-up rewrite
    pub fn transform(self, r: &mut dyn Rewriter) -> CompileResult<DocFilter> {
        let rebuilt = match self {
            DocFilter::Compare { op, left, right } => DocFilter::Compare {
                op,
                left: left.transform(r)?,
                right: right.transform(r)?,
            },
            DocFilter::And(a, b) => DocFilter::And(
                transform_box(a, |f| f.transform(r))?,
                transform_box(b, |f| f.transform(r))?,
            ),
            DocFilter::Or(a, b) => DocFilter::Or(
                transform_box(a, |f| f.transform(r))?,
                transform_box(b, |f| f.transform(r))?,
            ),
            DocFilter::Not(f) => DocFilter::Not(transform_box(f, |f| f.transform(r))?),
            DocFilter::Qualified { scope, filter } => DocFilter::Qualified {
                scope,
                filter: transform_box(filter, |f| f.transform(r))?,
            },
            leaf => leaf,
        };
        r.doc_filter(rebuilt)
    }

    /// True when a `Sample` node appears anywhere in the tree
    pub fn contains_sample(&self) -> bool {
        match self {
            DocFilter::Sample { .. } => true,
            DocFilter::And(a, b) | DocFilter::Or(a, b) => a.contains_sample() || b.contains_sample(),
            DocFilter::Not(f) | DocFilter::Qualified { filter: f, .. } => f.contains_sample(),
            _ => false,
        }
    }

    /// The same predicate expressed as a document metric that is 1 where the
    /// filter holds and 0 elsewhere, for evaluation on `dataset`
    pub fn as_zero_one_metric(&self, dataset: &str) -> CompileResult<DocMetric> {
        let one = || DocMetric::Constant(1);
        let negate = |m: DocMetric| DocMetric::subtract(DocMetric::Constant(1), m);
        Ok(match self {
            DocFilter::FieldIs { field, term } => has_term(field, term)?,
            DocFilter::FieldIsnt { field, term } => negate(has_term(field, term)?),
            DocFilter::Between {
                field,
                lower,
                upper,
                upper_inclusive,
            } => {
                let value = DocMetric::Field(field.clone());
                let upper_op = if *upper_inclusive {
                    CompareOp::Lte
                } else {
                    CompareOp::Lt
                };
                DocMetric::multiply(
                    DocMetric::compare(CompareOp::Gte, value.clone(), DocMetric::Constant(*lower)),
                    DocMetric::compare(upper_op, value, DocMetric::Constant(*upper)),
                )
            }
            DocFilter::Compare { op, left, right } => {
                DocMetric::compare(*op, left.clone(), right.clone())
            }
            DocFilter::And(a, b) => DocMetric::multiply(
                a.as_zero_one_metric(dataset)?,
                b.as_zero_one_metric(dataset)?,
            ),
            DocFilter::Or(a, b) => DocMetric::compare(
                CompareOp::Gt,
                DocMetric::add(vec![a.as_zero_one_metric(dataset)?, b.as_zero_one_metric(dataset)?]),
                DocMetric::Constant(0),
            ),
            DocFilter::Not(f) => negate(f.as_zero_one_metric(dataset)?),
            DocFilter::Regex { field, regex } => DocMetric::Regex {
                field: field.clone(),
                regex: regex.clone(),
            },
            DocFilter::NotRegex { field, regex } => negate(DocMetric::Regex {
                field: field.clone(),
                regex: regex.clone(),
            }),
            DocFilter::Qualified { scope, filter } => {
                if scope.contains(dataset) {
                    filter.as_zero_one_metric(dataset)?
                } else {
                    one()
                }
            }
            DocFilter::Sample { .. } => {
                return Err(CompileError::structural(
                    "SAMPLE cannot be evaluated as a per-document metric",
                ))
            }
            DocFilter::Lucene(query) => DocMetric::Lucene(query.clone()),
            DocFilter::FieldIn {
                field,
                terms,
                negated,
            } => {
                let hits = terms
                    .iter()
                    .map(|t| has_term(field, t))
                    .collect::<CompileResult<Vec<_>>>()?;
                let any = DocMetric::compare(CompareOp::Gt, DocMetric::add(hits), DocMetric::Constant(0));
                if *negated {
                    negate(any)
                } else {
                    any
                }
            }
            DocFilter::Always => one(),
            DocFilter::Never => DocMetric::Constant(0),
        })
    }
}

fn has_term(field: &FieldSet, term: &Term) -> CompileResult<DocMetric> {
    match (field.is_int(), term) {
        (true, Term::Int(v)) => Ok(DocMetric::HasInt {
            field: field.clone(),
            term: *v,
        }),
        (false, Term::Str(s)) => Ok(DocMetric::HasString {
            field: field.clone(),
            term: s.clone(),
        }),
        // an int field compared against a numeric-looking string term
        (true, Term::Str(s)) => s
            .parse::<i64>()
            .map(|v| DocMetric::HasInt {
                field: field.clone(),
                term: v,
            })
            .map_err(|_| {
                CompileError::structural(format!(
                    "int field '{}' compared with string term \"{}\"",
                    field.name(),
                    s
                ))
            }),
        (false, Term::Int(v)) => Ok(DocMetric::HasString {
            field: field.clone(),
            term: v.to_string(),
        }),
    }
}

impl fmt::Display for DocFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocFilter::FieldIs { field, term } => write!(f, "{}={}", field.name(), term),
            DocFilter::FieldIsnt { field, term } => write!(f, "{}!={}", field.name(), term),
            DocFilter::Between {
                field,
                lower,
                upper,
                upper_inclusive,
            } => {
                let close = if *upper_inclusive { ']' } else { ')' };
                write!(f, "{} in [{}, {}{}", field.name(), lower, upper, close)
            }
            DocFilter::Compare { op, left, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            DocFilter::And(a, b) => write!(f, "({} AND {})", a, b),
            DocFilter::Or(a, b) => write!(f, "({} OR {})", a, b),
            DocFilter::Not(inner) => write!(f, "NOT({})", inner),
            DocFilter::Regex { field, regex } => write!(f, "{}=~\"{}\"", field.name(), regex),
            DocFilter::NotRegex { field, regex } => write!(f, "{}!=~\"{}\"", field.name(), regex),
            DocFilter::Qualified { scope, filter } => {
                let names: Vec<&str> = scope.iter().map(String::as_str).collect();
                write!(f, "[{}].{}", names.join(","), filter)
            }
            DocFilter::Sample {
                field,
                numerator,
                denominator,
                seed,
            } => write!(f, "SAMPLE({}, {}/{}, \"{}\")", field.name(), numerator, denominator, seed),
            DocFilter::Lucene(query) => write!(f, "lucene(\"{}\")", query),
            DocFilter::FieldIn {
                field,
                terms,
                negated,
            } => {
                let terms: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{}{} IN ({})", field.name(), not, terms.join(", "))
            }
            DocFilter::Always => write!(f, "TRUE"),
            DocFilter::Never => write!(f, "FALSE"),
        }
    }
}
