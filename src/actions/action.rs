//! Regroup actions
//!
//! Every routing action moves the documents of `target` that satisfy its
//! condition into `positive` and the rest into `negative`. Documents in
//! other groups are untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::language::{DocFilter, FieldSet, Scope, Term};

/// Source, match and miss groups of a routing action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Routing {
    pub target: usize,
    pub positive: usize,
    pub negative: usize,
}

impl Routing {
    pub fn new(target: usize, positive: usize, negative: usize) -> Self {
        Self {
            target,
            positive,
            negative,
        }
    }

    /// Same groups with match and miss exchanged
    pub fn swapped(self) -> Self {
        Self {
            target: self.target,
            positive: self.negative,
            negative: self.positive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanOp {
    And,
    Or,
    Not,
}

/// A document query the store answers natively
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreQuery {
    Term { field: String, term: Term },
    /// `start <= value < end`, or `<= end` when `end_inclusive`
    Range {
        field: String,
        start: i64,
        end: i64,
        end_inclusive: bool,
    },
    Boolean { op: BooleanOp, operands: Vec<StoreQuery> },
    Lucene(String),
}

impl StoreQuery {
    pub fn boolean(op: BooleanOp, operands: Vec<StoreQuery>) -> Self {
        StoreQuery::Boolean { op, operands }
    }
}

impl fmt::Display for StoreQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreQuery::Term { field, term } => write!(f, "{}:{}", field, term),
            StoreQuery::Range {
                field,
                start,
                end,
                end_inclusive,
            } => {
                let close = if *end_inclusive { ']' } else { ')' };
                write!(f, "{}:[{}, {}{}", field, start, end, close)
            }
            StoreQuery::Boolean { op, operands } => {
                let parts: Vec<String> = operands.iter().map(|q| q.to_string()).collect();
                match op {
                    BooleanOp::And => write!(f, "({})", parts.join(" AND ")),
                    BooleanOp::Or => write!(f, "({})", parts.join(" OR ")),
                    BooleanOp::Not => write!(f, "NOT({})", parts.join(", ")),
                }
            }
            StoreQuery::Lucene(query) => write!(f, "lucene({})", query),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Native store query, one per dataset
    Query {
        per_dataset: BTreeMap<String, StoreQuery>,
        routing: Routing,
    },
    /// Filter evaluated per document as a 0/1 metric
    Metric {
        scope: Scope,
        filter: DocFilter,
        routing: Routing,
    },
    Regex {
        scope: Scope,
        field: FieldSet,
        regex: String,
        routing: Routing,
    },
    IntOr {
        scope: Scope,
        field: FieldSet,
        terms: BTreeSet<i64>,
        routing: Routing,
    },
    StringOr {
        scope: Scope,
        field: FieldSet,
        terms: BTreeSet<String>,
        routing: Routing,
    },
    /// Keeps each term of `field` with the given probability, decided by a
    /// hash of the term and `seed`
    Sample {
        scope: Scope,
        field: FieldSet,
        probability: f64,
        seed: String,
        routing: Routing,
    },
    /// Moves every document of `target` into `destination`
    Unconditional {
        scope: Scope,
        target: usize,
        destination: usize,
    },
}

impl Action {
    pub fn scope(&self) -> Scope {
        match self {
            Action::Query { per_dataset, .. } => per_dataset.keys().cloned().collect(),
            Action::Metric { scope, .. }
            | Action::Regex { scope, .. }
            | Action::IntOr { scope, .. }
            | Action::StringOr { scope, .. }
            | Action::Sample { scope, .. }
            | Action::Unconditional { scope, .. } => scope.clone(),
        }
    }

    /// Largest group id the action reads or writes
    pub fn max_group(&self) -> usize {
        match self {
            Action::Unconditional {
                target,
                destination,
                ..
            } => (*target).max(*destination),
            Action::Query { routing, .. }
            | Action::Metric { routing, .. }
            | Action::Regex { routing, .. }
            | Action::IntOr { routing, .. }
            | Action::StringOr { routing, .. }
            | Action::Sample { routing, .. } => {
                routing.target.max(routing.positive).max(routing.negative)
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = |f: &mut fmt::Formatter<'_>, r: &Routing| {
            write!(f, " [{} -> +{} / -{}]", r.target, r.positive, r.negative)
        };
        match self {
            Action::Query {
                per_dataset,
                routing,
            } => {
                let parts: Vec<String> = per_dataset
                    .iter()
                    .map(|(d, q)| format!("{}: {}", d, q))
                    .collect();
                write!(f, "QueryAction{{{}}}", parts.join(", "))?;
                route(f, routing)
            }
            Action::Metric {
                filter, routing, ..
            } => {
                write!(f, "MetricAction{{{}}}", filter)?;
                route(f, routing)
            }
            Action::Regex {
                field,
                regex,
                routing,
                ..
            } => {
                write!(f, "RegexAction{{{} =~ \"{}\"}}", field.name(), regex)?;
                route(f, routing)
            }
            Action::IntOr {
                field,
                terms,
                routing,
                ..
            } => {
                write!(f, "IntOrAction{{{} in {:?}}}", field.name(), terms)?;
                route(f, routing)
            }
            Action::StringOr {
                field,
                terms,
                routing,
                ..
            } => {
                write!(f, "StringOrAction{{{} in {:?}}}", field.name(), terms)?;
                route(f, routing)
            }
            Action::Sample {
                field,
                probability,
                seed,
                routing,
                ..
            } => {
                write!(
                    f,
                    "SampleAction{{{}, p={}, seed=\"{}\"}}",
                    field.name(),
                    probability,
                    seed
                )?;
                route(f, routing)
            }
            Action::Unconditional {
                target,
                destination,
                ..
            } => write!(f, "UnconditionalAction{{{} -> {}}}", target, destination),
        }
    }
}
