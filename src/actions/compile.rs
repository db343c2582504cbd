//! Where-clause compilation into regroup actions
//!
//! A filter is compiled against a routing triple. At the top level the
//! triple is `(1, 1, 0)`: matching documents stay in group 1 and the rest
//! are dropped into group 0. Conjunctions and disjunctions that cannot be
//! expressed by rerouting alone borrow a scratch group from the
//! `GroupSupplier` and hand it back when done.

use std::collections::{BTreeMap, BTreeSet};

use super::action::{Action, BooleanOp, Routing, StoreQuery};
use crate::language::{CompileError, CompileResult, DocFilter, FieldSet, Scope, Term};

/// Hands out scratch group ids above the live groups
#[derive(Debug, Clone)]
pub struct GroupSupplier {
    next: usize,
    free: Vec<usize>,
}

impl GroupSupplier {
    /// `first_free` is the smallest id no live group uses
    pub fn new(first_free: usize) -> Self {
        Self {
            next: first_free,
            free: Vec::new(),
        }
    }

    pub fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(group) => group,
            None => {
                let group = self.next;
                self.next += 1;
                group
            }
        }
    }

    pub fn release(&mut self, group: usize) {
        self.free.push(group);
    }
}

/// Compile `filter` over `scope` with the top-level routing `(1, 1, 0)`
pub fn compile_filter(filter: &DocFilter, scope: &Scope) -> CompileResult<Vec<Action>> {
    let mut groups = GroupSupplier::new(2);
    let mut out = Vec::new();
    compile_into(filter, scope, Routing::new(1, 1, 0), &mut groups, &mut out)?;
    Ok(out)
}

/// Compile `filter` with an explicit routing, appending to `out`
pub fn compile_into(
    filter: &DocFilter,
    scope: &Scope,
    routing: Routing,
    groups: &mut GroupSupplier,
    out: &mut Vec<Action>,
) -> CompileResult<()> {
    let Routing {
        target,
        positive,
        negative,
    } = routing;

    match filter {
        DocFilter::FieldIs { field, term } => {
            out.push(query_action(scope, routing, |dataset| {
                term_query(field, term, dataset)
            })?);
        }
        DocFilter::FieldIsnt { field, term } => {
            out.push(query_action(scope, routing.swapped(), |dataset| {
                term_query(field, term, dataset)
            })?);
        }
        DocFilter::Between {
            field,
            lower,
            upper,
            upper_inclusive,
        } => {
            if !field.is_int() {
                return Err(CompileError::structural(format!(
                    "range filter on string field '{}'",
                    field.name()
                )));
            }
            out.push(query_action(scope, routing, |dataset| {
                Ok(match field.physical(dataset) {
                    Ok(physical) => StoreQuery::Range {
                        field: physical.to_string(),
                        start: *lower,
                        end: *upper,
                        end_inclusive: *upper_inclusive,
                    },
                    Err(_) => match_nothing(),
                })
            })?);
        }
        DocFilter::Compare { left, right, .. } => {
            let mut qualifications = left.qualifications();
            qualifications.extend(right.qualifications());
            let scope = match qualifications.len() {
                0 => scope.clone(),
                1 => qualifications,
                _ => {
                    return Err(CompileError::scope(format!(
                        "metric filter '{}' is qualified by several datasets",
                        filter
                    )))
                }
            };
            out.push(Action::Metric {
                scope,
                filter: filter.clone(),
                routing,
            });
        }
        DocFilter::Lucene(query) => {
            out.push(query_action(scope, routing, |_| {
                Ok(StoreQuery::Lucene(query.clone()))
            })?);
        }
        DocFilter::Regex { field, regex } => out.push(Action::Regex {
            scope: scope.clone(),
            field: field.clone(),
            regex: regex.clone(),
            routing,
        }),
        DocFilter::NotRegex { field, regex } => out.push(Action::Regex {
            scope: scope.clone(),
            field: field.clone(),
            regex: regex.clone(),
            routing: routing.swapped(),
        }),
        DocFilter::FieldIn {
            field,
            terms,
            negated,
        } => {
            let routing = if *negated { routing.swapped() } else { routing };
            out.push(field_in(scope, field, terms, routing)?);
        }
        DocFilter::Sample { .. } => {
            return Err(CompileError::structural(format!(
                "SAMPLE is only allowed in the conjunctive spine of the where clause: {}",
                filter
            )))
        }
        DocFilter::Always => unconditional(scope, target, positive, out),
        DocFilter::Never => unconditional(scope, target, negative, out),
        DocFilter::Not(inner) => compile_into(inner, scope, routing.swapped(), groups, out)?,
        DocFilter::Qualified {
            scope: inner,
            filter: inner_filter,
        } => {
            let narrowed: Scope = inner.intersection(scope).cloned().collect();
            compile_into(inner_filter, &narrowed, routing, groups, out)?;
            // outside its datasets a qualified filter holds
            let rest: Scope = scope.difference(inner).cloned().collect();
            unconditional(&rest, target, positive, out);
        }
        DocFilter::And(a, b) => {
            if target != negative && positive != negative {
                compile_into(a, scope, Routing::new(target, target, negative), groups, out)?;
                compile_into(b, scope, Routing::new(target, positive, negative), groups, out)?;
            } else {
                let scratch = groups.acquire();
                compile_into(a, scope, Routing::new(target, target, scratch), groups, out)?;
                compile_into(b, scope, Routing::new(target, target, scratch), groups, out)?;
                unconditional(scope, target, positive, out);
                unconditional(scope, scratch, target, out);
                groups.release(scratch);
            }
        }
        DocFilter::Or(a, b) => {
            if target != positive && positive != negative {
                compile_into(a, scope, Routing::new(target, positive, target), groups, out)?;
                compile_into(b, scope, Routing::new(target, positive, negative), groups, out)?;
            } else {
                let scratch = groups.acquire();
                compile_into(a, scope, Routing::new(target, scratch, target), groups, out)?;
                compile_into(b, scope, Routing::new(target, scratch, target), groups, out)?;
                unconditional(scope, target, negative, out);
                unconditional(scope, scratch, positive, out);
                groups.release(scratch);
            }
        }
    }
    Ok(())
}

fn unconditional(scope: &Scope, target: usize, destination: usize, out: &mut Vec<Action>) {
    if target != destination && !scope.is_empty() {
        out.push(Action::Unconditional {
            scope: scope.clone(),
            target,
            destination,
        });
    }
}

fn query_action<F>(scope: &Scope, routing: Routing, mut query: F) -> CompileResult<Action>
where
    F: FnMut(&str) -> CompileResult<StoreQuery>,
{
    let per_dataset = scope
        .iter()
        .map(|dataset| Ok((dataset.clone(), query(dataset)?)))
        .collect::<CompileResult<BTreeMap<_, _>>>()?;
    Ok(Action::Query {
        per_dataset,
        routing,
    })
}

/// The empty disjunction matches no document
fn match_nothing() -> StoreQuery {
    StoreQuery::boolean(BooleanOp::Or, Vec::new())
}

fn term_query(field: &FieldSet, term: &Term, dataset: &str) -> CompileResult<StoreQuery> {
    let physical = match field.physical(dataset) {
        Ok(physical) => physical.to_string(),
        Err(_) => return Ok(match_nothing()),
    };
    let term = coerce(field, term)?;
    Ok(StoreQuery::Term {
        field: physical,
        term,
    })
}

fn coerce(field: &FieldSet, term: &Term) -> CompileResult<Term> {
    match (field.is_int(), term) {
        (true, Term::Str(s)) => s.parse::<i64>().map(Term::Int).map_err(|_| {
            CompileError::structural(format!(
                "int field '{}' compared with string term \"{}\"",
                field.name(),
                s
            ))
        }),
        (false, Term::Int(v)) => Ok(Term::Str(v.to_string())),
        _ => Ok(term.clone()),
    }
}

fn field_in(
    scope: &Scope,
    field: &FieldSet,
    terms: &BTreeSet<Term>,
    routing: Routing,
) -> CompileResult<Action> {
    if field.is_int() {
        let terms = terms
            .iter()
            .map(|t| match coerce(field, t)? {
                Term::Int(v) => Ok(v),
                Term::Str(s) => Err(CompileError::structural(format!(
                    "int field '{}' compared with string term \"{}\"",
                    field.name(),
                    s
                ))),
            })
            .collect::<CompileResult<BTreeSet<i64>>>()?;
        Ok(Action::IntOr {
            scope: scope.clone(),
            field: field.clone(),
            terms,
            routing,
        })
    } else {
        Ok(Action::StringOr {
            scope: scope.clone(),
            field: field.clone(),
            terms: terms.iter().map(Term::to_text).collect(),
            routing,
        })
    }
}
