//! Runtime metric and filter evaluation
//!
//! Staged aggregate metrics reach execution with every full-pass node
//! replaced by a lookup. What remains is compiled once per command into a
//! `CompiledMetric` whose leaves index a global stat vector laid out by a
//! `PushLayout`, then evaluated either once per group (group mode) or once
//! per (term, group) tuple of a term iteration (term mode).
//!
//! Sequential operators (LAG, WINDOW, RUNNING, ITERATE_LAG) carry state
//! across calls, keyed by a stream:
//! - group mode: groups are visited in id order and the stream is the
//!   parent group, so state runs over siblings
//! - term mode: WINDOW and RUNNING run over the sibling groups of one term
//!   and reset when the term changes; ITERATE_LAG runs over the terms of one
//!   group

use std::collections::{HashMap, VecDeque};

use regex::Regex;

use super::errors::{ExecutionError, ExecutionResult};
use crate::language::{
    AggOp, AggregateFilter, AggregateMetric, CompareOp, PushOp, QualifiedPush, Scope, Term,
};

/// Interned pushes of one command; the position of a push is its index in
/// the merged stat vector
#[derive(Debug, Clone, Default)]
pub struct PushLayout {
    pushes: Vec<QualifiedPush>,
    index: HashMap<QualifiedPush, usize>,
}

impl PushLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global index of `push`, adding it on first sight
    pub fn intern(&mut self, push: QualifiedPush) -> usize {
        if let Some(&i) = self.index.get(&push) {
            return i;
        }
        let i = self.pushes.len();
        self.index.insert(push.clone(), i);
        self.pushes.push(push);
        i
    }

    pub fn len(&self) -> usize {
        self.pushes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushes.is_empty()
    }

    /// Programs `dataset` must push, in push order, with their global index
    pub fn for_dataset(&self, dataset: &str) -> Vec<(usize, &[PushOp])> {
        self.pushes
            .iter()
            .enumerate()
            .filter(|(_, p)| p.dataset == dataset)
            .map(|(i, p)| (i, p.program.as_slice()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Group,
    Term,
}

/// Inputs of one evaluation
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub group: usize,
    pub parent: usize,
    /// Iterated term in term mode, the group's own label in group mode
    pub term: Option<&'a Term>,
    /// Merged stat vector, indexed by `PushLayout` position
    pub stats: &'a [i64],
    pub is_default: bool,
}

/// Values a command may read from earlier computations, already resolved
/// to the current group ids
pub trait LookupSource {
    fn lookup(&self, name: &str) -> ExecutionResult<Vec<f64>>;
}

impl<F> LookupSource for F
where
    F: Fn(&str) -> ExecutionResult<Vec<f64>>,
{
    fn lookup(&self, name: &str) -> ExecutionResult<Vec<f64>> {
        self(name)
    }
}

/// Per-stream history of a sequential operator
#[derive(Debug, Clone, Default)]
pub struct Streams {
    last_term: Option<Term>,
    history: HashMap<usize, VecDeque<f64>>,
}

impl Streams {
    /// History of the stream `ctx` belongs to, clearing everything when a
    /// term-scoped operator sees a new term
    fn enter(&mut self, ctx: &EvalContext<'_>, stream: usize, reset_on_term: bool) -> &mut VecDeque<f64> {
        if reset_on_term && self.last_term.as_ref() != ctx.term {
            self.history.clear();
            self.last_term = ctx.term.cloned();
        }
        self.history.entry(stream).or_default()
    }
}

/// Which group id a lag keys its history by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKey {
    Parent,
    Group,
}

impl StreamKey {
    fn of(self, ctx: &EvalContext<'_>) -> usize {
        match self {
            StreamKey::Parent => ctx.parent,
            StreamKey::Group => ctx.group,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledMetric {
    Constant(f64),
    Stat(usize),
    Lookup(Vec<f64>),
    Sum(Vec<CompiledMetric>),
    Binary {
        op: AggOp,
        left: Box<CompiledMetric>,
        right: Box<CompiledMetric>,
    },
    Negate(Box<CompiledMetric>),
    Abs(Box<CompiledMetric>),
    Log(Box<CompiledMetric>),
    Min(Vec<CompiledMetric>),
    Max(Vec<CompiledMetric>),
    Lag {
        delay: usize,
        key: StreamKey,
        inner: Box<CompiledMetric>,
        streams: Streams,
    },
    Window {
        size: usize,
        reset_on_term: bool,
        inner: Box<CompiledMetric>,
        streams: Streams,
    },
    Running {
        reset_on_term: bool,
        inner: Box<CompiledMetric>,
        streams: Streams,
    },
    IfThenElse {
        condition: Box<CompiledFilter>,
        then: Box<CompiledMetric>,
        otherwise: Box<CompiledMetric>,
    },
}

impl CompiledMetric {
    pub fn eval(&mut self, ctx: &EvalContext<'_>) -> f64 {
        match self {
            CompiledMetric::Constant(v) => *v,
            CompiledMetric::Stat(i) => ctx.stats.get(*i).copied().unwrap_or(0) as f64,
            CompiledMetric::Lookup(values) => values.get(ctx.group).copied().unwrap_or(f64::NAN),
            CompiledMetric::Sum(metrics) => metrics.iter_mut().map(|m| m.eval(ctx)).sum(),
            CompiledMetric::Binary { op, left, right } => {
                let l = left.eval(ctx);
                let r = right.eval(ctx);
                op.apply(l, r)
            }
            CompiledMetric::Negate(m) => -m.eval(ctx),
            CompiledMetric::Abs(m) => m.eval(ctx).abs(),
            CompiledMetric::Log(m) => m.eval(ctx).ln(),
            CompiledMetric::Min(metrics) => metrics
                .iter_mut()
                .map(|m| m.eval(ctx))
                .fold(f64::INFINITY, f64::min),
            CompiledMetric::Max(metrics) => metrics
                .iter_mut()
                .map(|m| m.eval(ctx))
                .fold(f64::NEG_INFINITY, f64::max),
            CompiledMetric::Lag {
                delay,
                key,
                inner,
                streams,
            } => {
                let value = inner.eval(ctx);
                if *delay == 0 {
                    return value;
                }
                let history = streams.enter(ctx, key.of(ctx), false);
                let lagged = if history.len() == *delay {
                    history.front().copied().unwrap_or(0.0)
                } else {
                    0.0
                };
                history.push_back(value);
                if history.len() > *delay {
                    history.pop_front();
                }
                lagged
            }
            CompiledMetric::Window {
                size,
                reset_on_term,
                inner,
                streams,
            } => {
                let value = inner.eval(ctx);
                let history = streams.enter(ctx, ctx.parent, *reset_on_term);
                history.push_back(value);
                while history.len() > *size {
                    history.pop_front();
                }
                history.iter().sum()
            }
            CompiledMetric::Running {
                reset_on_term,
                inner,
                streams,
            } => {
                let value = inner.eval(ctx);
                let history = streams.enter(ctx, ctx.parent, *reset_on_term);
                let total = history.back().copied().unwrap_or(0.0) + value;
                history.clear();
                history.push_back(total);
                total
            }
            CompiledMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                // both branches advance so sequential state stays aligned
                let t = then.eval(ctx);
                let e = otherwise.eval(ctx);
                if condition.eval(ctx) {
                    t
                } else {
                    e
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledFilter {
    TermIs(Term),
    TermRegex(Regex),
    Compare {
        op: CompareOp,
        left: CompiledMetric,
        right: CompiledMetric,
    },
    And(Box<CompiledFilter>, Box<CompiledFilter>),
    Or(Box<CompiledFilter>, Box<CompiledFilter>),
    Not(Box<CompiledFilter>),
    Always,
    Never,
    IsDefaultGroup,
}

impl CompiledFilter {
    pub fn eval(&mut self, ctx: &EvalContext<'_>) -> bool {
        match self {
            CompiledFilter::TermIs(term) => ctx.term.map_or(false, |t| t.to_text() == term.to_text()),
            CompiledFilter::TermRegex(regex) => ctx.term.map_or(false, |t| regex.is_match(&t.to_text())),
            CompiledFilter::Compare { op, left, right } => {
                let l = left.eval(ctx);
                let r = right.eval(ctx);
                op.holds(l, r)
            }
            CompiledFilter::And(a, b) => {
                let a = a.eval(ctx);
                let b = b.eval(ctx);
                a && b
            }
            CompiledFilter::Or(a, b) => {
                let a = a.eval(ctx);
                let b = b.eval(ctx);
                a || b
            }
            CompiledFilter::Not(f) => !f.eval(ctx),
            CompiledFilter::Always => true,
            CompiledFilter::Never => false,
            CompiledFilter::IsDefaultGroup => ctx.is_default,
        }
    }
}

/// Anchored regex over the whole term text
pub fn full_match_regex(pattern: &str) -> ExecutionResult<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| ExecutionError::malformed(format!("invalid regex '{}': {}", pattern, e)))
}

/// Turns staged metrics into evaluable trees for one command
pub struct MetricCompiler<'a> {
    layout: &'a mut PushLayout,
    datasets: &'a Scope,
    lookups: &'a dyn LookupSource,
    mode: EvalMode,
}

impl<'a> MetricCompiler<'a> {
    pub fn new(
        layout: &'a mut PushLayout,
        datasets: &'a Scope,
        lookups: &'a dyn LookupSource,
        mode: EvalMode,
    ) -> Self {
        Self {
            layout,
            datasets,
            lookups,
            mode,
        }
    }

    pub fn metric(&mut self, metric: &AggregateMetric) -> ExecutionResult<CompiledMetric> {
        let boxed = |c: &mut Self, m: &AggregateMetric| c.metric(m).map(Box::new);
        Ok(match metric {
            AggregateMetric::Constant(v) => CompiledMetric::Constant(*v),
            AggregateMetric::DocStats(doc) => {
                let qualified = doc.qualifications();
                let datasets = if qualified.is_empty() {
                    self.datasets.clone()
                } else {
                    qualified
                };
                let mut parts = Vec::with_capacity(datasets.len());
                for dataset in datasets {
                    parts.push(self.push(&dataset, doc.pushes(&dataset)?)?);
                }
                CompiledMetric::Sum(parts)
            }
            AggregateMetric::DocStatsPushes { dataset, metric } => {
                self.push(dataset, metric.pushes(dataset)?)?
            }
            AggregateMetric::Add(metrics) => CompiledMetric::Sum(self.metrics(metrics)?),
            AggregateMetric::Binary { op, left, right } => CompiledMetric::Binary {
                op: *op,
                left: boxed(self, left)?,
                right: boxed(self, right)?,
            },
            AggregateMetric::Negate(m) => CompiledMetric::Negate(boxed(self, m)?),
            AggregateMetric::Abs(m) => CompiledMetric::Abs(boxed(self, m)?),
            AggregateMetric::Log(m) => CompiledMetric::Log(boxed(self, m)?),
            AggregateMetric::Min(ms) => CompiledMetric::Min(self.metrics(ms)?),
            AggregateMetric::Max(ms) => CompiledMetric::Max(self.metrics(ms)?),
            AggregateMetric::Lag { delay, metric } => {
                if self.mode == EvalMode::Term {
                    return Err(ExecutionError::malformed(
                        "LAG cannot be evaluated while iterating terms",
                    ));
                }
                CompiledMetric::Lag {
                    delay: *delay,
                    key: StreamKey::Parent,
                    inner: boxed(self, metric)?,
                    streams: Streams::default(),
                }
            }
            AggregateMetric::IterateLag { delay, metric } => CompiledMetric::Lag {
                delay: *delay,
                key: match self.mode {
                    EvalMode::Group => StreamKey::Parent,
                    EvalMode::Term => StreamKey::Group,
                },
                inner: boxed(self, metric)?,
                streams: Streams::default(),
            },
            AggregateMetric::Window { size, metric } => CompiledMetric::Window {
                size: (*size).max(1),
                reset_on_term: self.mode == EvalMode::Term,
                inner: boxed(self, metric)?,
                streams: Streams::default(),
            },
            AggregateMetric::Running(metric) => CompiledMetric::Running {
                reset_on_term: self.mode == EvalMode::Term,
                inner: boxed(self, metric)?,
                streams: Streams::default(),
            },
            AggregateMetric::Named { metric, .. } => self.metric(metric)?,
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => CompiledMetric::IfThenElse {
                condition: Box::new(self.filter(condition)?),
                then: boxed(self, then)?,
                otherwise: boxed(self, otherwise)?,
            },
            AggregateMetric::GroupStatsLookup(name) => CompiledMetric::Lookup(self.lookups.lookup(name)?),
            other => {
                return Err(ExecutionError::malformed(format!(
                    "metric {} cannot be evaluated at runtime",
                    other
                )))
            }
        })
    }

    pub fn filter(&mut self, filter: &AggregateFilter) -> ExecutionResult<CompiledFilter> {
        let boxed = |c: &mut Self, f: &AggregateFilter| c.filter(f).map(Box::new);
        Ok(match filter {
            AggregateFilter::TermIs(term) => CompiledFilter::TermIs(term.clone()),
            AggregateFilter::TermRegex(regex) | AggregateFilter::Regex { regex, .. } => {
                CompiledFilter::TermRegex(full_match_regex(regex)?)
            }
            AggregateFilter::Compare { op, left, right } => CompiledFilter::Compare {
                op: *op,
                left: self.metric(left)?,
                right: self.metric(right)?,
            },
            AggregateFilter::And(a, b) => CompiledFilter::And(boxed(self, a)?, boxed(self, b)?),
            AggregateFilter::Or(a, b) => CompiledFilter::Or(boxed(self, a)?, boxed(self, b)?),
            AggregateFilter::Not(f) => CompiledFilter::Not(boxed(self, f)?),
            AggregateFilter::Always => CompiledFilter::Always,
            AggregateFilter::Never => CompiledFilter::Never,
            AggregateFilter::IsDefaultGroup => CompiledFilter::IsDefaultGroup,
        })
    }

    fn metrics(&mut self, metrics: &[AggregateMetric]) -> ExecutionResult<Vec<CompiledMetric>> {
        metrics.iter().map(|m| self.metric(m)).collect()
    }

    fn push(&mut self, dataset: &str, program: Vec<PushOp>) -> ExecutionResult<CompiledMetric> {
        if !self.datasets.contains(dataset) {
            return Err(ExecutionError::malformed(format!(
                "metric reads dataset '{}' which is not part of the session",
                dataset
            )));
        }
        Ok(CompiledMetric::Stat(self.layout.intern(QualifiedPush::new(dataset, program))))
    }
}

/// Result columns of a select list. A multi-slot lookup contributes one
/// column per slot.
pub fn columns(selects: &[AggregateMetric]) -> Vec<AggregateMetric> {
    let mut out = Vec::with_capacity(selects.len());
    for select in selects {
        let mut inner = select;
        while let AggregateMetric::Named { metric, .. } = inner {
            inner = metric;
        }
        match inner {
            AggregateMetric::GroupStatsMultiLookup(names) => {
                out.extend(names.iter().cloned().map(AggregateMetric::GroupStatsLookup))
            }
            _ => out.push(select.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{scope_of, DocMetric, FieldSet};

    fn no_lookups(name: &str) -> ExecutionResult<Vec<f64>> {
        Err(ExecutionError::consistency(format!("no lookup {}", name)))
    }

    fn ctx<'a>(group: usize, parent: usize, stats: &'a [i64]) -> EvalContext<'a> {
        EvalContext {
            group,
            parent,
            term: None,
            stats,
            is_default: false,
        }
    }

    fn compile(metric: &AggregateMetric, mode: EvalMode) -> (CompiledMetric, PushLayout) {
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a", "b"]);
        let compiled = MetricCompiler::new(&mut layout, &datasets, &no_lookups, mode)
            .metric(metric)
            .unwrap();
        (compiled, layout)
    }

    fn oji() -> DocMetric {
        DocMetric::Field(FieldSet::int("oji", &["a", "b"]))
    }

    #[test]
    fn test_doc_stats_sums_every_dataset() {
        let (mut metric, layout) = compile(&AggregateMetric::doc_stats(oji()), EvalMode::Group);
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.for_dataset("a").len(), 1);
        assert_eq!(metric.eval(&ctx(1, 1, &[3, 4])), 7.0);
    }

    #[test]
    fn test_identical_pushes_share_a_slot() {
        let m = AggregateMetric::DocStatsPushes {
            dataset: "a".into(),
            metric: DocMetric::Count,
        };
        let (mut metric, layout) = compile(&AggregateMetric::divide(m.clone(), m), EvalMode::Group);
        assert_eq!(layout.len(), 1);
        assert_eq!(metric.eval(&ctx(1, 1, &[5])), 1.0);
    }

    #[test]
    fn test_unknown_dataset_is_malformed() {
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a"]);
        let err = MetricCompiler::new(&mut layout, &datasets, &no_lookups, EvalMode::Group)
            .metric(&AggregateMetric::DocStatsPushes {
                dataset: "zzz".into(),
                metric: DocMetric::Count,
            })
            .unwrap_err();
        assert_eq!(err.code(), "AGG_EXEC_MALFORMED_COMMAND");
    }

    #[test]
    fn test_unstaged_metric_is_rejected() {
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a"]);
        let err = MetricCompiler::new(&mut layout, &datasets, &no_lookups, EvalMode::Group)
            .metric(&AggregateMetric::distinct(FieldSet::string("q", &["a"])))
            .unwrap_err();
        assert_eq!(err.code(), "AGG_EXEC_MALFORMED_COMMAND");
    }

    #[test]
    fn test_lag_reads_earlier_sibling() {
        let stat = AggregateMetric::DocStatsPushes {
            dataset: "a".into(),
            metric: DocMetric::Count,
        };
        let lag = AggregateMetric::Lag {
            delay: 1,
            metric: Box::new(stat),
        };
        let (mut metric, _) = compile(&lag, EvalMode::Group);
        assert_eq!(metric.eval(&ctx(1, 1, &[10])), 0.0);
        assert_eq!(metric.eval(&ctx(2, 1, &[20])), 10.0);
        assert_eq!(metric.eval(&ctx(3, 1, &[30])), 20.0);
        // new parent, new stream
        assert_eq!(metric.eval(&ctx(4, 2, &[40])), 0.0);
    }

    #[test]
    fn test_lag_is_rejected_in_term_mode() {
        let lag = AggregateMetric::Lag {
            delay: 1,
            metric: Box::new(AggregateMetric::Constant(1.0)),
        };
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a"]);
        assert!(MetricCompiler::new(&mut layout, &datasets, &no_lookups, EvalMode::Term)
            .metric(&lag)
            .is_err());
    }

    #[test]
    fn test_window_and_running_over_siblings() {
        let stat = || {
            Box::new(AggregateMetric::DocStatsPushes {
                dataset: "a".into(),
                metric: DocMetric::Count,
            })
        };
        let (mut window, _) = compile(
            &AggregateMetric::Window {
                size: 2,
                metric: stat(),
            },
            EvalMode::Group,
        );
        let (mut running, _) = compile(&AggregateMetric::Running(stat()), EvalMode::Group);
        let values = [1, 2, 4];
        let mut windows = Vec::new();
        let mut totals = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let stats = [*v];
            windows.push(window.eval(&ctx(i + 1, 1, &stats)));
            totals.push(running.eval(&ctx(i + 1, 1, &stats)));
        }
        assert_eq!(windows, vec![1.0, 3.0, 6.0]);
        assert_eq!(totals, vec![1.0, 3.0, 7.0]);
    }

    #[test]
    fn test_iterate_lag_runs_over_terms_of_a_group() {
        let lag = AggregateMetric::IterateLag {
            delay: 1,
            metric: Box::new(AggregateMetric::DocStatsPushes {
                dataset: "a".into(),
                metric: DocMetric::Count,
            }),
        };
        let (mut metric, _) = compile(&lag, EvalMode::Term);
        let x = Term::from("x");
        let y = Term::from("y");
        let first = metric.eval(&EvalContext {
            term: Some(&x),
            ..ctx(1, 1, &[3])
        });
        let second = metric.eval(&EvalContext {
            term: Some(&y),
            ..ctx(1, 1, &[5])
        });
        assert_eq!((first, second), (0.0, 3.0));
    }

    #[test]
    fn test_filters() {
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a"]);
        let filter = AggregateFilter::and(
            AggregateFilter::TermRegex("u.".into()),
            AggregateFilter::not(AggregateFilter::IsDefaultGroup),
        );
        let mut compiled = MetricCompiler::new(&mut layout, &datasets, &no_lookups, EvalMode::Term)
            .filter(&filter)
            .unwrap();
        let us = Term::from("us");
        let usa = Term::from("usa");
        assert!(compiled.eval(&EvalContext {
            term: Some(&us),
            ..ctx(1, 1, &[])
        }));
        // anchored: "usa" is not two characters
        assert!(!compiled.eval(&EvalContext {
            term: Some(&usa),
            ..ctx(1, 1, &[])
        }));
    }

    #[test]
    fn test_invalid_regex_is_malformed() {
        assert_eq!(
            full_match_regex("(").unwrap_err().code(),
            "AGG_EXEC_MALFORMED_COMMAND"
        );
    }

    #[test]
    fn test_lookup_reads_resolved_values() {
        let mut layout = PushLayout::new();
        let datasets = scope_of(["a"]);
        let lookups = |name: &str| -> ExecutionResult<Vec<f64>> {
            assert_eq!(name, "v0");
            Ok(vec![0.0, 2.5, 7.5])
        };
        let mut metric = MetricCompiler::new(&mut layout, &datasets, &lookups, EvalMode::Group)
            .metric(&AggregateMetric::GroupStatsLookup("v0".into()))
            .unwrap();
        assert_eq!(metric.eval(&ctx(2, 1, &[])), 7.5);
    }

    #[test]
    fn test_columns_expand_multi_lookups() {
        let selects = vec![
            AggregateMetric::Constant(1.0),
            AggregateMetric::named(
                "b",
                AggregateMetric::GroupStatsMultiLookup(vec!["v0.min".into(), "v0.max".into()]),
            ),
        ];
        let cols = columns(&selects);
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[2], AggregateMetric::GroupStatsLookup("v0.max".into()));
    }
}
