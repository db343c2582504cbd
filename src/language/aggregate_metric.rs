//! Per-group aggregate metrics

use std::fmt;

use serde::{Deserialize, Serialize};

use super::aggregate_filter::AggregateFilter;
use super::doc_metric::DocMetric;
use super::errors::CompileResult;
use super::field::{FieldSet, Scope};
use super::group_by::GroupBy;
use super::transform::{transform_box, transform_opt, transform_vec, MetricFn, Rewriter};

/// Binary operators over aggregate values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggOp {
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Power,
}

impl AggOp {
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            AggOp::Subtract => left - right,
            AggOp::Multiply => left * right,
            AggOp::Divide => left / right,
            AggOp::Modulus => left % right,
            AggOp::Power => left.powf(right),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            AggOp::Subtract => "-",
            AggOp::Multiply => "*",
            AggOp::Divide => "/",
            AggOp::Modulus => "%",
            AggOp::Power => "^",
        }
    }
}

/// Statistics a bootstrap computation can publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BootstrapOutput {
    Min,
    Max,
    Mean,
    Variance,
    NumTerms,
    SkippedTerms,
    /// every individual bootstrap sample
    All,
}

impl BootstrapOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapOutput::Min => "min",
            BootstrapOutput::Max => "max",
            BootstrapOutput::Mean => "mean",
            BootstrapOutput::Variance => "variance",
            BootstrapOutput::NumTerms => "numTerms",
            BootstrapOutput::SkippedTerms => "skippedTerms",
            BootstrapOutput::All => "all",
        }
    }

    /// Slot names published under `base` for this output
    pub fn slot_names(&self, base: &str, num_bootstraps: usize) -> Vec<String> {
        match self {
            BootstrapOutput::All => (0..num_bootstraps)
                .map(|i| format!("{}.values[{}]", base, i))
                .collect(),
            other => vec![format!("{}.{}", base, other.as_str())],
        }
    }
}

/// A value computed per group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateMetric {
    Constant(f64),
    /// Sum of a document metric over the group's documents in every dataset
    /// of the current scope
    DocStats(DocMetric),
    /// Sum of a document metric over one dataset. Produced by staging.
    DocStatsPushes { dataset: String, metric: DocMetric },
    Add(Vec<AggregateMetric>),
    Binary {
        op: AggOp,
        left: Box<AggregateMetric>,
        right: Box<AggregateMetric>,
    },
    Negate(Box<AggregateMetric>),
    Abs(Box<AggregateMetric>),
    Log(Box<AggregateMetric>),
    Min(Vec<AggregateMetric>),
    Max(Vec<AggregateMetric>),
    /// The metric evaluated one grouping level shallower
    Parent(Box<AggregateMetric>),
    /// Value of the sibling group `delay` positions earlier
    Lag { delay: usize, metric: Box<AggregateMetric> },
    /// Value `delay` terms earlier in the current group's term iteration
    IterateLag { delay: usize, metric: Box<AggregateMetric> },
    /// Sum over the last `size` sibling groups
    Window { size: usize, metric: Box<AggregateMetric> },
    /// Running sum over sibling groups
    Running(Box<AggregateMetric>),
    Qualified { scope: Scope, metric: Box<AggregateMetric> },
    Percentile { field: FieldSet, percentile: f64 },
    Distinct {
        field: FieldSet,
        filter: Option<Box<AggregateFilter>>,
        window: Option<usize>,
    },
    SumAcross {
        group_by: Box<GroupBy>,
        metric: Box<AggregateMetric>,
    },
    FieldMin {
        field: FieldSet,
        metric: Option<Box<AggregateMetric>>,
        filter: Option<Box<AggregateFilter>>,
    },
    FieldMax {
        field: FieldSet,
        metric: Option<Box<AggregateMetric>>,
        filter: Option<Box<AggregateFilter>>,
    },
    Bootstrap {
        field: FieldSet,
        filter: Option<Box<AggregateFilter>>,
        metric: Box<AggregateMetric>,
        num_bootstraps: usize,
        seed: String,
        outputs: Vec<BootstrapOutput>,
    },
    /// Sum divided by the number of matching documents
    DivideByCount(Box<AggregateMetric>),
    Named { name: String, metric: Box<AggregateMetric> },
    IfThenElse {
        condition: Box<AggregateFilter>,
        then: Box<AggregateMetric>,
        otherwise: Box<AggregateMetric>,
    },
    /// Reference to a precomputed slot. Produced by staging only.
    GroupStatsLookup(String),
    /// Reference to several precomputed slots. Produced by staging only.
    GroupStatsMultiLookup(Vec<String>),
}

impl AggregateMetric {
    pub fn doc_stats(metric: DocMetric) -> Self {
        AggregateMetric::DocStats(metric)
    }

    pub fn binary(op: AggOp, left: AggregateMetric, right: AggregateMetric) -> Self {
        AggregateMetric::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn divide(left: AggregateMetric, right: AggregateMetric) -> Self {
        Self::binary(AggOp::Divide, left, right)
    }

    pub fn parent(metric: AggregateMetric) -> Self {
        AggregateMetric::Parent(Box::new(metric))
    }

    pub fn named(name: impl Into<String>, metric: AggregateMetric) -> Self {
        AggregateMetric::Named {
            name: name.into(),
            metric: Box::new(metric),
        }
    }

    pub fn distinct(field: FieldSet) -> Self {
        AggregateMetric::Distinct {
            field,
            filter: None,
            window: None,
        }
    }

    pub fn if_then_else(condition: AggregateFilter, then: AggregateMetric, otherwise: AggregateMetric) -> Self {
        AggregateMetric::IfThenElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// Sum, flattening nested sums. A single operand is returned unwrapped.
    pub fn add(metrics: Vec<AggregateMetric>) -> Self {
        let mut flat = Vec::with_capacity(metrics.len());
        for metric in metrics {
            match metric {
                AggregateMetric::Add(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => AggregateMetric::Constant(0.0),
            1 => flat.remove(0),
            _ => AggregateMetric::Add(flat),
        }
    }

    /// Whether this node needs a dedicated full pass over the data
    pub fn requires_ftgs(&self) -> bool {
        matches!(
            self,
            AggregateMetric::Percentile { .. }
                | AggregateMetric::Distinct { .. }
                | AggregateMetric::SumAcross { .. }
                | AggregateMetric::FieldMin { .. }
                | AggregateMetric::FieldMax { .. }
                | AggregateMetric::Bootstrap { .. }
        )
    }

    /// Whether any node of the tree needs a dedicated full pass
    pub fn contains_ftgs(&self) -> bool {
        let mut found = false;
        self.visit(&mut |m: &AggregateMetric| found |= m.requires_ftgs());
        found
    }

    /// Calls `f` on this node and every aggregate metric below it, reaching
    /// through filters and group-bys. Parents are visited before children.
    pub fn visit(&self, f: &mut dyn FnMut(&AggregateMetric)) {
        f(self);
        match self {
            AggregateMetric::Add(ms) | AggregateMetric::Min(ms) | AggregateMetric::Max(ms) => {
                for m in ms {
                    m.visit(f);
                }
            }
            AggregateMetric::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            AggregateMetric::Negate(m)
            | AggregateMetric::Abs(m)
            | AggregateMetric::Log(m)
            | AggregateMetric::Parent(m)
            | AggregateMetric::Running(m)
            | AggregateMetric::DivideByCount(m)
            | AggregateMetric::Lag { metric: m, .. }
            | AggregateMetric::IterateLag { metric: m, .. }
            | AggregateMetric::Window { metric: m, .. }
            | AggregateMetric::Qualified { metric: m, .. }
            | AggregateMetric::Named { metric: m, .. } => m.visit(f),
            AggregateMetric::Distinct { filter, .. } => {
                if let Some(filter) = filter {
                    filter.visit_metrics(f);
                }
            }
            AggregateMetric::SumAcross { group_by, metric } => {
                if let GroupBy::ByField { filter, metric: top, .. } = group_by.as_ref() {
                    if let Some(filter) = filter {
                        filter.visit_metrics(f);
                    }
                    if let Some(top) = top {
                        top.visit(f);
                    }
                }
                metric.visit(f);
            }
            AggregateMetric::FieldMin { metric, filter, .. } | AggregateMetric::FieldMax { metric, filter, .. } => {
                if let Some(metric) = metric {
                    metric.visit(f);
                }
                if let Some(filter) = filter {
                    filter.visit_metrics(f);
                }
            }
            AggregateMetric::Bootstrap { filter, metric, .. } => {
                if let Some(filter) = filter {
                    filter.visit_metrics(f);
                }
                metric.visit(f);
            }
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.visit_metrics(f);
                then.visit(f);
                otherwise.visit(f);
            }
            AggregateMetric::Constant(_)
            | AggregateMetric::DocStats(_)
            | AggregateMetric::DocStatsPushes { .. }
            | AggregateMetric::Percentile { .. }
            | AggregateMetric::GroupStatsLookup(_)
            | AggregateMetric::GroupStatsMultiLookup(_) => {}
        }
    }

    /// Whether evaluation depends on sorted term iteration order
    pub fn need_sorted(&self) -> bool {
        match self {
            AggregateMetric::Window { .. }
            | AggregateMetric::Running(_)
            | AggregateMetric::IterateLag { .. } => true,
            AggregateMetric::Add(metrics) | AggregateMetric::Min(metrics) | AggregateMetric::Max(metrics) => {
                metrics.iter().any(AggregateMetric::need_sorted)
            }
            AggregateMetric::Binary { left, right, .. } => left.need_sorted() || right.need_sorted(),
            AggregateMetric::Negate(m)
            | AggregateMetric::Abs(m)
            | AggregateMetric::Log(m)
            | AggregateMetric::Parent(m)
            | AggregateMetric::Lag { metric: m, .. }
            | AggregateMetric::Qualified { metric: m, .. }
            | AggregateMetric::DivideByCount(m)
            | AggregateMetric::Named { metric: m, .. } => m.need_sorted(),
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => condition.need_sorted() || then.need_sorted() || otherwise.need_sorted(),
            _ => false,
        }
    }

    /// Full bottom-up rewrite of every node family reachable from here
    pub fn transform(self, r: &mut dyn Rewriter) -> CompileResult<AggregateMetric> {
        let rebuilt = match self {
            leaf @ (AggregateMetric::Constant(_)
            | AggregateMetric::Percentile { .. }
            | AggregateMetric::GroupStatsLookup(_)
            | AggregateMetric::GroupStatsMultiLookup(_)) => leaf,
            AggregateMetric::DocStats(m) => AggregateMetric::DocStats(m.transform(r)?),
            AggregateMetric::DocStatsPushes { dataset, metric } => AggregateMetric::DocStatsPushes {
                dataset,
                metric: metric.transform(r)?,
            },
            AggregateMetric::Add(metrics) => {
                AggregateMetric::add(transform_vec(metrics, |m| m.transform(r))?)
            }
            AggregateMetric::Binary { op, left, right } => AggregateMetric::Binary {
                op,
                left: transform_box(left, |m| m.transform(r))?,
                right: transform_box(right, |m| m.transform(r))?,
            },
            AggregateMetric::Negate(m) => AggregateMetric::Negate(transform_box(m, |m| m.transform(r))?),
            AggregateMetric::Abs(m) => AggregateMetric::Abs(transform_box(m, |m| m.transform(r))?),
            AggregateMetric::Log(m) => AggregateMetric::Log(transform_box(m, |m| m.transform(r))?),
            AggregateMetric::Min(ms) => AggregateMetric::Min(transform_vec(ms, |m| m.transform(r))?),
            AggregateMetric::Max(ms) => AggregateMetric::Max(transform_vec(ms, |m| m.transform(r))?),
            AggregateMetric::Parent(m) => AggregateMetric::Parent(transform_box(m, |m| m.transform(r))?),
            AggregateMetric::Lag { delay, metric } => AggregateMetric::Lag {
                delay,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::IterateLag { delay, metric } => AggregateMetric::IterateLag {
                delay,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::Window { size, metric } => AggregateMetric::Window {
                size,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::Running(m) => AggregateMetric::Running(transform_box(m, |m| m.transform(r))?),
            AggregateMetric::Qualified { scope, metric } => AggregateMetric::Qualified {
                scope,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::Distinct {
                field,
                filter,
                window,
            } => AggregateMetric::Distinct {
                field,
                filter: transform_opt(filter, |f| transform_box(f, |f| f.transform(r)))?,
                window,
            },
            AggregateMetric::SumAcross { group_by, metric } => AggregateMetric::SumAcross {
                group_by: transform_box(group_by, |g| g.transform(r))?,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::FieldMin {
                field,
                metric,
                filter,
            } => AggregateMetric::FieldMin {
                field,
                metric: transform_opt(metric, |m| transform_box(m, |m| m.transform(r)))?,
                filter: transform_opt(filter, |f| transform_box(f, |f| f.transform(r)))?,
            },
            AggregateMetric::FieldMax {
                field,
                metric,
                filter,
            } => AggregateMetric::FieldMax {
                field,
                metric: transform_opt(metric, |m| transform_box(m, |m| m.transform(r)))?,
                filter: transform_opt(filter, |f| transform_box(f, |f| f.transform(r)))?,
            },
            AggregateMetric::Bootstrap {
                field,
                filter,
                metric,
                num_bootstraps,
                seed,
                outputs,
            } => AggregateMetric::Bootstrap {
                field,
                filter: transform_opt(filter, |f| transform_box(f, |f| f.transform(r)))?,
                metric: transform_box(metric, |m| m.transform(r))?,
                num_bootstraps,
                seed,
                outputs,
            },
            AggregateMetric::DivideByCount(m) => {
                AggregateMetric::DivideByCount(transform_box(m, |m| m.transform(r))?)
            }
            AggregateMetric::Named { name, metric } => AggregateMetric::Named {
                name,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => AggregateMetric::IfThenElse {
                condition: transform_box(condition, |f| f.transform(r))?,
                then: transform_box(then, |m| m.transform(r))?,
                otherwise: transform_box(otherwise, |m| m.transform(r))?,
            },
        };
        r.metric(rebuilt)
    }

    /// Shallow rewrite: applies `f` to the nearest aggregate metric positions
    /// below this node, reaching through filters and group-bys but not into
    /// the metrics `f` returns.
    pub fn traverse1(self, f: &mut MetricFn<'_>) -> CompileResult<AggregateMetric> {
        Ok(match self {
            leaf @ (AggregateMetric::Constant(_)
            | AggregateMetric::DocStats(_)
            | AggregateMetric::DocStatsPushes { .. }
            | AggregateMetric::Percentile { .. }
            | AggregateMetric::GroupStatsLookup(_)
            | AggregateMetric::GroupStatsMultiLookup(_)) => leaf,
            AggregateMetric::Add(metrics) => AggregateMetric::add(transform_vec(metrics, &mut *f)?),
            AggregateMetric::Binary { op, left, right } => AggregateMetric::Binary {
                op,
                left: transform_box(left, &mut *f)?,
                right: transform_box(right, &mut *f)?,
            },
            AggregateMetric::Negate(m) => AggregateMetric::Negate(transform_box(m, &mut *f)?),
            AggregateMetric::Abs(m) => AggregateMetric::Abs(transform_box(m, &mut *f)?),
            AggregateMetric::Log(m) => AggregateMetric::Log(transform_box(m, &mut *f)?),
            AggregateMetric::Min(ms) => AggregateMetric::Min(transform_vec(ms, &mut *f)?),
            AggregateMetric::Max(ms) => AggregateMetric::Max(transform_vec(ms, &mut *f)?),
            AggregateMetric::Parent(m) => AggregateMetric::Parent(transform_box(m, &mut *f)?),
            AggregateMetric::Lag { delay, metric } => AggregateMetric::Lag {
                delay,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::IterateLag { delay, metric } => AggregateMetric::IterateLag {
                delay,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::Window { size, metric } => AggregateMetric::Window {
                size,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::Running(m) => AggregateMetric::Running(transform_box(m, &mut *f)?),
            AggregateMetric::Qualified { scope, metric } => AggregateMetric::Qualified {
                scope,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::Distinct {
                field,
                filter,
                window,
            } => AggregateMetric::Distinct {
                field,
                filter: transform_opt(filter, |x| transform_box(x, |x| x.traverse1(f)))?,
                window,
            },
            AggregateMetric::SumAcross { group_by, metric } => AggregateMetric::SumAcross {
                group_by: transform_box(group_by, |g| g.traverse1(f))?,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::FieldMin {
                field,
                metric,
                filter,
            } => AggregateMetric::FieldMin {
                field,
                metric: transform_opt(metric, |m| transform_box(m, &mut *f))?,
                filter: transform_opt(filter, |x| transform_box(x, |x| x.traverse1(f)))?,
            },
            AggregateMetric::FieldMax {
                field,
                metric,
                filter,
            } => AggregateMetric::FieldMax {
                field,
                metric: transform_opt(metric, |m| transform_box(m, &mut *f))?,
                filter: transform_opt(filter, |x| transform_box(x, |x| x.traverse1(f)))?,
            },
            AggregateMetric::Bootstrap {
                field,
                filter,
                metric,
                num_bootstraps,
                seed,
                outputs,
            } => AggregateMetric::Bootstrap {
                field,
                filter: transform_opt(filter, |x| transform_box(x, |x| x.traverse1(f)))?,
                metric: transform_box(metric, &mut *f)?,
                num_bootstraps,
                seed,
                outputs,
            },
            AggregateMetric::DivideByCount(m) => AggregateMetric::DivideByCount(transform_box(m, &mut *f)?),
            AggregateMetric::Named { name, metric } => AggregateMetric::Named {
                name,
                metric: transform_box(metric, &mut *f)?,
            },
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => AggregateMetric::IfThenElse {
                condition: transform_box(condition, |c| c.traverse1(f))?,
                then: transform_box(then, &mut *f)?,
                otherwise: transform_box(otherwise, &mut *f)?,
            },
        })
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, metrics: &[AggregateMetric]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, m) in metrics.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", m)?;
    }
    write!(f, ")")
}

impl fmt::Display for AggregateMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateMetric::Constant(v) => write!(f, "{}", v),
            AggregateMetric::DocStats(m) => write!(f, "[{}]", m),
            AggregateMetric::DocStatsPushes { dataset, metric } => write!(f, "{}.[{}]", dataset, metric),
            AggregateMetric::Add(ms) => {
                write!(f, "(")?;
                for (i, m) in ms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, ")")
            }
            AggregateMetric::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            AggregateMetric::Negate(m) => write!(f, "-{}", m),
            AggregateMetric::Abs(m) => write!(f, "abs({})", m),
            AggregateMetric::Log(m) => write!(f, "log({})", m),
            AggregateMetric::Min(ms) => write_list(f, "min", ms),
            AggregateMetric::Max(ms) => write_list(f, "max", ms),
            AggregateMetric::Parent(m) => write!(f, "parent({})", m),
            AggregateMetric::Lag { delay, metric } => write!(f, "lag({}, {})", delay, metric),
            AggregateMetric::IterateLag { delay, metric } => write!(f, "iterate_lag({}, {})", delay, metric),
            AggregateMetric::Window { size, metric } => write!(f, "window({}, {})", size, metric),
            AggregateMetric::Running(m) => write!(f, "running({})", m),
            AggregateMetric::Qualified { scope, metric } => {
                let names: Vec<&str> = scope.iter().map(String::as_str).collect();
                write!(f, "[{}].{}", names.join(","), metric)
            }
            AggregateMetric::Percentile { field, percentile } => {
                write!(f, "percentile({}, {})", field.name(), percentile)
            }
            AggregateMetric::Distinct { field, filter, window } => {
                write!(f, "distinct({}", field.name())?;
                if let Some(filter) = filter {
                    write!(f, " having {}", filter)?;
                }
                if let Some(window) = window {
                    write!(f, ", window {}", window)?;
                }
                write!(f, ")")
            }
            AggregateMetric::SumAcross { group_by, metric } => write!(f, "sum_over({}, {})", group_by, metric),
            AggregateMetric::FieldMin { field, .. } => write!(f, "field_min({})", field.name()),
            AggregateMetric::FieldMax { field, .. } => write!(f, "field_max({})", field.name()),
            AggregateMetric::Bootstrap {
                field,
                metric,
                num_bootstraps,
                seed,
                ..
            } => write!(f, "bootstrap({}, {}, {}, \"{}\")", field.name(), metric, num_bootstraps, seed),
            AggregateMetric::DivideByCount(m) => write!(f, "avg({})", m),
            AggregateMetric::Named { name, metric } => write!(f, "{} as {}", metric, name),
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => write!(f, "if {} then {} else {}", condition, then, otherwise),
            AggregateMetric::GroupStatsLookup(name) => write!(f, "${}", name),
            AggregateMetric::GroupStatsMultiLookup(names) => write!(f, "${}", names.join(",$")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::field::scope_of;

    fn oji() -> AggregateMetric {
        AggregateMetric::doc_stats(DocMetric::Field(FieldSet::int("oji", &["jobsearch"])))
    }

    fn user() -> FieldSet {
        FieldSet::string("user", &["jobsearch"])
    }

    #[test]
    fn test_add_flattens() {
        let sum = AggregateMetric::add(vec![oji(), AggregateMetric::add(vec![oji(), oji()])]);
        match sum {
            AggregateMetric::Add(ms) => assert_eq!(ms.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_contains_ftgs_is_deep() {
        let shallow = AggregateMetric::divide(oji(), AggregateMetric::Constant(2.0));
        assert!(!shallow.contains_ftgs());
        let deep = AggregateMetric::divide(oji(), AggregateMetric::distinct(user()));
        assert!(!deep.requires_ftgs());
        assert!(deep.contains_ftgs());
    }

    #[test]
    fn test_need_sorted_propagates() {
        let window = AggregateMetric::Window {
            size: 3,
            metric: Box::new(oji()),
        };
        assert!(window.need_sorted());
        assert!(AggregateMetric::divide(oji(), window).need_sorted());
        assert!(!oji().need_sorted());
    }

    #[test]
    fn test_visit_reaches_every_node() {
        let metric = AggregateMetric::if_then_else(
            AggregateFilter::compare(
                crate::language::doc_metric::CompareOp::Gt,
                oji(),
                AggregateMetric::distinct(user()),
            ),
            AggregateMetric::Constant(0.0),
            AggregateMetric::SumAcross {
                group_by: Box::new(GroupBy::top(user(), 3, oji())),
                metric: Box::new(oji()),
            },
        );
        let mut visited = Vec::new();
        metric.visit(&mut |m: &AggregateMetric| visited.push(m.to_string()));
        assert_eq!(visited.len(), 7);
        assert!(visited[0].starts_with("if "));
        assert_eq!(visited.iter().filter(|v| v.as_str() == oji().to_string()).count(), 3);
    }

    #[test]
    fn test_traverse1_is_shallow() {
        let metric = AggregateMetric::divide(
            AggregateMetric::parent(oji()),
            AggregateMetric::Qualified {
                scope: scope_of(["jobsearch"]),
                metric: Box::new(oji()),
            },
        );
        let mut visited = Vec::new();
        let out = metric
            .traverse1(&mut |m: AggregateMetric| {
                visited.push(m.to_string());
                Ok(m)
            })
            .unwrap();
        assert_eq!(visited.len(), 2);
        assert!(visited[0].starts_with("parent("));
        assert!(visited[1].starts_with("[jobsearch]."));
        assert!(matches!(out, AggregateMetric::Binary { .. }));
    }

    #[test]
    fn test_traverse1_reaches_through_filters() {
        let metric = AggregateMetric::Distinct {
            field: user(),
            filter: Some(Box::new(AggregateFilter::compare(
                crate::language::doc_metric::CompareOp::Gt,
                oji(),
                AggregateMetric::Constant(1.0),
            ))),
            window: None,
        };
        let mut count = 0;
        metric
            .traverse1(&mut |m: AggregateMetric| {
                count += 1;
                Ok(m)
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_bootstrap_slot_names() {
        assert_eq!(BootstrapOutput::Mean.slot_names("v0", 3), vec!["v0.mean"]);
        assert_eq!(
            BootstrapOutput::All.slot_names("v0", 2),
            vec!["v0.values[0]", "v0.values[1]"]
        );
    }
}
