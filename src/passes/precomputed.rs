//! Full-pass computations extracted from a query
//!
//! Each variant carries what one dedicated pass needs. Identity is
//! structural: two equal values at the same depth and scope are computed
//! once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::language::{
    AggregateFilter, AggregateMetric, BootstrapOutput, DocMetric, FieldSet, GroupBy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Precomputed {
    /// Number of distinct terms of `field` per group, optionally only the
    /// terms passing `filter`, optionally summed over a window of siblings
    Distinct {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        window: Option<usize>,
    },
    Percentile {
        field: FieldSet,
        percentile: f64,
    },
    /// Sum of `metric` over every term of `field` passing `filter`
    SumAcrossField {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    /// Sum of `metric` over the children a total group-by would produce
    SumAcrossGroupBy {
        group_by: GroupBy,
        metric: AggregateMetric,
    },
    /// Term of `field` minimising the (already negated) metric
    FieldMin {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    /// Term of `field` maximising the metric
    FieldMax {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    Bootstrap {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        metric: AggregateMetric,
        num_bootstraps: usize,
        seed: String,
        outputs: Vec<BootstrapOutput>,
    },
    /// Plain per-group sum of a document metric, evaluated at a shallower
    /// depth than its reference
    RawStats(DocMetric),
}

impl Precomputed {
    /// Short kind tag used in logs and plans
    pub fn kind(&self) -> &'static str {
        match self {
            Precomputed::Distinct { .. } => "DISTINCT",
            Precomputed::Percentile { .. } => "PERCENTILE",
            Precomputed::SumAcrossField { .. } => "SUM_ACROSS_FIELD",
            Precomputed::SumAcrossGroupBy { .. } => "SUM_ACROSS_GROUP_BY",
            Precomputed::FieldMin { .. } => "FIELD_MIN",
            Precomputed::FieldMax { .. } => "FIELD_MAX",
            Precomputed::Bootstrap { .. } => "BOOTSTRAP",
            Precomputed::RawStats(_) => "RAW_STATS",
        }
    }

    /// Names of the slots this computation publishes when stored under `name`
    pub fn slot_names(&self, name: &str) -> Vec<String> {
        match self {
            Precomputed::Bootstrap {
                outputs,
                num_bootstraps,
                ..
            } => outputs
                .iter()
                .flat_map(|o| o.slot_names(name, *num_bootstraps))
                .collect(),
            _ => vec![name.to_string()],
        }
    }
}

fn write_filter(f: &mut fmt::Formatter<'_>, filter: &Option<AggregateFilter>) -> fmt::Result {
    match filter {
        Some(filter) => write!(f, " having {}", filter),
        None => Ok(()),
    }
}

impl fmt::Display for Precomputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precomputed::Distinct {
                field,
                filter,
                window,
            } => {
                write!(f, "distinct({}", field.name())?;
                write_filter(f, filter)?;
                if let Some(window) = window {
                    write!(f, ", window {}", window)?;
                }
                write!(f, ")")
            }
            Precomputed::Percentile { field, percentile } => {
                write!(f, "percentile({}, {})", field.name(), percentile)
            }
            Precomputed::SumAcrossField {
                field,
                metric,
                filter,
            } => {
                write!(f, "sum_across({}, {}", field.name(), metric)?;
                write_filter(f, filter)?;
                write!(f, ")")
            }
            Precomputed::SumAcrossGroupBy { group_by, metric } => {
                write!(f, "sum_across({}, {})", group_by, metric)
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
            } => {
                write!(f, "{}({} by {}", self.kind().to_lowercase(), field.name(), metric)?;
                write_filter(f, filter)?;
                write!(f, ")")
            }
            Precomputed::Bootstrap {
                field,
                metric,
                num_bootstraps,
                seed,
                ..
            } => write!(
                f,
                "bootstrap({}, {}, {}, \"{}\")",
                field.name(),
                metric,
                num_bootstraps,
                seed
            ),
            Precomputed::RawStats(metric) => write!(f, "raw_stats({})", metric),
        }
    }
}
