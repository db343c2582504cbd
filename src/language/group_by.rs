//! Group-by variants: how each current group splits into children

use std::fmt;

use serde::{Deserialize, Serialize};

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::AggregateMetric;
use super::doc_filter::DocFilter;
use super::doc_metric::DocMetric;
use super::errors::CompileResult;
use super::field::FieldSet;
use super::term::Term;
use super::transform::{transform_opt, MetricFn, Rewriter};

/// Name of the per-document timestamp field (seconds) used when a time
/// group-by does not name one
pub const DEFAULT_TIME_FIELD: &str = "unixtime";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupBy {
    /// One child per term, optionally filtered, or the top `limit` terms by
    /// `metric` (descending)
    ByField {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<usize>,
        metric: Option<AggregateMetric>,
        with_default: bool,
    },
    /// One child per listed term, in list order
    ByFieldIn {
        field: FieldSet,
        terms: Vec<Term>,
        with_default: bool,
    },
    /// Fixed-width buckets over a document metric in `[min, max)`
    ByMetric {
        metric: DocMetric,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
    },
    ByTime {
        period_seconds: i64,
        field: Option<FieldSet>,
    },
    ByTimeBuckets {
        num_buckets: usize,
        field: Option<FieldSet>,
    },
    ByMonth {
        field: Option<FieldSet>,
    },
    ByDayOfWeek {
        field: Option<FieldSet>,
    },
    ByQuantiles {
        field: FieldSet,
        num_buckets: usize,
    },
    /// Two children: documents failing the predicate, then documents passing
    ByPredicate(DocFilter),
}

impl GroupBy {
    pub fn by_field(field: FieldSet) -> Self {
        GroupBy::ByField {
            field,
            filter: None,
            limit: None,
            metric: None,
            with_default: false,
        }
    }

    /// Top `limit` terms of `field` ordered by `metric`
    pub fn top(field: FieldSet, limit: usize, metric: AggregateMetric) -> Self {
        GroupBy::ByField {
            field,
            filter: None,
            limit: Some(limit),
            metric: Some(metric),
            with_default: false,
        }
    }

    /// Whether every document of a parent group lands in some child
    pub fn is_total(&self) -> bool {
        match self {
            GroupBy::ByField {
                filter,
                limit,
                with_default,
                ..
            } => *with_default || (filter.is_none() && limit.is_none()),
            GroupBy::ByFieldIn { with_default, .. } => *with_default,
            GroupBy::ByMetric {
                exclude_gutters,
                with_default,
                ..
            } => *with_default || !*exclude_gutters,
            GroupBy::ByTime { .. }
            | GroupBy::ByTimeBuckets { .. }
            | GroupBy::ByMonth { .. }
            | GroupBy::ByDayOfWeek { .. }
            | GroupBy::ByQuantiles { .. }
            | GroupBy::ByPredicate(_) => true,
        }
    }

    /// The same split with a default bucket catching everything else
    pub fn make_total(self) -> GroupBy {
        if self.is_total() {
            return self;
        }
        match self {
            GroupBy::ByField {
                field,
                filter,
                limit,
                metric,
                ..
            } => GroupBy::ByField {
                field,
                filter,
                limit,
                metric,
                with_default: true,
            },
            GroupBy::ByFieldIn { field, terms, .. } => GroupBy::ByFieldIn {
                field,
                terms,
                with_default: true,
            },
            GroupBy::ByMetric {
                metric,
                min,
                max,
                interval,
                ..
            } => GroupBy::ByMetric {
                metric,
                min,
                max,
                interval,
                exclude_gutters: true,
                with_default: true,
            },
            total => total,
        }
    }

    pub fn need_sorted(&self) -> bool {
        match self {
            GroupBy::ByField { filter, metric, .. } => {
                filter.as_ref().map_or(false, AggregateFilter::need_sorted)
                    || metric.as_ref().map_or(false, AggregateMetric::need_sorted)
            }
            _ => false,
        }
    }

    /// Full bottom-up rewrite
    pub fn transform(self, r: &mut dyn Rewriter) -> CompileResult<GroupBy> {
        let rebuilt = match self {
            GroupBy::ByField {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => GroupBy::ByField {
                field,
                filter: transform_opt(filter, |f| f.transform(r))?,
                limit,
                metric: transform_opt(metric, |m| m.transform(r))?,
                with_default,
            },
            GroupBy::ByMetric {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => GroupBy::ByMetric {
                metric: metric.transform(r)?,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            },
            GroupBy::ByPredicate(filter) => GroupBy::ByPredicate(filter.transform(r)?),
            other => other,
        };
        r.group_by(rebuilt)
    }

    /// Applies `f` to the aggregate metrics of a field group-by
    pub fn traverse1(self, f: &mut MetricFn<'_>) -> CompileResult<GroupBy> {
        Ok(match self {
            GroupBy::ByField {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => GroupBy::ByField {
                field,
                filter: transform_opt(filter, |x| x.traverse1(f))?,
                limit,
                metric: transform_opt(metric, &mut *f)?,
                with_default,
            },
            other => other,
        })
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time_field = |field: &Option<FieldSet>| {
            field
                .as_ref()
                .map(|fs| fs.name().to_string())
                .unwrap_or_else(|| DEFAULT_TIME_FIELD.to_string())
        };
        match self {
            GroupBy::ByField {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => {
                write!(f, "{}", field.name())?;
                if let Some(limit) = limit {
                    write!(f, "[{}", limit)?;
                    if let Some(metric) = metric {
                        write!(f, " BY {}", metric)?;
                    }
                    write!(f, "]")?;
                }
                if let Some(filter) = filter {
                    write!(f, " HAVING {}", filter)?;
                }
                if *with_default {
                    write!(f, " WITH DEFAULT")?;
                }
                Ok(())
            }
            GroupBy::ByFieldIn {
                field,
                terms,
                with_default,
            } => {
                let terms: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                write!(f, "{} IN ({})", field.name(), terms.join(", "))?;
                if *with_default {
                    write!(f, " WITH DEFAULT")?;
                }
                Ok(())
            }
            GroupBy::ByMetric {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => {
                write!(f, "BUCKET({}, {}, {}, {}", metric, min, max, interval)?;
                if *exclude_gutters {
                    write!(f, ", EXCLUDE_GUTTERS")?;
                }
                write!(f, ")")?;
                if *with_default {
                    write!(f, " WITH DEFAULT")?;
                }
                Ok(())
            }
            GroupBy::ByTime { period_seconds, field } => {
                write!(f, "TIME({}s, {})", period_seconds, time_field(field))
            }
            GroupBy::ByTimeBuckets { num_buckets, field } => {
                write!(f, "TIME({}b, {})", num_buckets, time_field(field))
            }
            GroupBy::ByMonth { field } => write!(f, "MONTH({})", time_field(field)),
            GroupBy::ByDayOfWeek { field } => write!(f, "DAYOFWEEK({})", time_field(field)),
            GroupBy::ByQuantiles { field, num_buckets } => {
                write!(f, "QUANTILES({}, {})", field.name(), num_buckets)
            }
            GroupBy::ByPredicate(filter) => write!(f, "PREDICATE({})", filter),
        }
    }
}
