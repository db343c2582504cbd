//! Depth staging of full-pass computations
//!
//! Walks group-bys left to right and then the selects, replacing every
//! aggregate that needs its own pass over the data with a lookup of a named
//! slot. Each slot is recorded with the pipeline depth it has to run at and
//! the dataset scope it covers.
//!
//! Depth numbering: group-by `i` runs with depth `i + 1`, the selects with
//! depth `n` (the number of group-bys). A pre-computation lands at the
//! current depth and runs before the group-by at that position explodes. A
//! post-computation lands one shallower and runs right after the group-by
//! at that position explodes, before its HAVING filter.

use serde::{Deserialize, Serialize};

use crate::language::{
    AggregateFilter, AggregateMetric, CompileError, CompileResult, DocMetric, FieldSet, GroupBy,
    GroupByEntry, Query, Scope,
};

use super::precomputed::Precomputed;

/// When a computation runs relative to the group-by at its depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputationType {
    /// Before the group-by at this depth explodes
    PreComputation,
    /// After the group-by at this depth explodes, before its HAVING filter
    PostComputation,
}

/// Deduplication key of a computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationInfo {
    pub precomputed: Precomputed,
    pub depth: usize,
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedComputation {
    pub info: ComputationInfo,
    pub kind: ComputationType,
    pub name: String,
}

/// Output of staging: the rewritten query plus every named computation in
/// the order it was first requested
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub query: Query,
    pub computations: Vec<NamedComputation>,
}

impl Extracted {
    pub fn at(&self, depth: usize, kind: ComputationType) -> impl Iterator<Item = &NamedComputation> {
        self.computations
            .iter()
            .filter(move |c| c.kind == kind && c.info.depth == depth)
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.computations.iter().map(|c| c.info.depth).max()
    }
}

/// Stage every full-pass computation of `query`
pub fn extract_precomputed(query: Query) -> CompileResult<Extracted> {
    let scope = query.scope();
    let Query {
        datasets,
        filter,
        group_bys,
        selects,
        row_limit,
        sample_fields,
    } = query;

    let mut processor = Processor::new(scope);
    let mut staged = Vec::with_capacity(group_bys.len());
    for (i, entry) in group_bys.into_iter().enumerate() {
        let depth = i as i64 + 1;
        processor.set_depths(depth, depth, depth);
        staged.push(processor.stage_group_by(entry)?);
    }

    let n = staged.len() as i64;
    processor.set_depths(n, n, n + 1);
    let selects = selects
        .into_iter()
        .map(|select| processor.apply(select))
        .collect::<CompileResult<Vec<_>>>()?;

    Ok(Extracted {
        query: Query {
            datasets,
            filter,
            group_bys: staged,
            selects,
            row_limit,
            sample_fields,
        },
        computations: processor.computations,
    })
}

struct Processor {
    depth: i64,
    start_depth: i64,
    max_depth: i64,
    scope: Scope,
    kind: ComputationType,
    /// Deepest slot a DISTINCT filter being staged may read. Its filter
    /// runs inside the distinct's own pass, so nothing below the call site
    /// exists yet.
    ceiling: Option<i64>,
    next_name: usize,
    computations: Vec<NamedComputation>,
}

impl Processor {
    fn new(scope: Scope) -> Self {
        Self {
            depth: 1,
            start_depth: 1,
            max_depth: 1,
            scope,
            kind: ComputationType::PreComputation,
            ceiling: None,
            next_name: 0,
            computations: Vec::new(),
        }
    }

    fn set_depths(&mut self, depth: i64, start_depth: i64, max_depth: i64) {
        self.depth = depth;
        self.start_depth = start_depth;
        self.max_depth = max_depth;
    }

    fn stage_group_by(&mut self, entry: GroupByEntry) -> CompileResult<GroupByEntry> {
        let GroupByEntry {
            group_by,
            filter,
            alias,
        } = entry;

        let field_filter_extracts = matches!(
            &group_by,
            GroupBy::ByField { filter: Some(f), .. } if f.needs_precomputation()
        );
        let entry_filter_extracts = filter
            .as_ref()
            .map_or(false, AggregateFilter::needs_precomputation);

        if !field_filter_extracts && !entry_filter_extracts {
            return Ok(GroupByEntry {
                group_by: self.traverse_group_by(group_by)?,
                filter: self.traverse_filter(filter)?,
                alias,
            });
        }

        // the HAVING filter needs data that only exists once this group-by
        // has exploded, so it moves off the group-by onto the entry
        self.kind = ComputationType::PostComputation;
        let (group_by, having) = match group_by {
            GroupBy::ByField {
                field,
                filter: field_filter,
                limit,
                metric,
                with_default,
            } => {
                let having = match (field_filter, filter) {
                    (Some(a), Some(b)) => Some(AggregateFilter::and(a, b)),
                    (a, b) => a.or(b),
                };
                let stripped = GroupBy::ByField {
                    field,
                    filter: None,
                    limit,
                    metric,
                    with_default,
                };
                (stripped, having)
            }
            other => (other, filter),
        };
        let staged = self
            .traverse_filter(having)
            .and_then(|having| Ok((self.traverse_group_by(group_by)?, having)));
        self.kind = ComputationType::PreComputation;

        let (group_by, filter) = staged?;
        Ok(GroupByEntry {
            group_by,
            filter,
            alias,
        })
    }

    fn traverse_group_by(&mut self, group_by: GroupBy) -> CompileResult<GroupBy> {
        group_by.traverse1(&mut |m: AggregateMetric| self.apply(m))
    }

    fn traverse_filter(&mut self, filter: Option<AggregateFilter>) -> CompileResult<Option<AggregateFilter>> {
        filter
            .map(|f| f.traverse1(&mut |m: AggregateMetric| self.apply(m)))
            .transpose()
    }

    fn apply(&mut self, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        match metric {
            AggregateMetric::Parent(inner) => {
                let prev = self.depth;
                self.depth = prev - 1;
                let result = self.apply(*inner);
                self.depth = prev;
                result
            }
            AggregateMetric::Distinct {
                field,
                filter,
                window,
            } => {
                if window.is_some() && filter.is_some() {
                    return Err(CompileError::structural(format!(
                        "DISTINCT({}) cannot combine a window with a filter",
                        field.name()
                    )));
                }
                let filter = match filter {
                    Some(filter) => {
                        // the filter runs one level deeper than the call site
                        let (prev_depth, prev_start, prev_ceiling) = (self.depth, self.start_depth, self.ceiling);
                        self.ceiling = Some(self.slot_depth());
                        self.depth = prev_depth + 1;
                        self.start_depth = prev_depth + 1;
                        let result = (*filter).traverse1(&mut |m: AggregateMetric| self.apply(m));
                        self.depth = prev_depth;
                        self.start_depth = prev_start;
                        self.ceiling = prev_ceiling;
                        Some(result?)
                    }
                    None => None,
                };
                self.lookup(Precomputed::Distinct {
                    field,
                    filter,
                    window,
                })
            }
            AggregateMetric::Percentile { field, percentile } => {
                self.lookup(Precomputed::Percentile { field, percentile })
            }
            AggregateMetric::Qualified { scope, metric } => {
                if !scope.is_subset(&self.scope) {
                    return Err(CompileError::scope(format!(
                        "qualified scope {:?} is not a subset of the enclosing scope {:?}",
                        scope, self.scope
                    )));
                }
                let outer = std::mem::replace(&mut self.scope, scope);
                let result = self.apply(*metric);
                self.scope = outer;
                result
            }
            AggregateMetric::DocStats(doc_metric) => {
                if self.start_depth != self.depth {
                    return self.lookup(Precomputed::RawStats(doc_metric));
                }
                let qualifications = doc_metric.qualifications();
                let push_scope = match qualifications.len() {
                    0 => self.scope.clone(),
                    1 => qualifications,
                    _ => {
                        return Err(CompileError::scope(format!(
                            "document metric {} is qualified by several datasets {:?}",
                            doc_metric, qualifications
                        )))
                    }
                };
                Ok(AggregateMetric::add(
                    push_scope
                        .into_iter()
                        .map(|dataset| AggregateMetric::DocStatsPushes {
                            dataset,
                            metric: doc_metric.clone(),
                        })
                        .collect(),
                ))
            }
            AggregateMetric::SumAcross { group_by, metric } => self.sum_across(*group_by, *metric),
            AggregateMetric::FieldMin {
                field,
                metric,
                filter,
            } => {
                require_int(&field)?;
                let metric = self.apply(AggregateMetric::Negate(Box::new(field_average_or(metric, &field))))?;
                let filter = self.traverse_filter(filter.map(|f| *f))?;
                self.lookup(Precomputed::FieldMin {
                    field,
                    metric,
                    filter,
                })
            }
            AggregateMetric::FieldMax {
                field,
                metric,
                filter,
            } => {
                require_int(&field)?;
                let metric = self.apply(field_average_or(metric, &field))?;
                let filter = self.traverse_filter(filter.map(|f| *f))?;
                self.lookup(Precomputed::FieldMax {
                    field,
                    metric,
                    filter,
                })
            }
            AggregateMetric::Bootstrap {
                field,
                filter,
                metric,
                num_bootstraps,
                seed,
                outputs,
            } => {
                if outputs.is_empty() || num_bootstraps == 0 {
                    return Err(CompileError::structural(format!(
                        "BOOTSTRAP over {} needs at least one output and one sample",
                        field.name()
                    )));
                }
                let filter = self.traverse_filter(filter.map(|f| *f))?;
                let metric = self.apply(*metric)?;
                let precomputed = Precomputed::Bootstrap {
                    field,
                    filter,
                    metric,
                    num_bootstraps,
                    seed,
                    outputs,
                };
                let slots_of = precomputed.clone();
                let name = self.register(precomputed)?;
                Ok(AggregateMetric::GroupStatsMultiLookup(slots_of.slot_names(&name)))
            }
            AggregateMetric::DivideByCount(inner) => {
                let numerator = self.apply(*inner)?;
                let datasets = self.touched_datasets(&numerator);
                if datasets.is_empty() {
                    return Err(CompileError::structural(format!(
                        "averaging over no documents is undefined: {}",
                        numerator
                    )));
                }
                let count = AggregateMetric::add(
                    datasets
                        .into_iter()
                        .map(|dataset| AggregateMetric::DocStatsPushes {
                            metric: DocMetric::qualified(dataset.clone(), DocMetric::Count),
                            dataset,
                        })
                        .collect(),
                );
                Ok(AggregateMetric::divide(numerator, count))
            }
            other => other.traverse1(&mut |m: AggregateMetric| self.apply(m)),
        }
    }

    fn sum_across(&mut self, group_by: GroupBy, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        if let GroupBy::ByMetric {
            exclude_gutters: false,
            ..
        } = &group_by
        {
            return Err(CompileError::structural(
                "SUM_OVER(BUCKET(...), metric) with gutters sums over every document; exclude the gutters",
            ));
        }

        match group_by {
            GroupBy::ByField {
                field,
                filter,
                limit: None,
                ..
            } => {
                let metric = self.apply(metric)?;
                let filter = self.traverse_filter(filter)?;
                self.lookup(Precomputed::SumAcrossField {
                    field,
                    metric,
                    filter,
                })
            }
            total if total.is_total() => {
                let group_by = self.traverse_group_by(total)?;
                let metric = self.apply(metric)?;
                self.lookup(Precomputed::SumAcrossGroupBy { group_by, metric })
            }
            partial => {
                // the default bucket of the totalized form must not count
                let totalized = partial.make_total();
                let guarded = AggregateMetric::if_then_else(
                    AggregateFilter::IsDefaultGroup,
                    AggregateMetric::Constant(0.0),
                    metric,
                );
                let group_by = self.traverse_group_by(totalized)?;
                let metric = self.apply(guarded)?;
                self.lookup(Precomputed::SumAcrossGroupBy { group_by, metric })
            }
        }
    }

    fn touched_datasets(&self, metric: &AggregateMetric) -> Scope {
        let mut datasets = Scope::new();
        metric.visit(&mut |m: &AggregateMetric| match m {
            AggregateMetric::DocStatsPushes { dataset, .. } => {
                datasets.insert(dataset.clone());
            }
            AggregateMetric::GroupStatsLookup(name) => {
                datasets.extend(slot_scope(&self.computations, name));
            }
            AggregateMetric::GroupStatsMultiLookup(names) => {
                for name in names {
                    datasets.extend(slot_scope(&self.computations, name));
                }
            }
            _ => {}
        });
        datasets
    }

    fn lookup(&mut self, precomputed: Precomputed) -> CompileResult<AggregateMetric> {
        self.register(precomputed).map(AggregateMetric::GroupStatsLookup)
    }

    /// Depth a computation requested right now is stored at
    fn slot_depth(&self) -> i64 {
        match self.kind {
            ComputationType::PreComputation => self.depth,
            ComputationType::PostComputation => self.depth - 1,
        }
    }

    fn register(&mut self, precomputed: Precomputed) -> CompileResult<String> {
        let depth = self.slot_depth();
        if self.ceiling.map_or(false, |ceiling| depth > ceiling) {
            return Err(CompileError::depth(format!(
                "computation required in the future: {} is needed per term inside a DISTINCT filter",
                precomputed
            )));
        }
        if depth < 0 {
            return Err(CompileError::depth(format!(
                "computation reached negative depth: {}",
                precomputed
            )));
        }
        if depth > self.max_depth {
            return Err(CompileError::depth(format!(
                "computation required in the future: {}",
                precomputed
            )));
        }

        let info = ComputationInfo {
            precomputed,
            depth: depth as usize,
            scope: self.scope.clone(),
        };
        let kind = self.kind;
        if let Some(existing) = self
            .computations
            .iter()
            .find(|c| c.kind == kind && c.info == info)
        {
            return Ok(existing.name.clone());
        }

        let name = format!("v{}", self.next_name);
        self.next_name += 1;
        self.computations.push(NamedComputation {
            info,
            kind,
            name: name.clone(),
        });
        Ok(name)
    }
}

/// Scope of the computation publishing `slot` (a name or a bootstrap slot)
fn slot_scope(computations: &[NamedComputation], slot: &str) -> Scope {
    computations
        .iter()
        .filter(|c| {
            c.name == slot
                || slot
                    .strip_prefix(c.name.as_str())
                    .map_or(false, |rest| rest.starts_with('.'))
        })
        .flat_map(|c| c.info.scope.iter().cloned())
        .collect()
}

fn require_int(field: &FieldSet) -> CompileResult<()> {
    if field.is_int() {
        Ok(())
    } else {
        Err(CompileError::structural(format!(
            "FIELD_MIN/FIELD_MAX need an int field, '{}' is a string field",
            field.name()
        )))
    }
}

/// The explicit ordering metric, or the per-term average of the field
fn field_average_or(metric: Option<Box<AggregateMetric>>, field: &FieldSet) -> AggregateMetric {
    match metric {
        Some(metric) => *metric,
        None => AggregateMetric::DivideByCount(Box::new(AggregateMetric::add(
            field
                .datasets()
                .into_iter()
                .map(|dataset| AggregateMetric::DocStatsPushes {
                    dataset,
                    metric: DocMetric::Field(field.clone()),
                })
                .collect(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{scope_of, CompareOp, Dataset, DocMetric, QueryBuilder};
    use chrono::{TimeZone, Utc};

    fn dataset(name: &str) -> Dataset {
        Dataset::new(
            name,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    fn user() -> FieldSet {
        FieldSet::string("user", &["ds"])
    }

    fn query_field() -> FieldSet {
        FieldSet::string("q", &["ds"])
    }

    fn count() -> AggregateMetric {
        AggregateMetric::doc_stats(DocMetric::Count)
    }

    fn one_group_by(selects: Vec<AggregateMetric>) -> Query {
        QueryBuilder::new()
            .from(dataset("ds"))
            .group_by(GroupBy::by_field(query_field()))
            .select(selects)
            .build()
            .unwrap()
    }

    #[test]
    fn test_distinct_deduplicated() {
        let query = one_group_by(vec![
            AggregateMetric::distinct(user()),
            AggregateMetric::divide(count(), AggregateMetric::distinct(user())),
        ]);
        let extracted = extract_precomputed(query).unwrap();
        assert_eq!(extracted.computations.len(), 1);
        let computation = &extracted.computations[0];
        assert_eq!(computation.info.depth, 1);
        assert_eq!(computation.kind, ComputationType::PreComputation);
        assert_eq!(computation.name, "v0");

        let selects = &extracted.query.selects;
        assert_eq!(selects[0], AggregateMetric::GroupStatsLookup("v0".into()));
        match &selects[1] {
            AggregateMetric::Binary { right, .. } => {
                assert_eq!(**right, AggregateMetric::GroupStatsLookup("v0".into()))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_doc_stats_expand_per_dataset() {
        let query = QueryBuilder::new()
            .from(dataset("a"))
            .from(dataset("b"))
            .select(vec![count()])
            .build()
            .unwrap();
        let extracted = extract_precomputed(query).unwrap();
        assert!(extracted.computations.is_empty());
        match &extracted.query.selects[0] {
            AggregateMetric::Add(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parent_stats_precomputed_one_level_up() {
        let query = one_group_by(vec![AggregateMetric::parent(count())]);
        let extracted = extract_precomputed(query).unwrap();
        assert_eq!(extracted.computations.len(), 1);
        assert_eq!(extracted.computations[0].info.depth, 0);
        assert_eq!(
            extracted.computations[0].info.precomputed,
            Precomputed::RawStats(DocMetric::Count)
        );
    }

    #[test]
    fn test_parent_past_the_root_is_negative_depth() {
        let query = one_group_by(vec![AggregateMetric::parent(AggregateMetric::parent(
            AggregateMetric::distinct(user()),
        ))]);
        let err = extract_precomputed(query).unwrap_err();
        assert!(matches!(err, CompileError::Depth(ref m) if m.contains("negative")));
    }

    #[test]
    fn test_nested_distinct_filters_reach_the_future() {
        let innermost = AggregateMetric::distinct(FieldSet::string("c", &["ds"]));
        let middle = AggregateMetric::Distinct {
            field: FieldSet::string("b", &["ds"]),
            filter: Some(Box::new(AggregateFilter::compare(
                CompareOp::Gt,
                innermost,
                AggregateMetric::Constant(0.0),
            ))),
            window: None,
        };
        let outer = AggregateMetric::Distinct {
            field: user(),
            filter: Some(Box::new(AggregateFilter::compare(
                CompareOp::Gt,
                middle,
                AggregateMetric::Constant(0.0),
            ))),
            window: None,
        };
        let query = QueryBuilder::new()
            .from(dataset("ds"))
            .select(vec![outer])
            .build()
            .unwrap();
        let err = extract_precomputed(query).unwrap_err();
        assert!(matches!(err, CompileError::Depth(ref m) if m.contains("future")));
    }

    #[test]
    fn test_distinct_filter_reads_only_at_or_above_call_site() {
        let filtered = |m: AggregateMetric| AggregateMetric::Distinct {
            field: user(),
            filter: Some(Box::new(AggregateFilter::compare(
                CompareOp::Gt,
                m,
                AggregateMetric::Constant(0.0),
            ))),
            window: None,
        };

        let per_term = filtered(AggregateMetric::distinct(FieldSet::string("c", &["ds"])));
        let err = extract_precomputed(one_group_by(vec![per_term])).unwrap_err();
        assert!(matches!(err, CompileError::Depth(ref m) if m.contains("future")));

        let extracted = extract_precomputed(one_group_by(vec![filtered(AggregateMetric::parent(count()))])).unwrap();
        assert_eq!(extracted.computations.len(), 2);
        assert_eq!(extracted.computations[0].info.depth, 1);
        assert_eq!(
            extracted.computations[0].info.precomputed,
            Precomputed::RawStats(DocMetric::Count)
        );
        assert!(extracted.computations.iter().all(|c| c.info.depth == 1));
    }

    #[test]
    fn test_having_with_distinct_is_post_computation() {
        let having = AggregateFilter::compare(
            CompareOp::Gt,
            AggregateMetric::distinct(user()),
            AggregateMetric::Constant(10.0),
        );
        let group_by = GroupBy::ByField {
            field: query_field(),
            filter: Some(having),
            limit: None,
            metric: None,
            with_default: false,
        };
        let query = QueryBuilder::new()
            .from(dataset("ds"))
            .group_by(group_by)
            .build()
            .unwrap();
        let extracted = extract_precomputed(query).unwrap();
        assert_eq!(extracted.computations.len(), 1);
        assert_eq!(extracted.computations[0].kind, ComputationType::PostComputation);
        assert_eq!(extracted.computations[0].info.depth, 0);

        let entry = &extracted.query.group_bys[0];
        assert!(matches!(entry.group_by, GroupBy::ByField { filter: None, .. }));
        assert!(entry.filter.is_some());
    }

    #[test]
    fn test_sum_over_bucket_with_gutters_rejected() {
        let bucket = |exclude_gutters| GroupBy::ByMetric {
            metric: DocMetric::Field(FieldSet::int("x", &["ds"])),
            min: 0,
            max: 10,
            interval: 1,
            exclude_gutters,
            with_default: false,
        };
        let sum_over = |exclude_gutters| AggregateMetric::SumAcross {
            group_by: Box::new(bucket(exclude_gutters)),
            metric: Box::new(count()),
        };

        let err = extract_precomputed(one_group_by(vec![sum_over(false)])).unwrap_err();
        assert!(matches!(err, CompileError::Structural(_)));

        let extracted = extract_precomputed(one_group_by(vec![sum_over(true)])).unwrap();
        assert_eq!(extracted.computations.len(), 1);
        match &extracted.computations[0].info.precomputed {
            Precomputed::SumAcrossGroupBy { group_by, metric } => {
                assert!(group_by.is_total());
                assert!(matches!(group_by, GroupBy::ByMetric { with_default: true, .. }));
                assert!(matches!(metric, AggregateMetric::IfThenElse { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(extracted.computations[0].info.depth, 1);
    }

    #[test]
    fn test_sum_over_unlimited_field_is_single_pass() {
        let sum_over = AggregateMetric::SumAcross {
            group_by: Box::new(GroupBy::by_field(user())),
            metric: Box::new(count()),
        };
        let extracted = extract_precomputed(one_group_by(vec![sum_over])).unwrap();
        assert!(matches!(
            extracted.computations[0].info.precomputed,
            Precomputed::SumAcrossField { .. }
        ));
    }

    #[test]
    fn test_qualified_scope_must_be_subset() {
        let metric = AggregateMetric::Qualified {
            scope: scope_of(["other"]),
            metric: Box::new(count()),
        };
        let err = extract_precomputed(one_group_by(vec![metric])).unwrap_err();
        assert!(matches!(err, CompileError::Scope(_)));
    }

    #[test]
    fn test_divide_by_count_uses_touched_datasets() {
        let query = QueryBuilder::new()
            .from(dataset("a"))
            .from(dataset("b"))
            .select(vec![AggregateMetric::DivideByCount(Box::new(AggregateMetric::Qualified {
                scope: scope_of(["a"]),
                metric: Box::new(AggregateMetric::doc_stats(DocMetric::Field(FieldSet::int(
                    "x",
                    &["a", "b"],
                )))),
            }))])
            .build()
            .unwrap();
        let extracted = extract_precomputed(query).unwrap();
        match &extracted.query.selects[0] {
            AggregateMetric::Binary { right, .. } => assert_eq!(
                **right,
                AggregateMetric::DocStatsPushes {
                    dataset: "a".into(),
                    metric: DocMetric::qualified("a", DocMetric::Count),
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_divide_by_count_counts_lookup_datasets() {
        let query = QueryBuilder::new()
            .from(dataset("a"))
            .from(dataset("b"))
            .select(vec![AggregateMetric::DivideByCount(Box::new(AggregateMetric::Qualified {
                scope: scope_of(["b"]),
                metric: Box::new(AggregateMetric::distinct(FieldSet::string("u", &["a", "b"]))),
            }))])
            .build()
            .unwrap();
        let extracted = extract_precomputed(query).unwrap();
        match &extracted.query.selects[0] {
            AggregateMetric::Binary { left, right, .. } => {
                assert!(matches!(**left, AggregateMetric::GroupStatsLookup(_)));
                assert_eq!(
                    **right,
                    AggregateMetric::DocStatsPushes {
                        dataset: "b".into(),
                        metric: DocMetric::qualified("b", DocMetric::Count),
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_average_of_constant_rejected() {
        let metric = AggregateMetric::DivideByCount(Box::new(AggregateMetric::Constant(3.0)));
        let err = extract_precomputed(one_group_by(vec![metric])).unwrap_err();
        assert!(matches!(err, CompileError::Structural(ref m) if m.contains("no documents")));
    }

    #[test]
    fn test_bootstrap_publishes_slots() {
        let metric = AggregateMetric::Bootstrap {
            field: user(),
            filter: None,
            metric: Box::new(count()),
            num_bootstraps: 2,
            seed: "s".into(),
            outputs: vec![
                crate::language::BootstrapOutput::Mean,
                crate::language::BootstrapOutput::All,
            ],
        };
        let extracted = extract_precomputed(one_group_by(vec![metric])).unwrap();
        assert_eq!(
            extracted.query.selects[0],
            AggregateMetric::GroupStatsMultiLookup(vec![
                "v0.mean".into(),
                "v0.values[0]".into(),
                "v0.values[1]".into(),
            ])
        );
    }

    #[test]
    fn test_field_min_needs_int_field() {
        let metric = AggregateMetric::FieldMin {
            field: user(),
            metric: None,
            filter: None,
        };
        let err = extract_precomputed(one_group_by(vec![metric])).unwrap_err();
        assert!(matches!(err, CompileError::Structural(_)));

        let metric = AggregateMetric::FieldMin {
            field: FieldSet::int("x", &["ds"]),
            metric: None,
            filter: None,
        };
        let extracted = extract_precomputed(one_group_by(vec![metric])).unwrap();
        match &extracted.computations[0].info.precomputed {
            Precomputed::FieldMin { metric, .. } => {
                assert!(matches!(metric, AggregateMetric::Negate(_)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
