//! Term-level output: fused final explode and field sampling

use std::collections::BTreeMap;

use super::errors::ExecutionResult;
use super::group_keys::GroupKey;
use super::metrics::{columns, EvalContext, EvalMode, PushLayout};
use super::result::{Row, SampledTerms};
use super::session::Session;
use super::topk::TopK;
use crate::language::{AggregateFilter, AggregateMetric, FieldSet, Term};

impl Session {
    /// Rows per (group, term) without building the last grouping level.
    /// Groups come out in id order; within a group, terms follow the
    /// top-k order when `limit` is set and term order otherwise, the same
    /// order an explode followed by group stats produces.
    pub(super) fn simple_iterate(
        &mut self,
        field: &FieldSet,
        filter: Option<&AggregateFilter>,
        limit: Option<usize>,
        metric: Option<&AggregateMetric>,
        selects: &[AggregateMetric],
    ) -> ExecutionResult<()> {
        let mut layout = PushLayout::new();
        let mut compiled_filter = self.compile_filter(&mut layout, filter, EvalMode::Term)?;
        let ordering = match (limit, metric) {
            (Some(_), Some(metric)) => Some(metric.clone()),
            (Some(_), None) => Some(self.default_term_metric(field)),
            (None, _) => None,
        };
        let mut compiled_ordering = match &ordering {
            Some(m) => self
                .compile_metrics(&mut layout, std::slice::from_ref(m), EvalMode::Term)?
                .pop(),
            None => None,
        };
        let columns = columns(selects);
        let mut compiled_selects = self.compile_metrics(&mut layout, &columns, EvalMode::Term)?;
        let sorted = filter.map_or(false, AggregateFilter::need_sorted)
            || ordering.as_ref().map_or(false, AggregateMetric::need_sorted)
            || columns.iter().any(AggregateMetric::need_sorted);

        let tuples = self.iterate_field(field, &layout, sorted)?;

        let mut per_group: BTreeMap<usize, Vec<(Term, Vec<f64>)>> = BTreeMap::new();
        let mut tops: BTreeMap<usize, TopK<(Term, Vec<f64>)>> = BTreeMap::new();
        let mut emitted = 0usize;
        for t in &tuples {
            let ctx = EvalContext {
                group: t.group,
                parent: self.keys.parent(t.group),
                term: Some(&t.term),
                stats: &t.stats,
                is_default: false,
            };
            if !compiled_filter.eval(&ctx) {
                continue;
            }
            let values: Vec<f64> = compiled_selects.iter_mut().map(|m| m.eval(&ctx)).collect();
            match (limit, compiled_ordering.as_mut()) {
                (Some(limit), Some(ordering)) => {
                    let rank = ordering.eval(&ctx);
                    tops.entry(t.group)
                        .or_insert_with(|| TopK::new(limit))
                        .offer(rank, (t.term.clone(), values));
                }
                _ => {
                    if emitted >= self.config.row_limit {
                        self.note_truncated();
                        break;
                    }
                    emitted += 1;
                    per_group.entry(t.group).or_default().push((t.term.clone(), values));
                }
            }
        }
        for entries in per_group.values_mut() {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
        }
        for (group, top) in tops {
            per_group.insert(group, top.into_sorted().into_iter().map(|(_, entry)| entry).collect());
        }

        let mut rows = Vec::new();
        for (group, entries) in per_group {
            let path = self.keys.key_path(group);
            for (term, values) in entries {
                let mut keys = path.clone();
                keys.push(GroupKey::Term(term));
                rows.push(Row::new(keys, values));
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.add_rows(rows.len() as u64);
        }
        self.rows.extend(rows);
        Ok(())
    }

    /// Record the first `limit` terms of each field per group, in term order
    pub(super) fn sample_fields(&mut self, fields: &[(FieldSet, usize)]) -> ExecutionResult<()> {
        let layout = PushLayout::new();
        for (field, limit) in fields {
            let tuples = self.iterate_field(field, &layout, true)?;
            let mut per_group: BTreeMap<usize, Vec<Term>> = BTreeMap::new();
            for t in tuples {
                let terms = per_group.entry(t.group).or_default();
                if terms.len() < *limit {
                    terms.push(t.term);
                }
            }
            for (group, terms) in per_group {
                self.sampled.push(SampledTerms {
                    field: field.name().to_string(),
                    keys: self.keys.key_path(group),
                    terms,
                });
            }
        }
        Ok(())
    }
}
