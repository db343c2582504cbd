//! Explodes: split every current group into children
//!
//! Each explode decides the children of every group, numbers them densely
//! in group order, regroups every dataset and then records the new layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeZone, Utc};

use super::engine::{Condition, RegroupRule};
use super::errors::{ExecutionError, ExecutionResult};
use super::group_keys::{ChildGroup, GroupKey};
use super::metrics::{EvalContext, EvalMode, PushLayout};
use super::session::{field_program, move_every_group, Session};
use super::topk::TopK;
use crate::language::{AggregateFilter, AggregateMetric, DocFilter, DocMetric, FieldSet, PushOp, QualifiedPush, Scope, Term};

const WEEKDAYS: [&str; 7] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"];

/// Most buckets one metric or time explode may create per group
const MAX_BUCKETS: i64 = 1 << 20;

/// New children, numbered from 1 in insertion order
#[derive(Debug, Default)]
pub(super) struct Layout {
    pub(super) children: Vec<ChildGroup>,
}

impl Layout {
    /// Append a child; returns its new group id
    pub(super) fn add(&mut self, parent: usize, key: GroupKey) -> usize {
        self.children.push(ChildGroup { parent, key });
        self.children.len()
    }
}

/// One program per dataset, interned into a layout
fn intern_per_dataset<F>(
    layout: &mut PushLayout,
    datasets: impl IntoIterator<Item = String>,
    program: F,
) -> ExecutionResult<BTreeMap<String, usize>>
where
    F: Fn(&str) -> ExecutionResult<Option<Vec<PushOp>>>,
{
    let mut out = BTreeMap::new();
    for dataset in datasets {
        if let Some(program) = program(&dataset)? {
            let global = layout.intern(QualifiedPush::new(dataset.clone(), program));
            out.insert(dataset, global);
        }
    }
    Ok(out)
}

/// Coerce a listed term to the kind of the field it is matched against
fn coerce(term: &Term, is_int: bool) -> Option<Term> {
    match (term, is_int) {
        (Term::Int(_), true) | (Term::Str(_), false) => Some(term.clone()),
        (Term::Str(s), true) => s.trim().parse::<i64>().ok().map(Term::Int),
        (Term::Int(v), false) => Some(Term::Str(v.to_string())),
    }
}

fn format_time(seconds: i64) -> String {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

fn time_label(start: i64, end: i64) -> String {
    format!("[{}, {})", format_time(start), format_time(end))
}

fn month_label(start: i64) -> String {
    Utc.timestamp_opt(start, 0)
        .single()
        .map(|t| t.format("%B %Y").to_string())
        .unwrap_or_else(|| start.to_string())
}

impl Session {
    /// Record the new layer once every dataset regrouped
    fn finish_explode(&mut self, layout: Layout) {
        self.keys.push_layer(layout.children);
    }

    /// Terms of `field` per group, filtered, either all of them in term
    /// order or the top `limit` by `metric`
    pub(super) fn terms_per_group(
        &mut self,
        field: &FieldSet,
        filter: Option<&AggregateFilter>,
        limit: Option<usize>,
        metric: Option<&AggregateMetric>,
    ) -> ExecutionResult<BTreeMap<usize, Vec<Term>>> {
        let mut layout = PushLayout::new();
        let mut compiled_filter = self.compile_filter(&mut layout, filter, EvalMode::Term)?;
        let ordering = match (limit, metric) {
            (Some(_), Some(metric)) => Some(metric.clone()),
            (Some(_), None) => Some(self.default_term_metric(field)),
            (None, _) => None,
        };
        let mut compiled_metric = match &ordering {
            Some(m) => self
                .compile_metrics(&mut layout, std::slice::from_ref(m), EvalMode::Term)?
                .pop(),
            None => None,
        };
        let sorted = filter.map_or(false, AggregateFilter::need_sorted)
            || ordering.as_ref().map_or(false, AggregateMetric::need_sorted);

        let tuples = self.iterate_field(field, &layout, sorted)?;

        let mut out: BTreeMap<usize, Vec<Term>> = BTreeMap::new();
        match (limit, compiled_metric.as_mut()) {
            (Some(limit), Some(metric)) => {
                let mut tops: BTreeMap<usize, TopK<Term>> = BTreeMap::new();
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
                    let value = metric.eval(&ctx);
                    tops.entry(t.group)
                        .or_insert_with(|| TopK::new(limit))
                        .offer(value, t.term.clone());
                }
                for (group, top) in tops {
                    out.insert(group, top.into_sorted().into_iter().map(|(_, term)| term).collect());
                }
            }
            _ => {
                let mut per_group: BTreeMap<usize, BTreeSet<Term>> = BTreeMap::new();
                let mut total = 0usize;
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
                    if total >= self.config.row_limit {
                        self.note_truncated();
                        break;
                    }
                    if per_group.entry(t.group).or_default().insert(t.term.clone()) {
                        total += 1;
                    }
                }
                for (group, terms) in per_group {
                    out.insert(group, terms.into_iter().collect());
                }
            }
        }
        Ok(out)
    }

    /// Regroup by listed terms per group; groups without terms keep only
    /// their default child, if any
    fn explode_terms(
        &mut self,
        field: &FieldSet,
        terms: &BTreeMap<usize, Vec<Term>>,
        with_default: bool,
    ) -> ExecutionResult<()> {
        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut targets: Vec<(usize, Vec<(Term, usize)>, usize)> = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let mut children = Vec::new();
            for term in terms.get(&group).into_iter().flatten() {
                children.push((term.clone(), layout.add(group, GroupKey::Term(term.clone()))));
            }
            let negative = if with_default {
                layout.add(group, GroupKey::Default)
            } else {
                0
            };
            targets.push((group, children, negative));
        }

        self.regroup_with(&PushLayout::new(), |dataset, _| {
            let Ok(physical) = field.physical(dataset) else {
                return Ok(targets
                    .iter()
                    .map(|(g, _, negative)| RegroupRule::move_all(*g, *negative))
                    .collect());
            };
            Ok(targets
                .iter()
                .map(|(group, children, negative)| RegroupRule::Conditions {
                    target: *group,
                    conditions: children
                        .iter()
                        .map(|(term, id)| {
                            (
                                Condition::Term {
                                    field: physical.to_string(),
                                    term: term.clone(),
                                },
                                *id,
                            )
                        })
                        .collect(),
                    negative: *negative,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    pub(super) fn explode_by_field(
        &mut self,
        field: &FieldSet,
        filter: Option<&AggregateFilter>,
        limit: Option<usize>,
        metric: Option<&AggregateMetric>,
        with_default: bool,
    ) -> ExecutionResult<()> {
        let terms = self.terms_per_group(field, filter, limit, metric)?;
        self.explode_terms(field, &terms, with_default)
    }

    pub(super) fn explode_field_in(&mut self, field: &FieldSet, terms: &[Term], with_default: bool) -> ExecutionResult<()> {
        let mut listed: Vec<Term> = Vec::with_capacity(terms.len());
        for term in terms {
            if let Some(term) = coerce(term, field.is_int()) {
                if !listed.contains(&term) {
                    listed.push(term);
                }
            }
        }
        let per_group = (1..=self.keys.num_groups())
            .map(|g| (g, listed.clone()))
            .collect();
        self.explode_terms(field, &per_group, with_default)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn explode_metric(
        &mut self,
        scope: &Scope,
        metric: &DocMetric,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
    ) -> ExecutionResult<()> {
        if interval <= 0 || max <= min {
            return Err(ExecutionError::malformed(format!(
                "bucket range [{}, {}) with interval {} is empty",
                min, max, interval
            )));
        }
        let count = bucket_count(min, max, interval).ok_or_else(|| {
            ExecutionError::malformed(format!(
                "bucket range [{}, {}) with interval {} has too many buckets",
                min, max, interval
            ))
        })?;

        let mut push_layout = PushLayout::new();
        let datasets = scope.iter().filter(|d| self.scope.contains(*d)).cloned();
        let stat_of = intern_per_dataset(&mut push_layout, datasets, |d| Ok(Some(metric.pushes(d)?)))?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        // (group, first bucket id, below, above, out-of-scope destination)
        let mut targets = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let mut first = 0;
            for i in 0..count {
                let lo = min + i as i64 * interval;
                let id = layout.add(group, GroupKey::label(format!("[{}, {})", lo, lo.saturating_add(interval))));
                if i == 0 {
                    first = id;
                }
            }
            let (below, above, other) = if !exclude_gutters {
                let below = layout.add(group, GroupKey::label(format!("[-inf, {})", min)));
                let above = layout.add(group, GroupKey::label(format!("[{}, inf)", max)));
                (below, above, 0)
            } else if with_default {
                let default = layout.add(group, GroupKey::Default);
                (default, default, default)
            } else {
                (0, 0, 0)
            };
            targets.push((group, first, below, above, other));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(targets
                    .iter()
                    .map(|(g, _, _, _, other)| RegroupRule::move_all(*g, *other))
                    .collect());
            };
            Ok(targets
                .iter()
                .map(|(group, first, below, above, _)| RegroupRule::Buckets {
                    target: *group,
                    stat,
                    min,
                    interval,
                    count,
                    first: *first,
                    below: *below,
                    above: *above,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    pub(super) fn explode_time(&mut self, field: &FieldSet, start: i64, end: i64, period: i64) -> ExecutionResult<()> {
        if period <= 0 || end <= start {
            return Err(ExecutionError::malformed(format!(
                "time range [{}, {}) with period {}s is empty",
                start, end, period
            )));
        }
        let count = bucket_count(start, end, period).ok_or_else(|| {
            ExecutionError::malformed(format!(
                "time range [{}, {}) with period {}s has too many buckets",
                start, end, period
            ))
        })?;
        let mut push_layout = PushLayout::new();
        let stat_of = intern_per_dataset(&mut push_layout, self.scope.clone(), |d| Ok(field_program(field, d)))?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut firsts = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let mut first = 0;
            for i in 0..count {
                let lo = start + i as i64 * period;
                let hi = lo.saturating_add(period).min(end);
                let id = layout.add(group, GroupKey::label(time_label(lo, hi)));
                if i == 0 {
                    first = id;
                }
            }
            firsts.push((group, first));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(move_every_group(num_groups, |_| 0));
            };
            Ok(firsts
                .iter()
                .map(|(group, first)| RegroupRule::Buckets {
                    target: *group,
                    stat,
                    min: start,
                    interval: period,
                    count,
                    first: *first,
                    below: 0,
                    above: 0,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    pub(super) fn explode_time_ranges(&mut self, field: &FieldSet, boundaries: &[i64]) -> ExecutionResult<()> {
        if boundaries.len() < 2 || boundaries.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ExecutionError::malformed("time ranges need increasing boundaries"));
        }
        let mut push_layout = PushLayout::new();
        let stat_of = intern_per_dataset(&mut push_layout, self.scope.clone(), |d| Ok(field_program(field, d)))?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut targets = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let ranges: Vec<(i64, i64, usize)> = boundaries
                .windows(2)
                .map(|w| (w[0], w[1] - 1, layout.add(group, GroupKey::label(month_label(w[0])))))
                .collect();
            targets.push((group, ranges));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(move_every_group(num_groups, |_| 0));
            };
            Ok(targets
                .iter()
                .map(|(group, ranges)| RegroupRule::Conditions {
                    target: *group,
                    conditions: ranges
                        .iter()
                        .map(|(min, max, id)| (Condition::StatRange { stat, min: *min, max: *max }, *id))
                        .collect(),
                    negative: 0,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    pub(super) fn explode_day_of_week(&mut self, field: &FieldSet) -> ExecutionResult<()> {
        // days since the epoch, shifted so Monday is 0 (1970-01-01 was a Thursday)
        let day_of_week = |dataset: &str| -> ExecutionResult<Option<Vec<PushOp>>> {
            Ok(field_program(field, dataset).map(|mut program| {
                program.extend([
                    PushOp::Constant(86_400),
                    PushOp::Div,
                    PushOp::Constant(3),
                    PushOp::Add,
                    PushOp::Constant(7),
                    PushOp::Mod,
                ]);
                program
            }))
        };
        let mut push_layout = PushLayout::new();
        let stat_of = intern_per_dataset(&mut push_layout, self.scope.clone(), day_of_week)?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut firsts = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let first = layout.children.len() + 1;
            for day in WEEKDAYS {
                layout.add(group, GroupKey::label(day));
            }
            firsts.push((group, first));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(move_every_group(num_groups, |_| 0));
            };
            Ok(firsts
                .iter()
                .map(|(group, first)| RegroupRule::Buckets {
                    target: *group,
                    stat,
                    min: 0,
                    interval: 1,
                    count: WEEKDAYS.len(),
                    first: *first,
                    below: 0,
                    above: 0,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    pub(super) fn explode_quantiles(&mut self, field: &FieldSet, num_buckets: usize) -> ExecutionResult<()> {
        if !field.is_int() {
            return Err(ExecutionError::malformed(format!(
                "quantiles need an int field, '{}' is a string field",
                field.name()
            )));
        }
        if num_buckets == 0 {
            return Err(ExecutionError::malformed("quantiles need at least one bucket"));
        }
        let counts = self.term_counts(field)?;

        let mut push_layout = PushLayout::new();
        let stat_of = intern_per_dataset(&mut push_layout, self.scope.clone(), |d| Ok(field_program(field, d)))?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut targets = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let Some(distribution) = counts.get(&group) else {
                targets.push((group, Vec::new()));
                continue;
            };
            let cuts = quantile_cuts(distribution, num_buckets);
            let mut ranges = Vec::with_capacity(num_buckets);
            for i in 0..num_buckets {
                let lo = if i == 0 { i64::MIN } else { cuts[i - 1].saturating_add(1) };
                let hi = if i + 1 == num_buckets { i64::MAX } else { cuts[i] };
                let label = format!(
                    "[{}, {}]",
                    if i == 0 { "-inf".to_string() } else { lo.to_string() },
                    if i + 1 == num_buckets { "inf".to_string() } else { hi.to_string() }
                );
                ranges.push((lo, hi, layout.add(group, GroupKey::label(label))));
            }
            targets.push((group, ranges));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(move_every_group(num_groups, |_| 0));
            };
            Ok(targets
                .iter()
                .map(|(group, ranges)| RegroupRule::Conditions {
                    target: *group,
                    conditions: ranges
                        .iter()
                        .map(|(min, max, id)| (Condition::StatRange { stat, min: *min, max: *max }, *id))
                        .collect(),
                    negative: 0,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }

    /// Document count of every int term per group, terms ascending
    pub(super) fn term_counts(&mut self, field: &FieldSet) -> ExecutionResult<BTreeMap<usize, Vec<(i64, i64)>>> {
        let mut layout = PushLayout::new();
        let datasets = self.scope.iter().filter(|d| field.contains(d)).cloned();
        intern_per_dataset(&mut layout, datasets, |_| Ok(Some(vec![PushOp::Count])))?;
        let tuples = self.iterate_field(field, &layout, true)?;
        let mut out: BTreeMap<usize, Vec<(i64, i64)>> = BTreeMap::new();
        for t in tuples {
            if let Some(term) = t.term.as_int() {
                let count: i64 = t.stats.iter().sum();
                out.entry(t.group).or_default().push((term, count));
            }
        }
        for terms in out.values_mut() {
            terms.sort_unstable();
        }
        Ok(out)
    }

    pub(super) fn explode_predicate(&mut self, scope: &Scope, filter: &DocFilter) -> ExecutionResult<()> {
        let mut push_layout = PushLayout::new();
        let datasets = scope.iter().filter(|d| self.scope.contains(*d)).cloned();
        let stat_of = intern_per_dataset(&mut push_layout, datasets, |d| {
            Ok(Some(filter.as_zero_one_metric(d)?.pushes(d)?))
        })?;

        let num_groups = self.keys.num_groups();
        let mut layout = Layout::default();
        let mut targets = Vec::with_capacity(num_groups);
        for group in 1..=num_groups {
            let no = layout.add(group, GroupKey::label("false"));
            let yes = layout.add(group, GroupKey::label("true"));
            targets.push((group, no, yes));
        }

        self.regroup_with(&push_layout, |dataset, pushed| {
            let Some(stat) = stat_of.get(dataset).and_then(|g| pushed.local(*g)) else {
                return Ok(targets
                    .iter()
                    .map(|(g, no, _)| RegroupRule::move_all(*g, *no))
                    .collect());
            };
            Ok(targets
                .iter()
                .map(|(group, no, yes)| RegroupRule::Conditions {
                    target: *group,
                    conditions: vec![(Condition::StatRange { stat, min: 1, max: 1 }, *yes)],
                    negative: *no,
                })
                .collect())
        })?;
        self.finish_explode(layout);
        Ok(())
    }
}

/// Number of `width`-wide buckets covering `[lo, hi)`; `None` when the span
/// does not fit an i64 or needs more than `MAX_BUCKETS`
fn bucket_count(lo: i64, hi: i64, width: i64) -> Option<usize> {
    let span = hi.checked_sub(lo)?;
    let count = span / width + i64::from(span % width != 0);
    if count > MAX_BUCKETS {
        return None;
    }
    usize::try_from(count).ok()
}

/// Largest term of each of the first `buckets - 1` quantiles
fn quantile_cuts(distribution: &[(i64, i64)], buckets: usize) -> Vec<i64> {
    let total: i64 = distribution.iter().map(|(_, c)| *c).sum();
    let mut cuts = Vec::with_capacity(buckets.saturating_sub(1));
    let mut seen = 0i64;
    let mut terms = distribution.iter().peekable();
    let mut last = distribution.first().map_or(0, |(t, _)| *t);
    for i in 1..buckets {
        let wanted = (total as f64 * i as f64 / buckets as f64).ceil() as i64;
        while seen < wanted {
            match terms.next() {
                Some((term, count)) => {
                    seen += count;
                    last = *term;
                }
                None => break,
            }
        }
        cuts.push(last);
    }
    cuts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_follows_field_kind() {
        assert_eq!(coerce(&Term::from("42"), true), Some(Term::Int(42)));
        assert_eq!(coerce(&Term::from("x"), true), None);
        assert_eq!(coerce(&Term::from(7), false), Some(Term::from("7")));
    }

    #[test]
    fn test_quantile_cuts_split_counts() {
        let distribution: Vec<(i64, i64)> = (1..=10).map(|t| (t, 1)).collect();
        assert_eq!(quantile_cuts(&distribution, 2), vec![5]);
        assert_eq!(quantile_cuts(&distribution, 4), vec![3, 5, 8]);
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        assert_eq!(bucket_count(0, 10, 3), Some(4));
        assert_eq!(bucket_count(-5, 5, 5), Some(2));
        assert_eq!(bucket_count(0, 1, 1), Some(1));
    }

    #[test]
    fn test_bucket_count_rejects_extreme_ranges() {
        assert_eq!(bucket_count(i64::MIN, i64::MAX, 1), None);
        assert_eq!(bucket_count(0, i64::MAX, i64::MAX / 2), Some(3));
        assert_eq!(bucket_count(0, MAX_BUCKETS + 1, 1), None);
    }

    #[test]
    fn test_time_labels() {
        assert_eq!(time_label(0, 3600), "[1970-01-01 00:00:00, 1970-01-01 01:00:00)");
        assert_eq!(month_label(0), "January 1970");
    }
}
