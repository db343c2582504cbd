//! Precomputed lookups
//!
//! Each computation fills one value per current group and stores it under a
//! name that later metrics read through `GroupStatsLookup`. A lookup is
//! saved at the depth it was computed at; deeper groups read the value of
//! their ancestor.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::engine::FtgsField;
use super::errors::{ExecutionError, ExecutionResult};
use super::metrics::{CompiledFilter, CompiledMetric, EvalContext, EvalMode, PushLayout};
use super::session::{group_slot, SavedLookup, Session, TermTuple};
use crate::language::{AggregateFilter, AggregateMetric, BootstrapOutput, FieldSet, Scope, Term};
use crate::observability::{log_event_with_fields, Event};
use crate::plan::Computation;

/// Per-group values of one bootstrap
#[derive(Debug, Default)]
struct BootstrapGroup {
    /// Stat vectors of the kept terms, in iteration order
    terms: Vec<Vec<i64>>,
    skipped: usize,
}

impl Session {
    pub(super) fn compute_lookup(&mut self, name: &str, computation: &Computation) -> ExecutionResult<()> {
        match computation {
            Computation::GroupStats { metric } => {
                let mut layout = PushLayout::new();
                let mut compiled = self.compile_metrics(&mut layout, std::slice::from_ref(metric), EvalMode::Group)?;
                let stats = self.group_stats(&layout)?;
                let mut values = vec![f64::NAN];
                values.extend(
                    self.eval_groups(&mut compiled, None, &stats)
                        .into_iter()
                        .map(|(_, v)| v.first().copied().unwrap_or(f64::NAN)),
                );
                self.store_lookup(name, values);
            }
            Computation::Distincts { scope, field, window } => {
                let values = self.distincts(&field.restrict(scope), *window)?;
                self.store_lookup(name, values);
            }
            Computation::Percentiles {
                scope,
                field,
                percentile,
            } => {
                let values = self.percentiles(&field.restrict(scope), *percentile)?;
                self.store_lookup(name, values);
            }
            Computation::SumAcross {
                scope,
                field,
                metric,
                filter,
            } => {
                let num_groups = self.keys.num_groups();
                let mut values = vec![0.0; num_groups + 1];
                self.for_each_term(scope, field, metric, filter.as_ref(), |t, value| {
                    *group_slot(&mut values, t.group)? += value;
                    Ok(())
                })?;
                values[0] = f64::NAN;
                self.store_lookup(name, values);
            }
            Computation::FieldExtreme {
                scope,
                field,
                metric,
                filter,
            } => {
                let num_groups = self.keys.num_groups();
                let mut best: Vec<Option<(f64, i64)>> = vec![None; num_groups + 1];
                self.for_each_term(scope, field, metric, filter.as_ref(), |t, value| {
                    let Some(term) = t.term.as_int() else {
                        return Ok(());
                    };
                    if value.is_nan() {
                        return Ok(());
                    }
                    let slot = group_slot(&mut best, t.group)?;
                    if slot.map_or(true, |(current, _)| value > current) {
                        *slot = Some((value, term));
                    }
                    Ok(())
                })?;
                let values = best
                    .into_iter()
                    .map(|b| b.map_or(f64::NAN, |(_, term)| term as f64))
                    .collect();
                self.store_lookup(name, values);
            }
            Computation::Bootstrap {
                scope,
                field,
                filter,
                metric,
                num_bootstraps,
                seed,
                outputs,
            } => self.bootstrap(name, scope, field, filter.as_ref(), metric, *num_bootstraps, seed, outputs)?,
        }
        Ok(())
    }

    fn store_lookup(&mut self, name: &str, values: Vec<f64>) {
        let depth = self.keys.depth();
        self.lookups.insert(name.to_string(), SavedLookup { depth, values });
        self.counters.precomputed_slots += 1;
        if let Some(metrics) = &self.metrics {
            metrics.increment_precomputed();
        }
        log_event_with_fields(
            Event::PrecomputedStored,
            &[("name", name), ("depth", &depth.to_string())],
        );
    }

    /// Compile `metric` and `filter` in term mode, iterate `field` over
    /// `scope` and hand every passing tuple with its metric value to `sink`
    fn for_each_term<F>(
        &mut self,
        scope: &Scope,
        field: &FieldSet,
        metric: &AggregateMetric,
        filter: Option<&AggregateFilter>,
        mut sink: F,
    ) -> ExecutionResult<()>
    where
        F: FnMut(&TermTuple, f64) -> ExecutionResult<()>,
    {
        let field = field.restrict(scope);
        let mut layout = PushLayout::new();
        let mut compiled_filter = self.compile_filter(&mut layout, filter, EvalMode::Term)?;
        let mut compiled = self.compile_one(&mut layout, metric)?;
        let sorted = metric.need_sorted() || filter.map_or(false, AggregateFilter::need_sorted);
        let tuples = self.iterate_field(&field, &layout, sorted)?;
        for t in &tuples {
            let ctx = self.term_context(t);
            if compiled_filter.eval(&ctx) {
                let value = compiled.eval(&ctx);
                sink(t, value)?;
            }
        }
        Ok(())
    }

    fn compile_one(&self, layout: &mut PushLayout, metric: &AggregateMetric) -> ExecutionResult<CompiledMetric> {
        self.compile_metrics(layout, std::slice::from_ref(metric), EvalMode::Term)?
            .pop()
            .ok_or_else(|| ExecutionError::consistency("metric compiled to nothing"))
    }

    fn term_context<'a>(&self, t: &'a TermTuple) -> EvalContext<'a> {
        EvalContext {
            group: t.group,
            parent: self.keys.parent(t.group),
            term: Some(&t.term),
            stats: &t.stats,
            is_default: false,
        }
    }

    /// Distinct terms per group; with a window, a term counts for a group
    /// when any of the last `window` siblings up to it holds the term
    fn distincts(&mut self, field: &FieldSet, window: usize) -> ExecutionResult<Vec<f64>> {
        let num_groups = self.keys.num_groups();
        let datasets = field.datasets();
        if window <= 1 && datasets.len() == 1 {
            let per_dataset = self.fan_out(|d| {
                if !datasets.contains(&d.name) {
                    return Ok(None);
                }
                let physical = field.physical(&d.name)?;
                let counts = d
                    .session
                    .get_distinct(&FtgsField::new(physical, field.is_int()), num_groups)
                    .map_err(|e| ExecutionError::engine(&d.name, e))?;
                Ok(Some(counts))
            })?;
            let counts = per_dataset.into_iter().flatten().next().unwrap_or_default();
            let mut values = vec![0.0; num_groups + 1];
            for (group, count) in counts.into_iter().enumerate().take(num_groups + 1) {
                values[group] = count as f64;
            }
            values[0] = f64::NAN;
            return Ok(values);
        }

        let tuples = self.iterate_field(field, &PushLayout::new(), window > 1)?;
        let mut values = vec![0.0; num_groups + 1];
        if window <= 1 {
            for t in &tuples {
                *group_slot(&mut values, t.group)? += 1.0;
            }
        } else {
            let mut groups_of: BTreeMap<&Term, BTreeSet<usize>> = BTreeMap::new();
            for t in &tuples {
                groups_of.entry(&t.term).or_default().insert(t.group);
            }
            for groups in groups_of.values() {
                let mut counted = BTreeSet::new();
                for &holder in groups {
                    let parent = self.keys.parent(holder);
                    for group in holder..(holder + window).min(num_groups + 1) {
                        if self.keys.parent(group) != parent {
                            break;
                        }
                        counted.insert(group);
                    }
                }
                for group in counted {
                    *group_slot(&mut values, group)? += 1.0;
                }
            }
        }
        values[0] = f64::NAN;
        Ok(values)
    }

    /// Smallest term whose cumulative document count reaches `percentile`
    /// percent of the group's documents
    fn percentiles(&mut self, field: &FieldSet, percentile: f64) -> ExecutionResult<Vec<f64>> {
        if !field.is_int() {
            return Err(ExecutionError::malformed(format!(
                "percentile needs an int field, '{}' is a string field",
                field.name()
            )));
        }
        let num_groups = self.keys.num_groups();
        let counts = self.term_counts(field)?;
        let mut values = vec![f64::NAN; num_groups + 1];
        for (group, distribution) in counts {
            *group_slot(&mut values, group)? = percentile_of(&distribution, percentile);
        }
        Ok(values)
    }

    #[allow(clippy::too_many_arguments)]
    fn bootstrap(
        &mut self,
        name: &str,
        scope: &Scope,
        field: &FieldSet,
        filter: Option<&AggregateFilter>,
        metric: &AggregateMetric,
        num_bootstraps: usize,
        seed: &str,
        outputs: &[BootstrapOutput],
    ) -> ExecutionResult<()> {
        let field = field.restrict(scope);
        let num_groups = self.keys.num_groups();
        let mut layout = PushLayout::new();
        let mut compiled_filter: CompiledFilter = self.compile_filter(&mut layout, filter, EvalMode::Term)?;
        let mut compiled = self.compile_one(&mut layout, metric)?;
        let sorted = metric.need_sorted() || filter.map_or(false, AggregateFilter::need_sorted);
        let tuples = self.iterate_field(&field, &layout, sorted)?;

        let cap = self.config.max_bootstrap_entries;
        let mut groups: HashMap<usize, BootstrapGroup> = HashMap::new();
        let mut entries = 0usize;
        for t in &tuples {
            let ctx = self.term_context(t);
            if !compiled_filter.eval(&ctx) {
                continue;
            }
            let slot = groups.entry(t.group).or_default();
            if entries >= cap {
                slot.skipped += 1;
                continue;
            }
            entries += 1;
            slot.terms.push(t.stats.clone());
        }

        let width = layout.len();
        let empty = BootstrapGroup::default();
        // samples[group] sorted ascending
        let mut samples: Vec<Vec<f64>> = vec![Vec::new(); num_groups + 1];
        let mut num_terms = vec![f64::NAN; num_groups + 1];
        let mut skipped = vec![f64::NAN; num_groups + 1];
        for group in 1..=num_groups {
            let data = groups.get(&group).unwrap_or(&empty);
            num_terms[group] = data.terms.len() as f64;
            skipped[group] = data.skipped as f64;
            let mut results = Vec::with_capacity(num_bootstraps);
            for b in 0..num_bootstraps {
                let mut rng = StdRng::from_seed(bootstrap_seed(seed, group, b));
                let mut sums = vec![0i64; width];
                for _ in 0..data.terms.len() {
                    let chosen = &data.terms[rng.gen_range(0..data.terms.len())];
                    for (sum, value) in sums.iter_mut().zip(chosen) {
                        *sum += value;
                    }
                }
                let ctx = EvalContext {
                    group,
                    parent: self.keys.parent(group),
                    term: None,
                    stats: &sums,
                    is_default: false,
                };
                results.push(compiled.eval(&ctx));
            }
            results.sort_by(|a, b| a.total_cmp(b));
            samples[group] = results;
        }

        for output in outputs {
            let slots = output.slot_names(name, num_bootstraps);
            match output {
                BootstrapOutput::All => {
                    for (b, slot) in slots.iter().enumerate() {
                        let values = per_group(num_groups, |g| samples[g].get(b).copied().unwrap_or(f64::NAN));
                        self.store_lookup(slot, values);
                    }
                }
                BootstrapOutput::Min => {
                    let values = per_group(num_groups, |g| samples[g].first().copied().unwrap_or(f64::NAN));
                    self.store_lookup(&slots[0], values);
                }
                BootstrapOutput::Max => {
                    let values = per_group(num_groups, |g| samples[g].last().copied().unwrap_or(f64::NAN));
                    self.store_lookup(&slots[0], values);
                }
                BootstrapOutput::Mean => {
                    let values = per_group(num_groups, |g| mean_and_variance(&samples[g]).0);
                    self.store_lookup(&slots[0], values);
                }
                BootstrapOutput::Variance => {
                    let values = per_group(num_groups, |g| mean_and_variance(&samples[g]).1);
                    self.store_lookup(&slots[0], values);
                }
                BootstrapOutput::NumTerms => self.store_lookup(&slots[0], num_terms.clone()),
                BootstrapOutput::SkippedTerms => self.store_lookup(&slots[0], skipped.clone()),
            }
        }
        Ok(())
    }
}

fn per_group(num_groups: usize, value: impl Fn(usize) -> f64) -> Vec<f64> {
    let mut values = vec![f64::NAN; num_groups + 1];
    for (group, slot) in values.iter_mut().enumerate().skip(1) {
        *slot = value(group);
    }
    values
}

/// RNG seed of one bootstrap sample of one group
fn bootstrap_seed(seed: &str, group: usize, sample: usize) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update((group as u64).to_le_bytes());
    hasher.update((sample as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Population mean and variance; NaN for no samples
fn mean_and_variance(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
    (mean, variance)
}

/// `distribution` holds (term, count) pairs with terms ascending
fn percentile_of(distribution: &[(i64, i64)], percentile: f64) -> f64 {
    let total: i64 = distribution.iter().map(|(_, c)| *c).sum();
    if total == 0 {
        return f64::NAN;
    }
    let wanted = (total as f64 * percentile / 100.0).ceil().max(1.0) as i64;
    let mut seen = 0;
    for (term, count) in distribution {
        seen += count;
        if seen >= wanted {
            return *term as f64;
        }
    }
    distribution.last().map_or(f64::NAN, |(t, _)| *t as f64)
}
