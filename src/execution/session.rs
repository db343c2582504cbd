//! Query session: executes commands against one engine session per dataset
//!
//! Group ids are global: every dataset session numbers its groups the same
//! way, so every step that changes grouping fans out to all datasets and
//! joins before the next command starts.
//!
//! # Invariants
//!
//! - Every command leaves each dataset's stat stack at the size it found it
//! - `keys.depth()` is the number of explodes currently applied
//! - A saved lookup is tagged with the depth it was computed at and is read
//!   through `GroupKeySet::ancestor`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;
use rayon::ThreadPool;
use uuid::Uuid;

use super::engine::{Condition, DatasetSession, Engine, FtgsField, RegroupRule};
use super::errors::{ExecutionError, ExecutionResult};
use super::group_keys::{GroupKey, GroupKeySet};
use super::metrics::{columns, CompiledFilter, CompiledMetric, EvalContext, EvalMode, MetricCompiler, PushLayout};
use super::result::{ExecutionCounters, QueryResult, Row, SampledTerms};
use crate::actions::Action;
use crate::config::EngineConfig;
use crate::language::{
    AggregateFilter, AggregateMetric, Dataset, DocFilter, FieldSet, PushOp, QualifiedPush, Scope, Term,
};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, ObservationScope};
use crate::plan::{decode_commands, Command, MergeType};

/// Engine session of one dataset, known by its display name
pub(super) struct DatasetHandle {
    pub(super) name: String,
    pub(super) session: Box<dyn DatasetSession>,
}

/// Stats one dataset pushed for a command. Local stat `base + k` holds the
/// push at global position `globals[k]`.
#[derive(Debug, Clone)]
pub(super) struct PushedStats {
    pub(super) base: usize,
    pub(super) globals: Vec<usize>,
}

impl PushedStats {
    /// Local stat index of a global push
    pub(super) fn local(&self, global: usize) -> Option<usize> {
        self.globals.iter().position(|g| *g == global).map(|k| self.base + k)
    }

    /// Copy this dataset's stats into a merged vector
    pub(super) fn scatter(&self, local: &[i64], merged: &mut [i64]) {
        for (k, g) in self.globals.iter().enumerate() {
            if let Some(slot) = merged.get_mut(*g) {
                *slot += local.get(self.base + k).copied().unwrap_or(0);
            }
        }
    }
}

impl DatasetHandle {
    fn push_layout(&mut self, layout: &PushLayout) -> ExecutionResult<PushedStats> {
        let base = self.session.num_stats();
        let mut globals = Vec::new();
        for (global, program) in layout.for_dataset(&self.name) {
            if let Err(err) = self.session.push_stat(program) {
                for _ in 0..globals.len() {
                    if let Err(pop_err) = self.session.pop_stat() {
                        log_event_with_fields(
                            Event::StatReleaseFailed,
                            &[("dataset", &self.name), ("error", &pop_err.to_string())],
                        );
                    }
                }
                return Err(ExecutionError::engine(&self.name, err));
            }
            globals.push(global);
        }
        Ok(PushedStats { base, globals })
    }

    fn pop(&mut self, pushed: &PushedStats) -> ExecutionResult<()> {
        for _ in 0..pushed.globals.len() {
            self.session
                .pop_stat()
                .map_err(|e| ExecutionError::engine(&self.name, e))?;
        }
        let now = self.session.num_stats();
        if now != pushed.base {
            return Err(ExecutionError::consistency(format!(
                "dataset '{}' holds {} stats after a command, expected {}",
                self.name, now, pushed.base
            )));
        }
        Ok(())
    }
}

/// A precomputed per-group value
#[derive(Debug, Clone, PartialEq)]
pub(super) struct SavedLookup {
    /// `keys.depth()` when the values were computed
    pub(super) depth: usize,
    /// indexed by group id at `depth`
    pub(super) values: Vec<f64>,
}

/// One merged (term, group) of a term iteration
#[derive(Debug, Clone, PartialEq)]
pub(super) struct TermTuple {
    pub(super) term: Term,
    pub(super) group: usize,
    pub(super) stats: Vec<i64>,
}

/// Slot of `group` in a per-group vector. Group ids come from the engine,
/// so a miss is a consistency fault rather than a panic.
pub(super) fn group_slot<T>(values: &mut [T], group: usize) -> ExecutionResult<&mut T> {
    let len = values.len();
    values
        .get_mut(group)
        .ok_or_else(|| ExecutionError::consistency(format!("group {} out of range {}", group, len)))
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> ExecutionResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ExecutionError::consistency("a dataset worker panicked during a merge"))
}

/// Executes commands over the datasets of one query
pub struct Session {
    pub(super) id: Uuid,
    pub(super) config: EngineConfig,
    pub(super) datasets: Vec<DatasetHandle>,
    pub(super) scope: Scope,
    pub(super) keys: GroupKeySet,
    pub(super) lookups: HashMap<String, SavedLookup>,
    pub(super) pool: ThreadPool,
    pub(super) counters: ExecutionCounters,
    pub(super) metrics: Option<Arc<MetricsRegistry>>,
    pub(super) rows: Vec<Row>,
    pub(super) truncated: bool,
    pub(super) sampled: Vec<SampledTerms>,
    closed: bool,
}

impl Session {
    /// Open one engine session per dataset. Every document in a dataset's
    /// time range starts in group 1.
    pub fn open(engine: &dyn Engine, datasets: &[Dataset], config: EngineConfig) -> ExecutionResult<Session> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .build()
            .map_err(|e| ExecutionError::Engine {
                dataset: "*".to_string(),
                message: format!("cannot start worker pool: {}", e),
            })?;

        let mut ordered: Vec<&Dataset> = datasets.iter().collect();
        ordered.sort_by(|a, b| a.display_name().cmp(b.display_name()));

        let mut handles: Vec<DatasetHandle> = Vec::with_capacity(ordered.len());
        for dataset in ordered {
            let name = dataset.display_name().to_string();
            if handles.iter().any(|h| h.name == name) {
                close_all(&mut handles);
                return Err(ExecutionError::malformed(format!("dataset '{}' listed twice", name)));
            }
            match engine.open(&dataset.name, dataset.start, dataset.end) {
                Ok(session) => handles.push(DatasetHandle { name, session }),
                Err(err) => {
                    close_all(&mut handles);
                    return Err(ExecutionError::engine(&name, err));
                }
            }
        }

        let id = Uuid::new_v4();
        let scope: Scope = handles.iter().map(|h| h.name.clone()).collect();
        log_event_with_fields(
            Event::SessionOpened,
            &[
                ("session_id", &id.to_string()),
                ("datasets", &handles.len().to_string()),
            ],
        );
        Ok(Session {
            id,
            config,
            datasets: handles,
            scope,
            keys: GroupKeySet::new(),
            lookups: HashMap::new(),
            pool,
            counters: ExecutionCounters::default(),
            metrics: None,
            rows: Vec::new(),
            truncated: false,
            sampled: Vec::new(),
            closed: false,
        })
    }

    /// Report work into a shared registry as well as the session counters
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display names of the session's datasets
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn group_keys(&self) -> &GroupKeySet {
        &self.keys
    }

    pub fn num_groups(&self) -> usize {
        self.keys.num_groups()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release every dataset handle. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        close_all(&mut self.datasets);
        log_event_with_fields(
            Event::SessionClosed,
            &[
                ("session_id", &self.id.to_string()),
                ("commands", &self.counters.commands.to_string()),
            ],
        );
    }

    /// Run `commands` in order and hand back everything they produced. Any
    /// error closes the session.
    pub fn execute(&mut self, commands: &[Command]) -> ExecutionResult<QueryResult> {
        if self.closed {
            return Err(ExecutionError::consistency("session is closed"));
        }
        let session_id = self.id.to_string();
        let scope = ObservationScope::with_fields("EXECUTE", &[("session_id", &session_id)]);
        for command in commands {
            if let Err(err) = self.run_command(command) {
                log_event_with_fields(
                    Event::ExecutionFailed,
                    &[
                        ("session_id", &session_id),
                        ("command", command.kind()),
                        ("code", err.code()),
                        ("error", &err.to_string()),
                    ],
                );
                scope.fail(err.code());
                self.close();
                return Err(err);
            }
        }
        let result = QueryResult {
            rows: std::mem::take(&mut self.rows),
            truncated: std::mem::replace(&mut self.truncated, false),
            sampled: std::mem::take(&mut self.sampled),
            counters: self.counters.clone(),
        };
        scope.complete_with_fields(&[("rows", &result.rows.len().to_string())]);
        Ok(result)
    }

    /// Decode a wire-encoded command list and run it. A payload that does
    /// not decode closes the session like any other command failure.
    pub fn execute_encoded(&mut self, encoded: &str) -> ExecutionResult<QueryResult> {
        match decode_commands(encoded) {
            Ok(commands) => self.execute(&commands),
            Err(err) => {
                let err = ExecutionError::from(err);
                self.close();
                Err(err)
            }
        }
    }

    fn run_command(&mut self, command: &Command) -> ExecutionResult<()> {
        log_event_with_fields(
            Event::CommandBegin,
            &[("command", command.kind()), ("depth", &self.keys.depth().to_string())],
        );
        match command {
            Command::FilterDocs { per_dataset } => self.filter_docs(per_dataset)?,
            Command::ApplyActions { actions } => self.apply_actions(actions)?,
            Command::ExplodeByField {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => self.explode_by_field(field, filter.as_ref(), *limit, metric.as_ref(), *with_default)?,
            Command::ExplodeFieldIn {
                field,
                terms,
                with_default,
            } => self.explode_field_in(field, terms, *with_default)?,
            Command::ExplodeMetric {
                scope,
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => self.explode_metric(scope, metric, *min, *max, *interval, *exclude_gutters, *with_default)?,
            Command::ExplodeTime {
                field,
                start,
                end,
                period_seconds,
            } => self.explode_time(field, *start, *end, *period_seconds)?,
            Command::ExplodeTimeRanges { field, boundaries } => self.explode_time_ranges(field, boundaries)?,
            Command::ExplodeDayOfWeek { field } => self.explode_day_of_week(field)?,
            Command::ExplodeQuantiles { field, num_buckets } => self.explode_quantiles(field, *num_buckets)?,
            Command::ExplodePredicate { scope, filter } => self.explode_predicate(scope, filter)?,
            Command::ComputeAndCreateGroupStatsLookup { name, computation } => {
                self.compute_lookup(name, computation)?
            }
            Command::RegroupIntoParent { merge } => self.regroup_into_parent(*merge)?,
            Command::ApplyGroupFilter { filter } => self.apply_group_filter(filter)?,
            Command::GetGroupStats { metrics } => self.get_group_stats(metrics)?,
            Command::SimpleIterate {
                field,
                filter,
                limit,
                metric,
                selects,
            } => self.simple_iterate(field, filter.as_ref(), *limit, metric.as_ref(), selects)?,
            Command::SampleFields { fields } => self.sample_fields(fields)?,
        }
        self.counters.commands += 1;
        if let Some(metrics) = &self.metrics {
            metrics.increment_commands();
        }
        log_event_with_fields(
            Event::CommandComplete,
            &[
                ("command", command.kind()),
                ("groups", &self.keys.num_groups().to_string()),
            ],
        );
        Ok(())
    }

    // ==================
    // Fan-out
    // ==================

    /// Run `f` on every dataset in parallel; returns once all finished
    pub(super) fn fan_out<T, F>(&mut self, f: F) -> ExecutionResult<Vec<T>>
    where
        T: Send,
        F: Fn(&mut DatasetHandle) -> ExecutionResult<T> + Sync,
    {
        let pool = &self.pool;
        let datasets = &mut self.datasets;
        pool.install(|| datasets.par_iter_mut().map(|d| f(d)).collect())
    }

    /// Push the stats of `layout` on every dataset, run `body`, pop them
    pub(super) fn with_stats<T, F>(&mut self, layout: &PushLayout, body: F) -> ExecutionResult<Vec<T>>
    where
        T: Send,
        F: Fn(&mut DatasetHandle, &PushedStats) -> ExecutionResult<T> + Sync,
    {
        let out = self.fan_out(|d| {
            let pushed = d.push_layout(layout)?;
            let out = body(d, &pushed);
            let popped = d.pop(&pushed);
            let out = out?;
            popped?;
            Ok(out)
        })?;
        let pushed = layout.len() as u64;
        self.counters.stats_pushed += pushed;
        if let Some(metrics) = &self.metrics {
            metrics.add_stats_pushed(pushed);
        }
        Ok(out)
    }

    /// Push `layout`, compute per-dataset rules and regroup every dataset
    pub(super) fn regroup_with<F>(&mut self, layout: &PushLayout, rules: F) -> ExecutionResult<()>
    where
        F: Fn(&str, &PushedStats) -> ExecutionResult<Vec<RegroupRule>> + Sync,
    {
        self.with_stats(layout, |d, pushed| {
            let rules = rules(&d.name, pushed)?;
            if !rules.is_empty() {
                d.session
                    .regroup(&rules)
                    .map_err(|e| ExecutionError::engine(&d.name, e))?;
            }
            Ok(())
        })?;
        self.note_regroup();
        Ok(())
    }

    /// Move every group `g` to `mapping[g]` on every dataset
    pub(super) fn remap(&mut self, mapping: &[usize]) -> ExecutionResult<()> {
        self.fan_out(|d| {
            d.session
                .remap_groups(mapping)
                .map_err(|e| ExecutionError::engine(&d.name, e))
        })?;
        self.note_regroup();
        Ok(())
    }

    fn note_regroup(&mut self) {
        self.counters.regroups += 1;
        if let Some(metrics) = &self.metrics {
            metrics.increment_regroups();
        }
        log_event_with_fields(
            Event::RegroupComplete,
            &[
                ("depth", &self.keys.depth().to_string()),
                ("groups", &self.keys.num_groups().to_string()),
            ],
        );
    }

    /// Per-group merged stat vectors, indexed by group id
    pub(super) fn group_stats(&mut self, layout: &PushLayout) -> ExecutionResult<Vec<Vec<i64>>> {
        let num_groups = self.keys.num_groups();
        let merged = Mutex::new(vec![vec![0i64; layout.len()]; num_groups + 1]);
        self.with_stats(layout, |d, pushed| {
            let mut columns = Vec::with_capacity(pushed.globals.len());
            for (k, global) in pushed.globals.iter().enumerate() {
                let values = d
                    .session
                    .get_group_stats(pushed.base + k, num_groups)
                    .map_err(|e| ExecutionError::engine(&d.name, e))?;
                columns.push((*global, values));
            }
            let mut merged = lock(&merged)?;
            for (global, values) in columns {
                for (group, value) in values.into_iter().enumerate().take(num_groups + 1) {
                    merged[group][global] += value;
                }
            }
            Ok(())
        })?;
        merged
            .into_inner()
            .map_err(|_| ExecutionError::consistency("a dataset worker panicked during a merge"))
    }

    /// Iterate `field` over every dataset that has it, merging the stats of
    /// equal (term, group) pairs. Sorted iteration yields terms ascending,
    /// then groups ascending; otherwise pairs come in first-seen order.
    pub(super) fn iterate_field(
        &mut self,
        field: &FieldSet,
        layout: &PushLayout,
        sorted: bool,
    ) -> ExecutionResult<Vec<TermTuple>> {
        let width = layout.len();
        let num_groups = self.keys.num_groups();
        let sorted = sorted || self.config.force_sorted_iteration;
        let merged: Mutex<BTreeMap<(Term, usize), Vec<i64>>> = Mutex::new(BTreeMap::new());
        let per_dataset = self.with_stats(layout, |d, pushed| {
            let Ok(physical) = field.physical(&d.name) else {
                return Ok((0u64, Vec::new()));
            };
            let fields = [FtgsField::new(physical, field.is_int())];
            let mut seen = 0u64;
            let mut out = Vec::new();
            let iter = d
                .session
                .ftgs_iterator(&fields, sorted)
                .map_err(|e| ExecutionError::engine(&d.name, e))?;
            for tuple in iter {
                let tuple = tuple.map_err(|e| ExecutionError::engine(&d.name, e))?;
                if tuple.group == 0 || tuple.group > num_groups {
                    return Err(ExecutionError::consistency(format!(
                        "dataset '{}' iterated group {} out of range 1..={}",
                        d.name, tuple.group, num_groups
                    )));
                }
                seen += 1;
                let mut stats = vec![0; width];
                pushed.scatter(&tuple.stats, &mut stats);
                out.push(TermTuple {
                    term: tuple.term,
                    group: tuple.group,
                    stats,
                });
            }
            if sorted {
                let mut merged = lock(&merged)?;
                for t in out.drain(..) {
                    add_into(merged.entry((t.term, t.group)).or_insert_with(|| vec![0; width]), &t.stats);
                }
            }
            Ok((seen, out))
        })?;

        let seen: u64 = per_dataset.iter().map(|(n, _)| *n).sum();
        self.counters.ftgs_tuples += seen;
        if let Some(metrics) = &self.metrics {
            metrics.add_ftgs_tuples(seen);
        }

        if sorted {
            let merged = merged
                .into_inner()
                .map_err(|_| ExecutionError::consistency("a dataset worker panicked during a merge"))?;
            return Ok(merged
                .into_iter()
                .map(|((term, group), stats)| TermTuple { term, group, stats })
                .collect());
        }
        let mut index: HashMap<(Term, usize), usize> = HashMap::new();
        let mut out: Vec<TermTuple> = Vec::new();
        for (_, tuples) in per_dataset {
            for t in tuples {
                match index.get(&(t.term.clone(), t.group)) {
                    Some(&i) => add_into(&mut out[i].stats, &t.stats),
                    None => {
                        index.insert((t.term.clone(), t.group), out.len());
                        out.push(t);
                    }
                }
            }
        }
        Ok(out)
    }

    // ==================
    // Metrics
    // ==================

    /// Values of a saved lookup for every current group
    pub(super) fn resolve_lookup(&self, name: &str) -> ExecutionResult<Vec<f64>> {
        let saved = self
            .lookups
            .get(name)
            .ok_or_else(|| ExecutionError::malformed(format!("unknown lookup '{}'", name)))?;
        let num_groups = self.keys.num_groups();
        let mut out = vec![f64::NAN; num_groups + 1];
        for (group, slot) in out.iter_mut().enumerate().skip(1) {
            let ancestor = self.keys.ancestor(group, saved.depth)?;
            *slot = saved.values.get(ancestor).copied().unwrap_or(f64::NAN);
        }
        Ok(out)
    }

    pub(super) fn compile_metrics(
        &self,
        layout: &mut PushLayout,
        metrics: &[AggregateMetric],
        mode: EvalMode,
    ) -> ExecutionResult<Vec<CompiledMetric>> {
        let lookups = |name: &str| self.resolve_lookup(name);
        let mut compiler = MetricCompiler::new(layout, &self.scope, &lookups, mode);
        metrics.iter().map(|m| compiler.metric(m)).collect()
    }

    pub(super) fn compile_filter(
        &self,
        layout: &mut PushLayout,
        filter: Option<&AggregateFilter>,
        mode: EvalMode,
    ) -> ExecutionResult<CompiledFilter> {
        let Some(filter) = filter else {
            return Ok(CompiledFilter::Always);
        };
        let lookups = |name: &str| self.resolve_lookup(name);
        MetricCompiler::new(layout, &self.scope, &lookups, mode).filter(filter)
    }

    /// Label of `group` as seen by term predicates in group mode
    fn group_term(&self, group: usize) -> Option<Term> {
        match self.keys.key(group)? {
            GroupKey::Term(term) => Some(term.clone()),
            GroupKey::Label(label) => Some(Term::Str(label.clone())),
            GroupKey::Default => None,
        }
    }

    /// Evaluate `metrics` once per group in id order
    pub(super) fn eval_groups(
        &self,
        metrics: &mut [CompiledMetric],
        filter: Option<&mut CompiledFilter>,
        stats: &[Vec<i64>],
    ) -> Vec<(bool, Vec<f64>)> {
        let mut filter = filter;
        let empty = Vec::new();
        (1..=self.keys.num_groups())
            .map(|group| {
                let term = self.group_term(group);
                let ctx = EvalContext {
                    group,
                    parent: self.keys.parent(group),
                    term: term.as_ref(),
                    stats: stats.get(group).unwrap_or(&empty),
                    is_default: self.keys.is_default(group),
                };
                let keep = filter.as_mut().map_or(true, |f| f.eval(&ctx));
                let values = metrics.iter_mut().map(|m| m.eval(&ctx)).collect();
                (keep, values)
            })
            .collect()
    }

    /// Sum of document counts over the datasets `field` exists in
    pub(super) fn default_term_metric(&self, field: &FieldSet) -> AggregateMetric {
        AggregateMetric::add(
            self.scope
                .iter()
                .filter(|d| field.contains(d))
                .map(|d| AggregateMetric::DocStatsPushes {
                    dataset: d.clone(),
                    metric: crate::language::DocMetric::Count,
                })
                .collect(),
        )
    }

    pub(super) fn note_truncated(&mut self) {
        if !self.truncated {
            self.truncated = true;
            if let Some(metrics) = &self.metrics {
                metrics.increment_truncations();
            }
            log_event_with_fields(
                Event::RowLimitReached,
                &[("row_limit", &self.config.row_limit.to_string())],
            );
        }
    }

    // ==================
    // Document filters
    // ==================

    fn filter_docs(&mut self, per_dataset: &BTreeMap<String, DocFilter>) -> ExecutionResult<()> {
        let mut layout = PushLayout::new();
        let mut stat_of = BTreeMap::new();
        for (dataset, filter) in per_dataset {
            if !self.scope.contains(dataset) {
                return Err(ExecutionError::malformed(format!(
                    "filter names dataset '{}' which is not part of the session",
                    dataset
                )));
            }
            let program = filter.as_zero_one_metric(dataset)?.pushes(dataset)?;
            stat_of.insert(dataset.clone(), layout.intern(QualifiedPush::new(dataset.clone(), program)));
        }
        self.with_stats(&layout, |d, pushed| {
            let Some(stat) = stat_of.get(&d.name).and_then(|g| pushed.local(*g)) else {
                return Ok(());
            };
            d.session
                .metric_filter(stat, 1, 1, false)
                .map_err(|e| ExecutionError::engine(&d.name, e))
        })?;
        Ok(())
    }

    fn apply_actions(&mut self, actions: &[Action]) -> ExecutionResult<()> {
        for action in actions {
            let mut layout = PushLayout::new();
            let mut stat_of = BTreeMap::new();
            if let Action::Metric { scope, filter, .. } = action {
                for dataset in scope.iter().filter(|d| self.scope.contains(*d)) {
                    let program = filter.as_zero_one_metric(dataset)?.pushes(dataset)?;
                    stat_of.insert(dataset.clone(), layout.intern(QualifiedPush::new(dataset.clone(), program)));
                }
            }
            self.regroup_with(&layout, |dataset, pushed| {
                let stat = stat_of.get(dataset).and_then(|g| pushed.local(*g));
                Ok(action_rule(action, dataset, stat)?.into_iter().collect())
            })?;
        }
        // scratch groups are empty once the last action ran
        let live: Vec<usize> = (0..=self.keys.num_groups()).collect();
        self.remap(&live)
    }

    // ==================
    // Grouping levels
    // ==================

    fn regroup_into_parent(&mut self, merge: MergeType) -> ExecutionResult<()> {
        let depth = self.keys.depth();
        if depth == 0 {
            return Err(ExecutionError::consistency("regroup into parent at depth 0"));
        }
        let at_depth: Vec<String> = {
            let mut names: Vec<String> = self
                .lookups
                .iter()
                .filter(|(_, l)| l.depth == depth)
                .map(|(n, _)| n.clone())
                .collect();
            names.sort();
            names
        };
        if merge == MergeType::FailIfPresent && !at_depth.is_empty() {
            return Err(ExecutionError::consistency(format!(
                "values {:?} cannot be merged into their parents",
                at_depth
            )));
        }

        let mapping = self.keys.pop_layer()?;
        let num_parents = self.keys.num_groups();
        for name in at_depth {
            if let Some(saved) = self.lookups.get_mut(&name) {
                saved.values = merge_into_parents(&name, &saved.values, &mapping, num_parents, merge)?;
                saved.depth = depth - 1;
            }
        }
        self.remap(&mapping)
    }

    fn apply_group_filter(&mut self, filter: &AggregateFilter) -> ExecutionResult<()> {
        let mut layout = PushLayout::new();
        let mut compiled = self.compile_filter(&mut layout, Some(filter), EvalMode::Group)?;
        let stats = self.group_stats(&layout)?;
        let mut keep = vec![false];
        keep.extend(
            self.eval_groups(&mut [], Some(&mut compiled), &stats)
                .into_iter()
                .map(|(k, _)| k),
        );

        let depth = self.keys.depth();
        let before = self.keys.num_groups();
        let mapping = self.keys.retain(&keep);
        let after = self.keys.num_groups();
        for saved in self.lookups.values_mut().filter(|l| l.depth == depth) {
            let mut values = vec![f64::NAN; after + 1];
            for (old, new) in mapping.iter().enumerate() {
                if *new != 0 {
                    values[*new] = saved.values.get(old).copied().unwrap_or(f64::NAN);
                }
            }
            saved.values = values;
        }
        self.remap(&mapping)?;
        log_event_with_fields(
            Event::GroupsFiltered,
            &[("before", &before.to_string()), ("after", &after.to_string())],
        );
        Ok(())
    }

    // ==================
    // Output
    // ==================

    fn get_group_stats(&mut self, selects: &[AggregateMetric]) -> ExecutionResult<()> {
        let columns = columns(selects);
        let mut layout = PushLayout::new();
        let mut compiled = self.compile_metrics(&mut layout, &columns, EvalMode::Group)?;
        let stats = self.group_stats(&layout)?;
        let rows: Vec<Row> = self
            .eval_groups(&mut compiled, None, &stats)
            .into_iter()
            .enumerate()
            .map(|(i, (_, values))| Row::new(self.keys.key_path(i + 1), values))
            .collect();
        if let Some(metrics) = &self.metrics {
            metrics.add_rows(rows.len() as u64);
        }
        self.rows.extend(rows);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_all(handles: &mut [DatasetHandle]) {
    for handle in handles {
        handle.session.close();
    }
}

fn add_into(total: &mut [i64], stats: &[i64]) {
    for (t, s) in total.iter_mut().zip(stats) {
        *t += s;
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Fold child values into parent slots
fn merge_into_parents(
    name: &str,
    values: &[f64],
    mapping: &[usize],
    num_parents: usize,
    merge: MergeType,
) -> ExecutionResult<Vec<f64>> {
    match merge {
        MergeType::SumAll => {
            let mut out = vec![0.0; num_parents + 1];
            for (child, parent) in mapping.iter().enumerate().skip(1) {
                if let (Some(slot), Some(v)) = (out.get_mut(*parent), values.get(child)) {
                    *slot += v;
                }
            }
            Ok(out)
        }
        MergeType::TakeTheOneUniqueValue => {
            let mut out: Vec<Option<f64>> = vec![None; num_parents + 1];
            for (child, parent) in mapping.iter().enumerate().skip(1) {
                let Some(v) = values.get(child).copied() else { continue };
                match out.get_mut(*parent) {
                    Some(slot @ None) => *slot = Some(v),
                    Some(Some(existing)) if !same_value(*existing, v) => {
                        return Err(ExecutionError::consistency(format!(
                            "children of group {} disagree on '{}': {} vs {}",
                            parent, name, existing, v
                        )))
                    }
                    _ => {}
                }
            }
            Ok(out.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        }
        MergeType::FailIfPresent => Err(ExecutionError::consistency(format!(
            "'{}' cannot be merged into its parents",
            name
        ))),
    }
}

/// Regroup rule implementing `action` on one dataset, or none when the
/// dataset is outside the action's scope
fn action_rule(action: &Action, dataset: &str, stat: Option<usize>) -> ExecutionResult<Option<RegroupRule>> {
    let conditional = |routing: &crate::actions::Routing, condition: Condition| RegroupRule::Conditions {
        target: routing.target,
        conditions: vec![(condition, routing.positive)],
        negative: routing.negative,
    };
    let in_scope = action.scope().contains(dataset);
    if !in_scope {
        return Ok(None);
    }
    Ok(Some(match action {
        Action::Query { per_dataset, routing } => match per_dataset.get(dataset) {
            Some(query) => conditional(routing, Condition::Query(query.clone())),
            None => return Ok(None),
        },
        Action::Metric { routing, .. } => {
            let stat = stat.ok_or_else(|| {
                ExecutionError::consistency(format!("filter stat for '{}' was not pushed", dataset))
            })?;
            conditional(routing, Condition::StatRange { stat, min: 1, max: 1 })
        }
        Action::Regex {
            field, regex, routing, ..
        } => match field.physical(dataset) {
            Ok(physical) => conditional(
                routing,
                Condition::Regex {
                    field: physical.to_string(),
                    regex: regex.clone(),
                },
            ),
            Err(_) => RegroupRule::move_all(routing.target, routing.negative),
        },
        Action::IntOr {
            field, terms, routing, ..
        } => match field.physical(dataset) {
            Ok(physical) => conditional(
                routing,
                Condition::IntIn {
                    field: physical.to_string(),
                    terms: terms.clone(),
                },
            ),
            Err(_) => RegroupRule::move_all(routing.target, routing.negative),
        },
        Action::StringOr {
            field, terms, routing, ..
        } => match field.physical(dataset) {
            Ok(physical) => conditional(
                routing,
                Condition::StringIn {
                    field: physical.to_string(),
                    terms: terms.clone(),
                },
            ),
            Err(_) => RegroupRule::move_all(routing.target, routing.negative),
        },
        Action::Sample {
            field,
            probability,
            seed,
            routing,
            ..
        } => match field.physical(dataset) {
            Ok(physical) => conditional(
                routing,
                Condition::Random {
                    field: physical.to_string(),
                    probability: *probability,
                    seed: seed.clone(),
                },
            ),
            Err(_) => RegroupRule::move_all(routing.target, routing.negative),
        },
        Action::Unconditional {
            target, destination, ..
        } => RegroupRule::move_all(*target, *destination),
    }))
}

/// Rules sending every group of `num_groups` to `destination`
pub(super) fn move_every_group(num_groups: usize, destination: impl Fn(usize) -> usize) -> Vec<RegroupRule> {
    (1..=num_groups)
        .map(|g| RegroupRule::move_all(g, destination(g)))
        .collect()
}

/// A push program reading one field
pub(super) fn field_program(field: &FieldSet, dataset: &str) -> Option<Vec<PushOp>> {
    field
        .physical(dataset)
        .ok()
        .map(|physical| vec![PushOp::Field(physical.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_all_folds_children() {
        let merged = merge_into_parents("v", &[0.0, 1.0, 2.0, 4.0], &[0, 1, 1, 2], 2, MergeType::SumAll).unwrap();
        assert_eq!(merged, vec![0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unique_value_requires_agreement() {
        let agreed =
            merge_into_parents("v", &[0.0, 5.0, 5.0], &[0, 1, 1], 1, MergeType::TakeTheOneUniqueValue).unwrap();
        assert!(agreed[0].is_nan());
        assert_eq!(agreed[1], 5.0);
        let err = merge_into_parents("v", &[0.0, 5.0, 6.0], &[0, 1, 1], 1, MergeType::TakeTheOneUniqueValue)
            .unwrap_err();
        assert_eq!(err.code(), "AGG_EXEC_CONSISTENCY");
    }

    #[test]
    fn test_pushed_stats_map_local_indices() {
        let pushed = PushedStats {
            base: 2,
            globals: vec![4, 1],
        };
        assert_eq!(pushed.local(1), Some(3));
        assert_eq!(pushed.local(0), None);
        let mut merged = vec![0; 5];
        pushed.scatter(&[9, 9, 10, 20], &mut merged);
        assert_eq!(merged, vec![0, 20, 0, 0, 10]);
    }

    use chrono::{DateTime, TimeZone, Utc};

    use crate::execution::{EngineResult, FtgsIterator};
    use crate::language::{scope_of, DocMetric};
    use crate::memory::{Document, MemoryEngine};
    use crate::plan::Computation;

    /// Reports every iterated term in a group that was never created
    struct StrayGroups(Box<dyn DatasetSession>);

    impl DatasetSession for StrayGroups {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn push_stat(&mut self, program: &[PushOp]) -> EngineResult<usize> {
            self.0.push_stat(program)
        }
        fn pop_stat(&mut self) -> EngineResult<()> {
            self.0.pop_stat()
        }
        fn num_stats(&self) -> usize {
            self.0.num_stats()
        }
        fn regroup(&mut self, rules: &[RegroupRule]) -> EngineResult<usize> {
            self.0.regroup(rules)
        }
        fn remap_groups(&mut self, mapping: &[usize]) -> EngineResult<usize> {
            self.0.remap_groups(mapping)
        }
        fn metric_filter(&mut self, stat: usize, min: i64, max: i64, negate: bool) -> EngineResult<()> {
            self.0.metric_filter(stat, min, max, negate)
        }
        fn get_group_stats(&mut self, stat: usize, num_groups: usize) -> EngineResult<Vec<i64>> {
            self.0.get_group_stats(stat, num_groups)
        }
        fn ftgs_iterator(&mut self, fields: &[FtgsField], sorted: bool) -> EngineResult<FtgsIterator<'_>> {
            let inner = self.0.ftgs_iterator(fields, sorted)?;
            Ok(Box::new(inner.map(|tuple| {
                tuple.map(|mut t| {
                    t.group += 6;
                    t
                })
            })))
        }
        fn get_distinct(&mut self, field: &FtgsField, num_groups: usize) -> EngineResult<Vec<i64>> {
            self.0.get_distinct(field, num_groups)
        }
        fn close(&mut self) {
            self.0.close()
        }
    }

    struct StrayEngine(MemoryEngine);

    impl Engine for StrayEngine {
        fn open(
            &self,
            dataset: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> EngineResult<Box<dyn DatasetSession>> {
            Ok(Box::new(StrayGroups(self.0.open(dataset, start, end)?)))
        }
    }

    fn jobs() -> MemoryEngine {
        let documents = (0..4)
            .map(|i| {
                Document::at(100 + i)
                    .string("query", if i % 2 == 0 { "rn" } else { "dev" })
                    .int("oji", i)
            })
            .collect();
        MemoryEngine::new().with_dataset("jobs", documents)
    }

    fn open(engine: &dyn Engine) -> Session {
        let dataset = Dataset::new(
            "jobs",
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(1_000, 0).unwrap(),
        );
        Session::open(engine, &[dataset], EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_group_slot_rejects_unknown_group() {
        let mut values = vec![0.0; 3];
        *group_slot(&mut values, 2).unwrap() += 1.0;
        assert_eq!(values[2], 1.0);
        let err = group_slot(&mut values, 3).unwrap_err();
        assert_eq!(err.code(), "AGG_EXEC_CONSISTENCY");
    }

    #[test]
    fn test_engine_reporting_unknown_group_fails_computation() {
        let scope = scope_of(["jobs"]);
        let query = FieldSet::string("query", &["jobs"]);
        let computations = [
            Computation::SumAcross {
                scope: scope.clone(),
                field: query.clone(),
                metric: AggregateMetric::doc_stats(DocMetric::Count),
                filter: None,
            },
            Computation::Distincts {
                scope: scope.clone(),
                field: query,
                window: 2,
            },
        ];
        for computation in computations {
            let engine = StrayEngine(jobs());
            let mut session = open(&engine);
            let err = session
                .execute(&[Command::ComputeAndCreateGroupStatsLookup {
                    name: "v".to_string(),
                    computation,
                }])
                .unwrap_err();
            assert_eq!(err.code(), "AGG_EXEC_CONSISTENCY");
        }

        let engine = jobs();
        let mut session = open(&engine);
        session
            .execute(&[Command::ComputeAndCreateGroupStatsLookup {
                name: "v".to_string(),
                computation: Computation::Distincts {
                    scope,
                    field: FieldSet::string("query", &["jobs"]),
                    window: 2,
                },
            }])
            .unwrap();
    }

    #[test]
    fn test_explode_with_unbounded_range_is_malformed() {
        let engine = jobs();
        let mut session = open(&engine);
        let err = session
            .execute(&[Command::ExplodeMetric {
                scope: scope_of(["jobs"]),
                metric: DocMetric::Field(FieldSet::int("oji", &["jobs"])),
                min: i64::MIN,
                max: i64::MAX,
                interval: 1,
                exclude_gutters: false,
                with_default: false,
            }])
            .unwrap_err();
        assert_eq!(err.code(), "AGG_EXEC_MALFORMED_COMMAND");
    }
}
