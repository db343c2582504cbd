//! Metrics registry
//!
//! - Counters only, monotonic
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters shared by the compiler and every session
///
/// All counters use Relaxed ordering; workers only ever add.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    queries_compiled: AtomicU64,
    queries_rejected: AtomicU64,
    queries_executed: AtomicU64,
    queries_failed: AtomicU64,
    commands_executed: AtomicU64,
    regroups: AtomicU64,
    stats_pushed: AtomicU64,
    ftgs_tuples: AtomicU64,
    precomputed_slots: AtomicU64,
    rows_emitted: AtomicU64,
    truncations: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Compilation

    pub fn increment_queries_compiled(&self) {
        self.queries_compiled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries_rejected(&self) {
        self.queries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Execution

    pub fn increment_queries_executed(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries_failed(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commands(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_regroups(&self) {
        self.regroups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stats_pushed(&self, count: u64) {
        self.stats_pushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_ftgs_tuples(&self, count: u64) {
        self.ftgs_tuples.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_precomputed(&self) {
        self.precomputed_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows(&self, count: u64) {
        self.rows_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_truncations(&self) {
        self.truncations.fetch_add(1, Ordering::Relaxed);
    }

    /// Current snapshot as one JSON object
    pub fn to_json(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"{{"queries_compiled":{},"queries_rejected":{},"queries_executed":{},"queries_failed":{},"commands_executed":{},"regroups":{},"stats_pushed":{},"ftgs_tuples":{},"precomputed_slots":{},"rows_emitted":{},"truncations":{}}}"#,
            s.queries_compiled,
            s.queries_rejected,
            s.queries_executed,
            s.queries_failed,
            s.commands_executed,
            s.regroups,
            s.stats_pushed,
            s.ftgs_tuples,
            s.precomputed_slots,
            s.rows_emitted,
            s.truncations,
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_compiled: self.queries_compiled.load(Ordering::Relaxed),
            queries_rejected: self.queries_rejected.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            regroups: self.regroups.load(Ordering::Relaxed),
            stats_pushed: self.stats_pushed.load(Ordering::Relaxed),
            ftgs_tuples: self.ftgs_tuples.load(Ordering::Relaxed),
            precomputed_slots: self.precomputed_slots.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queries_compiled: u64,
    pub queries_rejected: u64,
    pub queries_executed: u64,
    pub queries_failed: u64,
    pub commands_executed: u64,
    pub regroups: u64,
    pub stats_pushed: u64,
    pub ftgs_tuples: u64,
    pub precomputed_slots: u64,
    pub rows_emitted: u64,
    pub truncations: u64,
}
