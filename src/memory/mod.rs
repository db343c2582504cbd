//! In-process reference engine
//!
//! Implements the `Engine` protocol over documents held in memory. Used by
//! tests and embedders that have no columnar store at hand. Programs,
//! conditions and term iteration follow the engine contract exactly, so a
//! query answered here is answered the same way by any conforming engine.

mod document;
mod program;
mod session;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::execution::{DatasetSession, Engine, EngineError, EngineResult};

pub use document::Document;
pub use program::{sampled, Program};
pub use session::MemorySession;

/// Per-session caps; exceeding one is `ResourceExhausted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub max_stats: usize,
    pub max_groups: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_stats: 1024,
            max_groups: 1_000_000,
        }
    }
}

/// Engine-wide activity counters, shared by every session
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub sorted_requests: AtomicU64,
    pub open_iterators: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    datasets: BTreeMap<String, Arc<Vec<Document>>>,
    limits: MemoryLimits,
    counters: Arc<EngineCounters>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: impl Into<String>, documents: Vec<Document>) -> Self {
        self.datasets.insert(name.into(), Arc::new(documents));
        self
    }

    pub fn with_limits(mut self, limits: MemoryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Sorted term iterations requested so far
    pub fn sorted_requests(&self) -> u64 {
        self.counters.sorted_requests.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn live_sessions(&self) -> u64 {
        let opened = self.counters.sessions_opened.load(Ordering::SeqCst);
        let closed = self.counters.sessions_closed.load(Ordering::SeqCst);
        opened.saturating_sub(closed)
    }

    pub fn open_iterators(&self) -> u64 {
        self.counters.open_iterators.load(Ordering::SeqCst)
    }
}

impl Engine for MemoryEngine {
    fn open(
        &self,
        dataset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Box<dyn DatasetSession>> {
        let documents = self
            .datasets
            .get(dataset)
            .ok_or_else(|| EngineError::Failed(format!("unknown dataset '{}'", dataset)))?;
        Ok(Box::new(MemorySession::new(
            dataset,
            Arc::clone(documents),
            start.timestamp(),
            end.timestamp(),
            self.limits,
            Arc::clone(&self.counters),
        )))
    }
}
