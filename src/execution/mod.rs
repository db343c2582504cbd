//! Command execution
//!
//! A `Session` holds one engine session per dataset and runs lowered
//! commands against them. Grouping state lives in two places that are kept
//! in lockstep: the engine sessions (which documents sit in which group) and
//! the session's `GroupKeySet` (what each group means).
//!
//! # Design Principles
//!
//! - Fan-out: every grouping change runs on all datasets, in parallel, and
//!   joins before the next command
//! - Balanced: every command pops exactly the stats it pushed
//! - Fail closed: an error closes every dataset session
//!
//! The `Engine` and `DatasetSession` traits describe the external columnar
//! engine; `crate::memory` provides an in-process implementation.

mod compute;
mod engine;
mod errors;
mod explode;
mod group_keys;
mod iterate;
mod metrics;
mod result;
mod session;
mod topk;

pub use engine::{
    Condition, DatasetSession, Engine, FtgsField, FtgsIterator, FtgsTuple, RegroupRule,
};
pub use errors::{EngineError, EngineResult, ExecutionError, ExecutionResult};
pub use group_keys::{ChildGroup, GroupKey, GroupKeySet};
pub use metrics::{columns, CompiledFilter, CompiledMetric, EvalContext, EvalMode, LookupSource, MetricCompiler, PushLayout};
pub use result::{ExecutionCounters, QueryResult, Row, SampledTerms};
pub use session::Session;
pub use topk::TopK;
