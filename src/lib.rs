//! aggql - depth-staged compilation and execution of grouped aggregation
//! queries
//!
//! A query names datasets, a document filter, a stack of group-bys with
//! optional having-filters, and per-group selects. Compilation stages every
//! full-pass computation at the grouping depth it needs, turns the filter
//! into regroup actions and lowers the result into engine commands.
//! Execution runs those commands against one engine session per dataset.
//!
//! Pipeline:
//!
//! ```text
//! Query -> passes (validate, extract precomputed) -> plan (steps)
//!       -> lower (commands) -> execution::Session -> QueryResult
//! ```

pub mod actions;
pub mod config;
pub mod execution;
pub mod language;
pub mod memory;
pub mod observability;
pub mod passes;
pub mod plan;
pub mod runner;

pub use config::EngineConfig;
pub use execution::{QueryResult, Row, Session};
pub use runner::{CompiledQuery, QueryRunner};
