//! Execution plan assembly
//!
//! Turns a staged query into an ordered list of execution steps, then
//! lowers the steps into the commands a session executes.
//!
//! # Design Principles
//!
//! - Deterministic: the same query always yields the same steps and commands
//! - Immutable: plans and commands carry no runtime state
//! - Lossless: commands round-trip through the wire format unchanged

mod command;
mod errors;
mod explain;
mod lower;
mod planner;
mod step;
mod wire;

pub use command::{Command, Computation, MergeType};
pub use errors::{WireError, WireResult};
pub use explain::ExplainPlan;
pub use lower::{lower, LowerOptions};
pub use planner::{QueryPlan, QueryPlanner};
pub use step::ExecutionStep;
pub use wire::{decode_actions, decode_commands, encode_actions, encode_commands};
