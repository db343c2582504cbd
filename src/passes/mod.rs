//! Compiler passes over resolved queries
//!
//! # Pass order
//!
//! 1. `validate`: scope subset rules and group-by shape
//! 2. `extract_precomputed`: depth staging of full-pass computations
//!
//! The where-clause pass lives in `actions`. Every pass consumes a `Query`
//! and returns a new one.

mod extract_precomputed;
mod precomputed;
mod validate;

pub use extract_precomputed::{
    extract_precomputed, ComputationInfo, ComputationType, Extracted, NamedComputation,
};
pub use precomputed::Precomputed;
pub use validate::validate;
