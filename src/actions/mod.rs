//! Where-clause lowering
//!
//! The where clause becomes two action lists: sampling actions lifted off
//! its conjunctive spine, and the routing actions for everything else,
//! coalesced.

mod action;
mod compile;
mod optimize;
mod sample;

pub use action::{Action, BooleanOp, Routing, StoreQuery};
pub use compile::{compile_filter, compile_into, GroupSupplier};
pub use optimize::coalesce;
pub use sample::extract_samples;

use crate::language::{CompileResult, DocFilter, Scope};

/// Actions implementing one where clause
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereActions {
    pub samples: Vec<Action>,
    pub actions: Vec<Action>,
}

/// Lower an optional where clause over `scope`
pub fn compile_where(
    filter: Option<DocFilter>,
    scope: &Scope,
    coalesce_queries: bool,
) -> CompileResult<WhereActions> {
    let Some(filter) = filter else {
        return Ok(WhereActions::default());
    };
    let (rest, samples) = extract_samples(filter, scope);
    let actions = match rest {
        Some(DocFilter::Always) | None => Vec::new(),
        Some(rest) if coalesce_queries => coalesce(compile_filter(&rest, scope)?),
        Some(rest) => compile_filter(&rest, scope)?,
    };
    Ok(WhereActions { samples, actions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{scope_of, FieldSet};

    #[test]
    fn test_where_clause_splits_samples_and_routing() {
        let country = FieldSet::string("country", &["a"]);
        let filter = DocFilter::and_all(vec![
            DocFilter::field_is(country.clone(), "us"),
            DocFilter::Sample {
                field: FieldSet::string("user", &["a"]),
                numerator: 1,
                denominator: 2,
                seed: "s".into(),
            },
            DocFilter::field_is(country, "gb"),
        ]);
        let lowered = compile_where(Some(filter), &scope_of(["a"]), true).unwrap();
        assert_eq!(lowered.samples.len(), 1);
        // both term queries keep hits in place and coalesce into one
        assert_eq!(lowered.actions.len(), 1);
    }

    #[test]
    fn test_no_where_clause() {
        assert_eq!(
            compile_where(None, &scope_of(["a"]), true).unwrap(),
            WhereActions::default()
        );
    }
}
