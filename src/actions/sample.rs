//! SAMPLE extraction
//!
//! Sampling is only meaningful as a restriction of the whole document set,
//! so it may only appear along the conjunctive spine of the where clause:
//! under `And` and `Qualified` nodes, never below `Or` or `Not`.

use super::action::{Action, Routing};
use crate::language::{DocFilter, Scope};

/// Split `filter` into the sampling actions of its spine and the filter left
/// over. Samples off the spine stay in place and are rejected when the
/// remainder is compiled.
pub fn extract_samples(filter: DocFilter, scope: &Scope) -> (Option<DocFilter>, Vec<Action>) {
    let mut samples = Vec::new();
    let rest = walk(filter, scope, &mut samples);
    (rest, samples)
}

fn walk(filter: DocFilter, scope: &Scope, samples: &mut Vec<Action>) -> Option<DocFilter> {
    match filter {
        DocFilter::Sample {
            field,
            numerator,
            denominator,
            seed,
        } => {
            samples.push(Action::Sample {
                scope: scope.intersection(&field.datasets()).cloned().collect(),
                field,
                probability: numerator as f64 / denominator as f64,
                seed,
                routing: Routing::new(1, 1, 0),
            });
            None
        }
        DocFilter::And(a, b) => {
            let a = walk(*a, scope, samples);
            let b = walk(*b, scope, samples);
            match (a, b) {
                (Some(a), Some(b)) => Some(DocFilter::and(a, b)),
                (one, None) | (None, one) => one,
            }
        }
        DocFilter::Qualified {
            scope: inner,
            filter,
        } => {
            let narrowed: Scope = inner.intersection(scope).cloned().collect();
            walk(*filter, &narrowed, samples).map(|filter| DocFilter::Qualified {
                scope: inner,
                filter: Box::new(filter),
            })
        }
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{scope_of, FieldSet};

    fn sample(seed: &str) -> DocFilter {
        DocFilter::Sample {
            field: FieldSet::string("user", &["a", "b"]),
            numerator: 1,
            denominator: 4,
            seed: seed.into(),
        }
    }

    #[test]
    fn test_spine_samples_are_lifted() {
        let country = DocFilter::field_is(FieldSet::string("country", &["a", "b"]), "us");
        let filter = DocFilter::and(
            country.clone(),
            DocFilter::Qualified {
                scope: scope_of(["b"]),
                filter: Box::new(sample("x")),
            },
        );
        let (rest, samples) = extract_samples(filter, &scope_of(["a", "b"]));
        assert_eq!(rest, Some(country));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].scope(), scope_of(["b"]));
        match &samples[0] {
            Action::Sample { probability, .. } => assert_eq!(*probability, 0.25),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_sample_under_or_stays() {
        let filter = DocFilter::or(sample("x"), DocFilter::Never);
        let (rest, samples) = extract_samples(filter.clone(), &scope_of(["a"]));
        assert!(samples.is_empty());
        assert_eq!(rest, Some(filter));
    }

    #[test]
    fn test_only_samples_leave_nothing() {
        let (rest, samples) =
            extract_samples(DocFilter::and(sample("x"), sample("y")), &scope_of(["a"]));
        assert_eq!(rest, None);
        assert_eq!(samples.len(), 2);
    }
}
