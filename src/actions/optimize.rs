//! Query action coalescing
//!
//! Runs of query actions over the same datasets and routing collapse into a
//! single action: when misses stay in place (`target == negative`) the run
//! moves anything matching any query, so the queries are OR-ed; when hits
//! stay in place (`target == positive`) only documents matching every query
//! survive, so they are AND-ed. Any other action ends the run.

use std::collections::BTreeMap;

use super::action::{Action, BooleanOp, Routing, StoreQuery};

struct Pending {
    per_dataset: BTreeMap<String, Vec<StoreQuery>>,
    routing: Routing,
}

impl Pending {
    fn mergeable(&self, per_dataset: &BTreeMap<String, StoreQuery>, routing: Routing) -> bool {
        self.routing == routing
            && (routing.target == routing.negative || routing.target == routing.positive)
            && self.per_dataset.keys().eq(per_dataset.keys())
    }

    fn into_action(self) -> Action {
        let op = if self.routing.target == self.routing.negative {
            BooleanOp::Or
        } else {
            BooleanOp::And
        };
        let per_dataset = self
            .per_dataset
            .into_iter()
            .map(|(dataset, mut queries)| {
                let query = if queries.len() == 1 {
                    queries.remove(0)
                } else {
                    StoreQuery::boolean(op, queries)
                };
                (dataset, query)
            })
            .collect();
        Action::Query {
            per_dataset,
            routing: self.routing,
        }
    }
}

/// Merge consecutive compatible query actions
pub fn coalesce(actions: Vec<Action>) -> Vec<Action> {
    let mut out = Vec::with_capacity(actions.len());
    let mut pending: Option<Pending> = None;

    for action in actions {
        match action {
            Action::Query {
                per_dataset,
                routing,
            } => {
                if let Some(run) = pending.as_mut() {
                    if run.mergeable(&per_dataset, routing) {
                        for (dataset, query) in per_dataset {
                            run.per_dataset.entry(dataset).or_default().push(query);
                        }
                        continue;
                    }
                }
                if let Some(run) = pending.take() {
                    out.push(run.into_action());
                }
                pending = Some(Pending {
                    per_dataset: per_dataset.into_iter().map(|(d, q)| (d, vec![q])).collect(),
                    routing,
                });
            }
            other => {
                if let Some(run) = pending.take() {
                    out.push(run.into_action());
                }
                out.push(other);
            }
        }
    }
    if let Some(run) = pending {
        out.push(run.into_action());
    }
    out
}
