//! Explain plan output
//!
//! Produces deterministic, human-readable explain output.

use std::fmt;

use crate::language::CompileError;

use super::command::Command;
use super::planner::QueryPlan;

/// Explain plan output
#[derive(Debug, Clone)]
pub struct ExplainPlan {
    /// Whether compilation succeeded
    pub accepted: bool,
    /// Datasets the plan runs on
    pub datasets: Vec<String>,
    /// Number of grouping levels
    pub depth: Option<usize>,
    /// Named full-pass computations with their depth
    pub computations: Vec<String>,
    /// Staged steps, in order
    pub steps: Vec<String>,
    /// Wire commands, in order
    pub commands: Vec<String>,
    /// Rejection reason (if rejected)
    pub rejection_reason: Option<String>,
    /// Rejection error code (if rejected)
    pub rejection_code: Option<String>,
}

impl ExplainPlan {
    /// Creates an explain plan from a successful plan and its lowering
    pub fn from_plan(plan: &QueryPlan, commands: &[Command]) -> Self {
        let computations = plan
            .computations
            .iter()
            .map(|c| {
                format!(
                    "{} = {} @ depth {} ({:?})",
                    c.name, c.info.precomputed, c.info.depth, c.kind
                )
            })
            .collect();

        Self {
            accepted: true,
            datasets: plan.query.scope().into_iter().collect(),
            depth: Some(plan.depth()),
            computations,
            steps: plan.steps.iter().map(ToString::to_string).collect(),
            commands: commands.iter().map(ToString::to_string).collect(),
            rejection_reason: None,
            rejection_code: None,
        }
    }

    /// Creates an explain plan from a compile error
    pub fn from_error(err: &CompileError) -> Self {
        Self {
            accepted: false,
            datasets: Vec::new(),
            depth: None,
            computations: Vec::new(),
            steps: Vec::new(),
            commands: Vec::new(),
            rejection_reason: Some(err.message().to_string()),
            rejection_code: Some(err.code().to_string()),
        }
    }
}

impl fmt::Display for ExplainPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== EXPLAIN PLAN ===")?;

        if self.accepted {
            writeln!(f, "Status: ACCEPTED")?;
            if !self.datasets.is_empty() {
                writeln!(f, "Datasets: {}", self.datasets.join(", "))?;
            }
            if let Some(depth) = self.depth {
                writeln!(f, "Depth: {}", depth)?;
            }
            if !self.computations.is_empty() {
                writeln!(f, "Precomputed:")?;
                for computation in &self.computations {
                    writeln!(f, "  - {}", computation)?;
                }
            }
            writeln!(f, "Steps:")?;
            for (i, step) in self.steps.iter().enumerate() {
                writeln!(f, "  {}. {}", i + 1, step)?;
            }
            if !self.commands.is_empty() {
                writeln!(f, "Commands:")?;
                for (i, command) in self.commands.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, command)?;
                }
            }
        } else {
            writeln!(f, "Status: REJECTED")?;
            if let Some(code) = &self.rejection_code {
                writeln!(f, "Error Code: {}", code)?;
            }
            if let Some(reason) = &self.rejection_reason {
                writeln!(f, "Reason: {}", reason)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{
        AggregateMetric, Dataset, DocMetric, FieldSet, GroupBy, GroupByEntry, Query, QueryBuilder,
    };
    use crate::plan::{lower, LowerOptions, QueryPlanner};
    use chrono::{TimeZone, Utc};

    fn query() -> Query {
        let ds = Dataset::new(
            "ds",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        QueryBuilder::new()
            .from(ds)
            .group_by_entry(GroupByEntry::new(GroupBy::by_field(FieldSet::string("country", &["ds"]))))
            .select(vec![
                AggregateMetric::doc_stats(DocMetric::Count),
                AggregateMetric::distinct(FieldSet::string("user", &["ds"])),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn test_explain_accepted_plan() {
        let plan = QueryPlanner::new().plan(query()).unwrap();
        let commands = lower(&plan, LowerOptions::default()).unwrap();
        let explain = ExplainPlan::from_plan(&plan, &commands);

        assert!(explain.accepted);
        assert_eq!(explain.depth, Some(1));
        assert_eq!(explain.computations.len(), 1);
        assert_eq!(explain.datasets, vec!["ds".to_string()]);

        let output = format!("{}", explain);
        assert!(output.contains("ACCEPTED"));
        assert!(output.contains("COMPUTE_PRECOMPUTED"));
        assert!(output.contains("COMPUTE_AND_CREATE_LOOKUP"));
    }

    #[test]
    fn test_explain_rejected_plan() {
        let err = CompileError::depth("computation reached negative depth");
        let explain = ExplainPlan::from_error(&err);

        assert!(!explain.accepted);
        assert_eq!(explain.rejection_code, Some("AGG_COMPILE_DEPTH".into()));

        let output = format!("{}", explain);
        assert!(output.contains("REJECTED"));
        assert!(output.contains("AGG_COMPILE_DEPTH"));
        assert!(output.contains("negative depth"));
    }

    #[test]
    fn test_explain_deterministic() {
        let render = || {
            let plan = QueryPlanner::new().plan(query()).unwrap();
            let commands = lower(&plan, LowerOptions::default()).unwrap();
            format!("{}", ExplainPlan::from_plan(&plan, &commands))
        };
        assert_eq!(render(), render());
    }
}
