//! Plan Invariant Tests
//!
//! Checks that hold for every accepted plan:
//! - Each named computation runs at exactly the depth it was staged for
//! - Post-computations run after their explode, pre-computations before
//! - Planning and explain output are deterministic
//!
//! Rejections surface through explain with their error codes. Nested
//! PARENT and filtered DISTINCT combinations are fuzzed against the depth
//! invariant.

use aggql::config::EngineConfig;
use aggql::language::{
    AggregateFilter, AggregateMetric, CompareOp, Dataset, DocFilter, DocMetric, FieldSet, GroupBy,
    GroupByEntry, Query, QueryBuilder,
};
use aggql::memory::MemoryEngine;
use aggql::passes::ComputationType;
use aggql::plan::{ExecutionStep, QueryPlan, QueryPlanner};
use aggql::QueryRunner;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

fn dataset(name: &str) -> Dataset {
    Dataset::new(
        name,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
    )
}

fn field(name: &str) -> FieldSet {
    FieldSet::string(name, &["jobs"])
}

fn count() -> AggregateMetric {
    AggregateMetric::doc_stats(DocMetric::Count)
}

fn distinct(name: &str) -> AggregateMetric {
    AggregateMetric::distinct(field(name))
}

/// A three-level query touching every staging position
fn layered_query() -> Query {
    let having = AggregateFilter::compare(CompareOp::Gt, distinct("user"), AggregateMetric::Constant(1.0));
    QueryBuilder::new()
        .from(dataset("jobs"))
        .filter(DocFilter::field_is(field("country"), "us"))
        .group_by(GroupBy::by_field(field("country")))
        .group_by_entry(GroupByEntry::new(GroupBy::by_field(field("query"))).having(having))
        .group_by(GroupBy::top(field("title"), 5, count()))
        .select(vec![
            count(),
            distinct("user"),
            AggregateMetric::add(vec![distinct("user"), AggregateMetric::Constant(1.0)]),
            AggregateMetric::parent(distinct("user")),
            AggregateMetric::divide(count(), AggregateMetric::parent(count())),
        ])
        .build()
        .unwrap()
}

/// Walk the steps tracking depth and check every computation against its
/// staged depth and position
fn assert_staged_depths(plan: &QueryPlan) {
    let mut depth = 0usize;
    let mut seen = Vec::new();
    for step in &plan.steps {
        if let ExecutionStep::ComputePrecomputed { name, .. } = step {
            let computation = plan
                .computation(name)
                .unwrap_or_else(|| panic!("step computes unknown slot {}", name));
            match computation.kind {
                ComputationType::PreComputation => assert_eq!(
                    computation.info.depth, depth,
                    "{} should run at depth {}",
                    name, computation.info.depth
                ),
                ComputationType::PostComputation => {
                    assert_eq!(computation.info.depth + 1, depth, "{} runs after its explode", name)
                }
            }
            assert!(!seen.contains(name), "{} computed twice", name);
            seen.push(name.clone());
        }
        if step.is_explode() {
            depth += 1;
        }
    }
    assert_eq!(depth, plan.depth());
    assert_eq!(seen.len(), plan.computations.len());
}

// =============================================================================
// Depth Staging
// =============================================================================

#[test]
fn test_computations_run_at_their_depth() {
    let plan = QueryPlanner::new().plan(layered_query()).unwrap();
    assert!(!plan.computations.is_empty());
    assert_staged_depths(&plan);
}

#[test]
fn test_identical_computations_share_a_slot() {
    let plan = QueryPlanner::new().plan(layered_query()).unwrap();
    // distinct(user) appears twice in the selects but is computed once
    let at_depth_3: Vec<_> = plan
        .computations
        .iter()
        .filter(|c| c.info.depth == 3 && c.kind == ComputationType::PreComputation)
        .filter(|c| c.info.precomputed.kind() == "DISTINCT")
        .collect();
    assert_eq!(at_depth_3.len(), 1);
}

#[test]
fn test_having_with_distinct_is_post_computed() {
    let plan = QueryPlanner::new().plan(layered_query()).unwrap();
    assert!(plan
        .computations
        .iter()
        .any(|c| c.kind == ComputationType::PostComputation && c.info.depth == 1));

    let filter_at = plan
        .steps
        .iter()
        .position(|s| matches!(s, ExecutionStep::FilterGroups { .. }))
        .unwrap();
    let explodes_before = plan.steps[..filter_at].iter().filter(|s| s.is_explode()).count();
    assert_eq!(explodes_before, 2);
}

#[test]
fn test_where_actions_lead_the_plan() {
    let plan = QueryPlanner::new().plan(layered_query()).unwrap();
    assert!(matches!(plan.steps[0], ExecutionStep::FilterActions { .. }));
    assert!(matches!(plan.steps.last(), Some(ExecutionStep::GetGroupStats { .. })));
}

// =============================================================================
// Determinism and Explain
// =============================================================================

#[test]
fn test_planning_is_deterministic() {
    let first = QueryPlanner::new().plan(layered_query()).unwrap();
    let second = QueryPlanner::new().plan(layered_query()).unwrap();
    assert_eq!(first, second);

    let runner = QueryRunner::new(MemoryEngine::new(), EngineConfig::default());
    let a = runner.explain(layered_query()).to_string();
    let b = runner.explain(layered_query()).to_string();
    assert_eq!(a, b);
    assert!(a.contains("ACCEPTED"));
}

#[test]
fn test_explain_reports_rejections_with_codes() {
    let runner = QueryRunner::new(MemoryEngine::new(), EngineConfig::default());

    let too_deep = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(field("country")))
        .select(vec![AggregateMetric::parent(AggregateMetric::parent(distinct("user")))])
        .build()
        .unwrap();
    let explain = runner.explain(too_deep);
    assert!(!explain.accepted);
    assert_eq!(explain.rejection_code.as_deref(), Some("AGG_COMPILE_DEPTH"));

    let outside_scope = QueryBuilder::new()
        .from(dataset("jobs"))
        .select(vec![AggregateMetric::doc_stats(DocMetric::Field(FieldSet::int(
            "clicks",
            &["ads"],
        )))])
        .build()
        .unwrap();
    let explain = runner.explain(outside_scope);
    assert!(!explain.accepted);
    assert_eq!(explain.rejection_code.as_deref(), Some("AGG_COMPILE_SCOPE"));
    assert_eq!(runner.metrics().snapshot().queries_rejected, 2);
}

#[test]
fn test_duplicate_dataset_is_ambiguous() {
    let err = QueryBuilder::new()
        .from(dataset("jobs"))
        .from(dataset("jobs"))
        .build()
        .unwrap_err();
    assert_eq!(err.code(), "AGG_COMPILE_AMBIGUITY");
}

// =============================================================================
// Nested Depth Fuzzing
// =============================================================================

fn arb_select() -> impl Strategy<Value = AggregateMetric> {
    let leaf = prop_oneof![Just(count()), Just(distinct("user")), Just(distinct("title"))];
    leaf.prop_recursive(4, 16, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(AggregateMetric::parent),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| AggregateMetric::divide(a, b)),
            inner.prop_map(|m| AggregateMetric::Distinct {
                field: field("user"),
                filter: Some(Box::new(AggregateFilter::compare(
                    CompareOp::Gt,
                    m,
                    AggregateMetric::Constant(0.0),
                ))),
                window: None,
            }),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn nested_selects_stage_at_consistent_depths(
        selects in prop::collection::vec(arb_select(), 1..3),
        levels in 1usize..4,
    ) {
        let mut builder = QueryBuilder::new().from(dataset("jobs"));
        for name in ["country", "query", "title"].iter().take(levels) {
            builder = builder.group_by(GroupBy::by_field(field(name)));
        }
        let query = builder.select(selects).build().unwrap();
        match QueryPlanner::new().plan(query) {
            Ok(plan) => assert_staged_depths(&plan),
            Err(err) => prop_assert!(
                matches!(err.code(), "AGG_COMPILE_DEPTH" | "AGG_COMPILE_STRUCTURAL"),
                "unexpected rejection {}",
                err
            ),
        }
    }
}
