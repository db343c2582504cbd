//! Precomputed Metric Tests
//!
//! Full-pass computations executed against the in-memory engine:
//! - Percentiles and field extremes over int fields
//! - Parent references, sums across a group-by and running sums
//! - Seeded bootstrap, stable from run to run

use aggql::config::EngineConfig;
use aggql::language::{
    AggregateMetric, BootstrapOutput, CompareOp, Dataset, DocFilter, DocMetric, FieldSet, GroupBy,
    Query, QueryBuilder,
};
use aggql::memory::{Document, MemoryEngine};
use aggql::QueryRunner;
use chrono::{TimeZone, Utc};

// =============================================================================
// Helper Functions
// =============================================================================

const DAY_START: i64 = 1_704_067_200;

fn engine() -> MemoryEngine {
    let rows = [
        ("us", "rn", 10, 1),
        ("us", "rn", 5, 2),
        ("us", "dev", 20, 4),
        ("gb", "rn", 7, 1),
        ("us", "cook", 1, 0),
        ("gb", "dev", 3, 1),
    ];
    let docs = rows
        .iter()
        .enumerate()
        .map(|(i, (country, query, oji, ojc))| {
            Document::at(DAY_START + 600 * i as i64)
                .string("country", *country)
                .string("query", *query)
                .int("oji", *oji)
                .int("ojc", *ojc)
        })
        .collect();
    MemoryEngine::new().with_dataset("jobs", docs)
}

fn jobs() -> Dataset {
    Dataset::new(
        "jobs",
        Utc.timestamp_opt(DAY_START, 0).unwrap(),
        Utc.timestamp_opt(DAY_START + 86_400, 0).unwrap(),
    )
}

fn field(name: &str) -> FieldSet {
    FieldSet::string(name, &["jobs"])
}

fn int_field(name: &str) -> FieldSet {
    FieldSet::int(name, &["jobs"])
}

fn count() -> AggregateMetric {
    AggregateMetric::doc_stats(DocMetric::Count)
}

fn grouped_by(group_by: GroupBy, selects: Vec<AggregateMetric>) -> Query {
    QueryBuilder::new()
        .from(jobs())
        .group_by(group_by)
        .select(selects)
        .build()
        .unwrap()
}

fn run(query: Query) -> aggql::QueryResult {
    QueryRunner::new(engine(), EngineConfig::default()).run(query).unwrap()
}

fn value(result: &aggql::QueryResult, label: &str) -> Vec<f64> {
    result.by_labels()[&vec![label.to_string()]].clone()
}

// =============================================================================
// Field Computations
// =============================================================================

/// Median of oji per query: rn {5, 7, 10}, dev {3, 20}, cook {1}
#[test]
fn test_percentile_per_group() {
    let median = AggregateMetric::Percentile {
        field: int_field("oji"),
        percentile: 50.0,
    };
    let result = run(grouped_by(GroupBy::by_field(field("query")), vec![median]));
    assert_eq!(value(&result, "rn"), vec![7.0]);
    assert_eq!(value(&result, "dev"), vec![3.0]);
    assert_eq!(value(&result, "cook"), vec![1.0]);
}

/// The oji term with the largest ojc sum, per query
#[test]
fn test_field_max_by_metric() {
    let max = AggregateMetric::FieldMax {
        field: int_field("oji"),
        metric: Some(Box::new(AggregateMetric::doc_stats(DocMetric::Field(int_field("ojc"))))),
        filter: None,
    };
    let result = run(grouped_by(GroupBy::by_field(field("query")), vec![max]));
    assert_eq!(value(&result, "rn"), vec![5.0]);
    assert_eq!(value(&result, "dev"), vec![20.0]);
    assert_eq!(value(&result, "cook"), vec![1.0]);
}

/// Summing count across a per-query split gives back the group count.
#[test]
fn test_sum_across_group_by() {
    let across = AggregateMetric::SumAcross {
        group_by: Box::new(GroupBy::by_field(field("query"))),
        metric: Box::new(count()),
    };
    let result = run(grouped_by(GroupBy::by_field(field("country")), vec![across, count()]));
    assert_eq!(value(&result, "gb"), vec![2.0, 2.0]);
    assert_eq!(value(&result, "us"), vec![4.0, 4.0]);
}

// =============================================================================
// Cross-group References
// =============================================================================

/// count() / PARENT(count()) is each country's share of all documents.
#[test]
fn test_parent_ratio() {
    let share = AggregateMetric::divide(count(), AggregateMetric::parent(count()));
    let result = run(grouped_by(GroupBy::by_field(field("country")), vec![share]));
    assert!((value(&result, "gb")[0] - 2.0 / 6.0).abs() < 1e-9);
    assert!((value(&result, "us")[0] - 4.0 / 6.0).abs() < 1e-9);
}

/// Running sums walk sibling groups in order.
#[test]
fn test_running_sum_over_siblings() {
    let predicate = DocFilter::compare(
        CompareOp::Gt,
        DocMetric::Field(int_field("oji")),
        DocMetric::Constant(8),
    );
    let running = AggregateMetric::Running(Box::new(count()));
    let result = run(grouped_by(GroupBy::ByPredicate(predicate), vec![count(), running]));
    assert_eq!(value(&result, "false"), vec![4.0, 4.0]);
    assert_eq!(value(&result, "true"), vec![2.0, 6.0]);
}

// =============================================================================
// Bootstrap
// =============================================================================

fn bootstrap_query(seed: &str) -> Query {
    let bootstrap = AggregateMetric::Bootstrap {
        field: field("query"),
        filter: None,
        metric: Box::new(count()),
        num_bootstraps: 20,
        seed: seed.to_string(),
        outputs: vec![
            BootstrapOutput::Min,
            BootstrapOutput::Mean,
            BootstrapOutput::Max,
            BootstrapOutput::NumTerms,
        ],
    };
    grouped_by(GroupBy::by_field(field("country")), vec![bootstrap])
}

/// Each output becomes its own column; resampling is seeded.
#[test]
fn test_bootstrap_outputs_and_determinism() {
    let first = run(bootstrap_query("seed-a"));
    let second = run(bootstrap_query("seed-a"));
    assert_eq!(first.rows, second.rows);

    let us = value(&first, "us");
    assert_eq!(us.len(), 4);
    let (min, mean, max, num_terms) = (us[0], us[1], us[2], us[3]);
    assert!(min <= mean && mean <= max);
    assert_eq!(num_terms, 3.0);
    // resampled counts stay within [num_terms * 1, num_terms * 2]
    assert!(min >= 3.0 && max <= 6.0);
}

/// Entries past the configured cap are counted as skipped, not sampled.
#[test]
fn test_bootstrap_entry_cap() {
    let runner = QueryRunner::new(engine(), EngineConfig::default().with_max_bootstrap_entries(2));
    let bootstrap = AggregateMetric::Bootstrap {
        field: field("query"),
        filter: None,
        metric: Box::new(count()),
        num_bootstraps: 4,
        seed: "cap".to_string(),
        outputs: vec![BootstrapOutput::NumTerms, BootstrapOutput::SkippedTerms],
    };
    let query = QueryBuilder::new()
        .from(jobs())
        .select(vec![bootstrap])
        .build()
        .unwrap();
    let result = runner.run(query).unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].values, vec![2.0, 1.0]);
}
