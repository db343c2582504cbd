//! Execution Scenario Tests
//!
//! End-to-end queries against the in-memory engine:
//! - Where-clause actions, top-k explodes and final stats
//! - Precomputed lookups (distinct, filtered distinct)
//! - Having filters, bucket, day-of-week and predicate explodes
//! - Row limits, resource exhaustion and handle release

use aggql::config::EngineConfig;
use aggql::execution::{Session, GroupKey};
use aggql::language::{
    AggregateFilter, AggregateMetric, CompareOp, Dataset, DocFilter, DocMetric, FieldSet, GroupBy,
    GroupByEntry, Query, QueryBuilder, Term,
};
use aggql::memory::{Document, MemoryEngine, MemoryLimits};
use aggql::plan::Command;
use aggql::QueryRunner;
use chrono::{TimeZone, Utc};

// =============================================================================
// Helper Functions
// =============================================================================

const DAY_START: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z, a Monday

fn jobs_docs() -> Vec<Document> {
    let rows = [
        ("us", "rn", 10, 1),
        ("us", "rn", 5, 2),
        ("us", "dev", 20, 4),
        ("gb", "rn", 7, 1),
        ("us", "cook", 1, 0),
        ("gb", "dev", 3, 1),
    ];
    rows.iter()
        .enumerate()
        .map(|(i, (country, query, oji, ojc))| {
            Document::at(DAY_START + 3600 * i as i64)
                .string("country", *country)
                .string("query", *query)
                .int("oji", *oji)
                .int("ojc", *ojc)
        })
        .collect()
}

fn ads_docs() -> Vec<Document> {
    [("us", "rn"), ("us", "nurse"), ("gb", "rn")]
        .iter()
        .map(|(country, query)| {
            Document::at(DAY_START + 60)
                .string("country", *country)
                .string("query", *query)
        })
        .collect()
}

fn engine() -> MemoryEngine {
    MemoryEngine::new()
        .with_dataset("jobs", jobs_docs())
        .with_dataset("ads", ads_docs())
}

fn dataset(name: &str) -> Dataset {
    Dataset::new(
        name,
        Utc.timestamp_opt(DAY_START, 0).unwrap(),
        Utc.timestamp_opt(DAY_START + 86_400, 0).unwrap(),
    )
}

fn string_field(name: &str, datasets: &[&str]) -> FieldSet {
    FieldSet::string(name, datasets)
}

fn int_field(name: &str) -> FieldSet {
    FieldSet::int(name, &["jobs"])
}

fn sum_of(field: &str) -> AggregateMetric {
    AggregateMetric::doc_stats(DocMetric::Field(int_field(field)))
}

fn count() -> AggregateMetric {
    AggregateMetric::doc_stats(DocMetric::Count)
}

fn labels(result: &aggql::QueryResult) -> Vec<Vec<String>> {
    result.rows.iter().map(|r| r.key_labels()).collect()
}

fn runner(config: EngineConfig) -> QueryRunner<MemoryEngine> {
    QueryRunner::new(engine(), config)
}

fn top_query_by_oji() -> Query {
    QueryBuilder::new()
        .from(dataset("jobs"))
        .filter(DocFilter::field_is(string_field("country", &["jobs"]), "us"))
        .group_by(GroupBy::top(string_field("query", &["jobs"]), 2, sum_of("oji")))
        .select(vec![
            sum_of("oji"),
            sum_of("ojc"),
            AggregateMetric::divide(sum_of("oji"), sum_of("ojc")),
        ])
        .build()
        .unwrap()
}

// =============================================================================
// Top-k and Where Clause
// =============================================================================

/// WHERE country="us" GROUP BY query[2 BY oji] keeps the two largest terms,
/// sorted by oji descending.
#[test]
fn test_top_k_with_where_clause() {
    let runner = runner(EngineConfig::default());
    let result = runner.run(top_query_by_oji()).unwrap();

    assert_eq!(labels(&result), vec![vec!["dev"], vec!["rn"]]);
    assert_eq!(result.rows[0].values, vec![20.0, 4.0, 5.0]);
    assert_eq!(result.rows[1].values, vec![15.0, 3.0, 5.0]);
    assert!(!result.truncated);
}

/// Fusing the last explode into a term iteration does not change rows.
#[test]
fn test_last_iterate_optimization_is_transparent() {
    let fused = runner(EngineConfig::default()).run(top_query_by_oji()).unwrap();
    let unfused = runner(EngineConfig::default().with_last_iterate_optimization(false))
        .run(top_query_by_oji())
        .unwrap();
    assert_eq!(fused.rows, unfused.rows);
}

/// Plain top-k does not need sorted iteration; forcing it is honored.
#[test]
fn test_sorted_iteration_only_on_demand() {
    let plain = runner(EngineConfig::default());
    plain.run(top_query_by_oji()).unwrap();
    assert_eq!(plain.engine().sorted_requests(), 0);

    let forced = runner(EngineConfig::default().with_forced_sorting(true));
    forced.run(top_query_by_oji()).unwrap();
    assert!(forced.engine().sorted_requests() > 0);
}

// =============================================================================
// Precomputed Lookups
// =============================================================================

/// DISTINCT(query) per country, single dataset and across two datasets.
#[test]
fn test_distinct_per_group() {
    let single = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("country", &["jobs"])))
        .select(vec![count(), AggregateMetric::distinct(string_field("query", &["jobs"]))])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(single).unwrap();
    assert_eq!(labels(&result), vec![vec!["gb"], vec!["us"]]);
    assert_eq!(result.rows[0].values, vec![2.0, 2.0]);
    assert_eq!(result.rows[1].values, vec![4.0, 3.0]);

    let both = ["ads", "jobs"];
    let merged = QueryBuilder::new()
        .from(dataset("jobs"))
        .from(dataset("ads"))
        .group_by(GroupBy::by_field(string_field("country", &both)))
        .select(vec![count(), AggregateMetric::distinct(string_field("query", &both))])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(merged).unwrap();
    assert_eq!(labels(&result), vec![vec!["gb"], vec!["us"]]);
    assert_eq!(result.rows[0].values, vec![3.0, 2.0]);
    assert_eq!(result.rows[1].values, vec![6.0, 4.0]);
}

/// A filtered DISTINCT counts only terms passing the filter and leaves the
/// parent's documents in place.
#[test]
fn test_filtered_distinct_keeps_parent_documents() {
    let distinct = AggregateMetric::Distinct {
        field: string_field("query", &["jobs"]),
        filter: Some(Box::new(AggregateFilter::compare(
            CompareOp::Gt,
            count(),
            AggregateMetric::Constant(1.0),
        ))),
        window: None,
    };
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("country", &["jobs"])))
        .select(vec![distinct, count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    let by_labels = result.by_labels();
    assert_eq!(by_labels[&vec!["gb".to_string()]], vec![0.0, 2.0]);
    assert_eq!(by_labels[&vec!["us".to_string()]], vec![1.0, 4.0]);
}

// =============================================================================
// Group Filters and Explodes
// =============================================================================

/// HAVING count() > 1 drops groups permanently and renumbers the rest.
#[test]
fn test_having_filter_drops_groups() {
    let entry = GroupByEntry::new(GroupBy::by_field(string_field("query", &["jobs"]))).having(
        AggregateFilter::compare(CompareOp::Gt, count(), AggregateMetric::Constant(1.0)),
    );
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by_entry(entry)
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    assert_eq!(labels(&result), vec![vec!["dev"], vec!["rn"]]);
    assert_eq!(result.rows[0].values, vec![2.0]);
    assert_eq!(result.rows[1].values, vec![3.0]);
}

/// Buckets over a document metric, with gutter buckets.
#[test]
fn test_metric_buckets_with_gutters() {
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::ByMetric {
            metric: DocMetric::Field(int_field("oji")),
            min: 0,
            max: 20,
            interval: 10,
            exclude_gutters: false,
            with_default: false,
        })
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    let by_labels = result.by_labels();
    assert_eq!(by_labels[&vec!["[0, 10)".to_string()]], vec![4.0]);
    assert_eq!(by_labels[&vec!["[10, 20)".to_string()]], vec![1.0]);
    assert_eq!(by_labels[&vec!["[20, inf)".to_string()]], vec![1.0]);
    assert_eq!(by_labels[&vec!["[-inf, 0)".to_string()]], vec![0.0]);
}

/// Every document of the fixture falls on a Monday.
#[test]
fn test_day_of_week() {
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::ByDayOfWeek { field: None })
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    let by_labels = result.by_labels();
    assert_eq!(result.len(), 7);
    assert_eq!(by_labels[&vec!["Monday".to_string()]], vec![6.0]);
    assert_eq!(by_labels[&vec!["Tuesday".to_string()]], vec![0.0]);
}

/// A predicate splits each group into "false" then "true".
#[test]
fn test_predicate_explode() {
    let predicate = DocFilter::Compare {
        op: CompareOp::Gt,
        left: DocMetric::Field(int_field("oji")),
        right: DocMetric::Constant(8),
    };
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::ByPredicate(predicate))
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    assert_eq!(labels(&result), vec![vec!["false"], vec!["true"]]);
    assert_eq!(result.rows[0].values, vec![4.0]);
    assert_eq!(result.rows[1].values, vec![2.0]);
}

/// Two grouping levels produce two-element key paths.
#[test]
fn test_nested_group_by_key_paths() {
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("country", &["jobs"])))
        .group_by(GroupBy::by_field(string_field("query", &["jobs"])))
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    assert_eq!(
        labels(&result),
        vec![
            vec!["gb", "dev"],
            vec!["gb", "rn"],
            vec!["us", "cook"],
            vec!["us", "dev"],
            vec!["us", "rn"],
        ]
    );
    assert!(result.rows.iter().all(|r| r.keys.len() == 2));
    assert_eq!(result.rows[4].values, vec![2.0]);
}

// =============================================================================
// Limits, Failures and Resource Release
// =============================================================================

/// The query row limit cuts output and marks it truncated.
#[test]
fn test_query_row_limit_truncates() {
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("query", &["jobs"])))
        .select(vec![count()])
        .limit(1)
        .build()
        .unwrap();
    let result = runner(EngineConfig::default()).run(query).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result.truncated);
}

/// The row-limit safety valve truncates term iteration without failing.
#[test]
fn test_row_limit_valve() {
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("query", &["jobs"])))
        .select(vec![count()])
        .build()
        .unwrap();
    let result = runner(EngineConfig::default().with_row_limit(2)).run(query).unwrap();
    assert_eq!(result.len(), 2);
    assert!(result.truncated);
}

/// Engine resource exhaustion aborts the query and releases every handle.
#[test]
fn test_resource_exhaustion_releases_sessions() {
    let engine = engine().with_limits(MemoryLimits {
        max_stats: 16,
        max_groups: 2,
    });
    let runner = QueryRunner::new(engine, EngineConfig::default().with_last_iterate_optimization(false));
    let query = QueryBuilder::new()
        .from(dataset("jobs"))
        .group_by(GroupBy::by_field(string_field("query", &["jobs"])))
        .select(vec![count()])
        .build()
        .unwrap();
    let err = runner.run(query).unwrap_err();
    assert_eq!(err.code(), "AGG_EXEC_RESOURCE_EXHAUSTED");
    assert_eq!(runner.engine().live_sessions(), 0);
    assert_eq!(runner.engine().open_iterators(), 0);
}

/// Successful runs release handles and iterators as well.
#[test]
fn test_successful_run_releases_resources() {
    let runner = runner(EngineConfig::default());
    runner.run(top_query_by_oji()).unwrap();
    assert_eq!(runner.engine().live_sessions(), 0);
    assert_eq!(runner.engine().open_iterators(), 0);
}

// =============================================================================
// Direct Session Use
// =============================================================================

/// Explode then regroup-into-parent restores the parent group count, and
/// the push stack is balanced after every command.
#[test]
fn test_explode_then_regroup_into_parent() {
    let engine = engine();
    let mut session = Session::open(&engine, &[dataset("jobs")], EngineConfig::default()).unwrap();
    let commands = vec![
        Command::ExplodeFieldIn {
            field: string_field("country", &["jobs"]),
            terms: vec![Term::from("us"), Term::from("gb")],
            with_default: false,
        },
        Command::RegroupIntoParent {
            merge: aggql::plan::MergeType::SumAll,
        },
        Command::GetGroupStats { metrics: vec![count()] },
    ];
    let result = session.execute(&commands).unwrap();
    assert_eq!(session.num_groups(), 1);
    assert_eq!(result.rows.len(), 1);
    assert!(result.rows[0].keys.is_empty());
    assert_eq!(result.rows[0].values, vec![6.0]);
    assert_eq!(result.counters.commands, 3);
}

/// Explode-field-in keeps list order and adds the default child last.
#[test]
fn test_field_in_order_and_default() {
    let engine = engine();
    let mut session = Session::open(&engine, &[dataset("jobs")], EngineConfig::default()).unwrap();
    let commands = vec![
        Command::ExplodeFieldIn {
            field: string_field("query", &["jobs"]),
            terms: vec![Term::from("rn"), Term::from("cook")],
            with_default: true,
        },
        Command::GetGroupStats { metrics: vec![count()] },
    ];
    let result = session.execute(&commands).unwrap();
    let keys: Vec<&GroupKey> = result.rows.iter().map(|r| &r.keys[0]).collect();
    assert_eq!(
        keys,
        vec![
            &GroupKey::Term(Term::from("rn")),
            &GroupKey::Term(Term::from("cook")),
            &GroupKey::Default
        ]
    );
    let values: Vec<f64> = result.rows.iter().map(|r| r.values[0]).collect();
    assert_eq!(values, vec![3.0, 1.0, 2.0]);
}

/// A malformed encoded command list is rejected and closes the session.
#[test]
fn test_malformed_wire_payload_closes_session() {
    let engine = engine();
    let mut session = Session::open(&engine, &[dataset("jobs")], EngineConfig::default()).unwrap();
    let err = session.execute_encoded("{not json").unwrap_err();
    assert_eq!(err.code(), "AGG_EXEC_MALFORMED_COMMAND");
    assert!(session.is_closed());
    assert_eq!(engine.live_sessions(), 0);
}

/// Opening an unknown dataset fails and closes what was already opened.
#[test]
fn test_open_failure_releases_opened_sessions() {
    let engine = engine();
    let result = Session::open(&engine, &[dataset("ads"), dataset("missing")], EngineConfig::default());
    assert!(result.is_err());
    assert_eq!(engine.live_sessions(), 0);
}
