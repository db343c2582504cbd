//! Query values and their builder
//!
//! A `Query` is immutable once built. Compiler passes consume one and
//! produce another rather than editing in place.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::AggregateMetric;
use super::doc_filter::DocFilter;
use super::doc_metric::DocMetric;
use super::errors::{CompileError, CompileResult};
use super::field::{FieldSet, Scope};
use super::group_by::GroupBy;

/// One dataset of the FROM clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub alias: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// user-facing field name -> physical field name
    pub field_aliases: BTreeMap<String, String>,
    /// Filter applied to this dataset only, before anything else
    pub filter: Option<DocFilter>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            start,
            end,
            field_aliases: BTreeMap::new(),
            filter: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_filter(mut self, filter: DocFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_field_alias(mut self, alias: &str, field: &str) -> Self {
        self.field_aliases.insert(alias.to_string(), field.to_string());
        self
    }

    /// The name this dataset is known by inside the query
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A group-by clause with its optional HAVING filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByEntry {
    pub group_by: GroupBy,
    pub filter: Option<AggregateFilter>,
    pub alias: Option<String>,
}

impl GroupByEntry {
    pub fn new(group_by: GroupBy) -> Self {
        Self {
            group_by,
            filter: None,
            alias: None,
        }
    }

    pub fn having(mut self, filter: AggregateFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub datasets: Vec<Dataset>,
    pub filter: Option<DocFilter>,
    pub group_bys: Vec<GroupByEntry>,
    pub selects: Vec<AggregateMetric>,
    pub row_limit: Option<usize>,
    /// Fields to sample terms from, with the number of terms kept per group
    pub sample_fields: Vec<(FieldSet, usize)>,
}

impl Query {
    /// Names of every dataset in the query
    pub fn scope(&self) -> Scope {
        self.datasets
            .iter()
            .map(|d| d.display_name().to_string())
            .collect()
    }

    /// Earliest start and latest end across datasets
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.datasets.iter().map(|d| d.start).min()?;
        let end = self.datasets.iter().map(|d| d.end).max()?;
        Some((start, end))
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.display_name() == name)
    }
}

/// Collects clauses and validates their shape on `build`
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    datasets: Vec<Dataset>,
    filters: Vec<DocFilter>,
    group_bys: Vec<GroupByEntry>,
    selects: Option<Vec<AggregateMetric>>,
    select_clauses: usize,
    row_limit: Option<usize>,
    sample_fields: Vec<(FieldSet, usize)>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, dataset: Dataset) -> Self {
        self.datasets.push(dataset);
        self
    }

    /// Adds a WHERE condition. Several calls are AND-ed.
    pub fn filter(mut self, filter: DocFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.group_bys.push(GroupByEntry::new(group_by));
        self
    }

    pub fn group_by_entry(mut self, entry: GroupByEntry) -> Self {
        self.group_bys.push(entry);
        self
    }

    pub fn select(mut self, metrics: Vec<AggregateMetric>) -> Self {
        self.select_clauses += 1;
        self.selects = Some(metrics);
        self
    }

    pub fn limit(mut self, row_limit: usize) -> Self {
        self.row_limit = Some(row_limit);
        self
    }

    pub fn sample_field(mut self, field: FieldSet, count: usize) -> Self {
        self.sample_fields.push((field, count));
        self
    }

    pub fn build(self) -> CompileResult<Query> {
        if self.datasets.is_empty() {
            return Err(CompileError::structural("query has no datasets"));
        }
        if self.select_clauses > 1 {
            return Err(CompileError::structural(format!(
                "query has {} SELECT clauses, at most one is allowed",
                self.select_clauses
            )));
        }

        let mut names = BTreeSet::new();
        for dataset in &self.datasets {
            if !names.insert(dataset.display_name().to_string()) {
                return Err(CompileError::ambiguity(format!(
                    "dataset name '{}' is used more than once",
                    dataset.display_name()
                )));
            }
        }

        // the default selection is the document count
        let selects = self
            .selects
            .unwrap_or_else(|| vec![AggregateMetric::doc_stats(DocMetric::Count)]);
        let mut aliases = BTreeSet::new();
        for select in &selects {
            if let AggregateMetric::Named { name, .. } = select {
                if !aliases.insert(name.clone()) {
                    return Err(CompileError::structural(format!(
                        "metric name '{}' is defined more than once",
                        name
                    )));
                }
            }
        }

        let filter = if self.filters.is_empty() {
            None
        } else {
            Some(DocFilter::and_all(self.filters))
        };

        Ok(Query {
            datasets: self.datasets,
            filter,
            group_bys: self.group_bys,
            selects,
            row_limit: self.row_limit,
            sample_fields: self.sample_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jobsearch() -> Dataset {
        Dataset::new(
            "jobsearch",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    fn count() -> AggregateMetric {
        AggregateMetric::doc_stats(DocMetric::Count)
    }

    #[test]
    fn test_default_select_is_count() {
        let query = QueryBuilder::new().from(jobsearch()).build().unwrap();
        assert_eq!(query.selects, vec![count()]);
        assert!(query.filter.is_none());
    }

    #[test]
    fn test_two_select_clauses_rejected() {
        let err = QueryBuilder::new()
            .from(jobsearch())
            .select(vec![count()])
            .select(vec![count()])
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::Structural(_)));
    }

    #[test]
    fn test_duplicate_named_metric_rejected() {
        let err = QueryBuilder::new()
            .from(jobsearch())
            .select(vec![
                AggregateMetric::named("c", count()),
                AggregateMetric::named("c", count()),
            ])
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::Structural(_)));
    }

    #[test]
    fn test_duplicate_dataset_alias_rejected() {
        let err = QueryBuilder::new()
            .from(jobsearch())
            .from(jobsearch())
            .build()
            .unwrap_err();
        assert!(matches!(err, CompileError::Ambiguity(_)));

        let ok = QueryBuilder::new()
            .from(jobsearch())
            .from(jobsearch().with_alias("js2"))
            .build()
            .unwrap();
        assert_eq!(ok.scope().len(), 2);
    }

    #[test]
    fn test_filters_are_anded() {
        let country = FieldSet::string("country", &["jobsearch"]);
        let query = QueryBuilder::new()
            .from(jobsearch())
            .filter(DocFilter::field_is(country.clone(), "us"))
            .filter(DocFilter::field_is(country, "gb"))
            .build()
            .unwrap();
        assert!(matches!(query.filter, Some(DocFilter::And(_, _))));
    }

    #[test]
    fn test_time_range_spans_datasets() {
        let later = Dataset::new(
            "mobsearch",
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(),
        );
        let query = QueryBuilder::new().from(jobsearch()).from(later).build().unwrap();
        let (start, end) = query.time_range().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
    }
}
