//! Field and scope resolution
//!
//! Resolution itself belongs to the metadata layer; this module defines the
//! contract (`FieldResolver`) and its output (`FieldSet`), plus a
//! metadata-backed resolver over explicit per-dataset field lists.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::errors::{CompileError, CompileResult};
use super::query::Dataset;

/// A set of dataset names. Ordered so iteration and hashing are deterministic.
pub type Scope = BTreeSet<String>;

/// Build a scope from anything yielding dataset names
pub fn scope_of<I, S>(datasets: I) -> Scope
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    datasets.into_iter().map(Into::into).collect()
}

/// A resolved field: one user-facing name mapped to a physical field per dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldSet {
    name: String,
    is_int: bool,
    dataset_to_field: BTreeMap<String, String>,
}

impl FieldSet {
    pub fn new(name: impl Into<String>, is_int: bool, dataset_to_field: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            is_int,
            dataset_to_field,
        }
    }

    /// Same physical name in every listed dataset
    pub fn uniform<I, S>(name: impl Into<String>, is_int: bool, datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let dataset_to_field = datasets
            .into_iter()
            .map(|d| (d.into(), name.clone()))
            .collect();
        Self::new(name, is_int, dataset_to_field)
    }

    pub fn int(name: impl Into<String>, datasets: &[&str]) -> Self {
        Self::uniform(name, true, datasets.iter().copied())
    }

    pub fn string(name: impl Into<String>, datasets: &[&str]) -> Self {
        Self::uniform(name, false, datasets.iter().copied())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_int(&self) -> bool {
        self.is_int
    }

    pub fn datasets(&self) -> Scope {
        self.dataset_to_field.keys().cloned().collect()
    }

    pub fn contains(&self, dataset: &str) -> bool {
        self.dataset_to_field.contains_key(dataset)
    }

    /// Physical field name in `dataset`
    pub fn physical(&self, dataset: &str) -> CompileResult<&str> {
        self.dataset_to_field
            .get(dataset)
            .map(String::as_str)
            .ok_or_else(|| {
                CompileError::scope(format!(
                    "field '{}' does not exist in dataset '{}'",
                    self.name, dataset
                ))
            })
    }

    /// Same field restricted to the datasets of `scope`
    pub fn restrict(&self, scope: &Scope) -> FieldSet {
        Self {
            name: self.name.clone(),
            is_int: self.is_int,
            dataset_to_field: self
                .dataset_to_field
                .iter()
                .filter(|(d, _)| scope.contains(*d))
                .map(|(d, f)| (d.clone(), f.clone()))
                .collect(),
        }
    }
}

/// Resolves typed field names against a dataset scope
///
/// Implemented by the metadata layer. The compiler only consumes the output.
pub trait FieldResolver {
    fn resolve_field(&self, name: &str, scope: &Scope) -> CompileResult<FieldSet>;
}

/// Field metadata for one dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub int_fields: BTreeSet<String>,
    pub string_fields: BTreeSet<String>,
    /// user-facing alias -> physical field
    pub aliases: BTreeMap<String, String>,
}

impl DatasetSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int(mut self, field: &str) -> Self {
        self.int_fields.insert(field.to_string());
        self
    }

    pub fn with_string(mut self, field: &str) -> Self {
        self.string_fields.insert(field.to_string());
        self
    }

    pub fn with_alias(mut self, alias: &str, field: &str) -> Self {
        self.aliases.insert(alias.to_string(), field.to_string());
        self
    }
}

/// Resolver backed by explicit per-dataset schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaResolver {
    datasets: BTreeMap<String, DatasetSchema>,
}

impl SchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: &str, schema: DatasetSchema) -> Self {
        self.datasets.insert(name.to_string(), schema);
        self
    }

    /// Resolver for the FROM clause of one query: schemas are keyed by the
    /// name each dataset is known by in the query, and the dataset's own
    /// field aliases win over the schema's.
    pub fn for_datasets(&self, datasets: &[Dataset]) -> CompileResult<SchemaResolver> {
        let mut resolver = SchemaResolver::new();
        for dataset in datasets {
            let mut schema = self.datasets.get(&dataset.name).cloned().ok_or_else(|| {
                CompileError::scope(format!("unknown dataset '{}'", dataset.name))
            })?;
            schema.aliases.extend(
                dataset
                    .field_aliases
                    .iter()
                    .map(|(alias, field)| (alias.clone(), field.clone())),
            );
            resolver = resolver.with_dataset(dataset.display_name(), schema);
        }
        Ok(resolver)
    }
}

impl FieldResolver for SchemaResolver {
    fn resolve_field(&self, name: &str, scope: &Scope) -> CompileResult<FieldSet> {
        // "dataset.field" narrows resolution to one dataset
        let (scope, name) = match name.split_once('.') {
            Some((dataset, field)) if scope.contains(dataset) => {
                (scope_of([dataset]), field)
            }
            _ => (scope.clone(), name),
        };

        let mut kinds = BTreeSet::new();
        let mut dataset_to_field = BTreeMap::new();
        for dataset in &scope {
            let schema = self.datasets.get(dataset).ok_or_else(|| {
                CompileError::scope(format!("unknown dataset '{}'", dataset))
            })?;
            let physical = schema.aliases.get(name).map(String::as_str).unwrap_or(name);
            let is_int = schema.int_fields.contains(physical);
            let is_string = schema.string_fields.contains(physical);
            if is_int && is_string {
                return Err(CompileError::ambiguity(format!(
                    "field '{}' is both int and string in dataset '{}'",
                    name, dataset
                )));
            }
            if is_int || is_string {
                kinds.insert(is_int);
                dataset_to_field.insert(dataset.clone(), physical.to_string());
            }
        }

        if dataset_to_field.is_empty() {
            return Err(CompileError::scope(format!(
                "field '{}' does not exist in any of {:?}",
                name, scope
            )));
        }
        if kinds.len() > 1 {
            return Err(CompileError::ambiguity(format!(
                "field '{}' is int in some datasets and string in others",
                name
            )));
        }
        let is_int = kinds.contains(&true);
        Ok(FieldSet::new(name, is_int, dataset_to_field))
    }
}
