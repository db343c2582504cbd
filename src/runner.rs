//! End-to-end query running
//!
//! `QueryRunner` ties the pipeline together: stage and plan a query, lower
//! it to commands, open a session on the engine and execute.

use std::sync::Arc;

use thiserror::Error;

use crate::config::EngineConfig;
use crate::execution::{Engine, ExecutionError, QueryResult, Session};
use crate::language::{CompileError, Query};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, ObservationScope, Timer};
use crate::plan::{lower, Command, ExplainPlan, LowerOptions, QueryPlan, QueryPlanner, WireError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Compile(e) => e.code(),
            Error::Execution(e) => e.code(),
            Error::Wire(e) => e.code(),
        }
    }
}

/// A compiled query: its plan and the commands that execute it
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub commands: Vec<Command>,
}

pub struct QueryRunner<E> {
    config: EngineConfig,
    engine: E,
    metrics: Arc<MetricsRegistry>,
}

impl<E: Engine> QueryRunner<E> {
    pub fn new(engine: E, config: EngineConfig) -> Self {
        Self {
            config,
            engine,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Stage, plan and lower `query`
    pub fn compile(&self, query: Query) -> Result<CompiledQuery> {
        let datasets = query.scope().into_iter().collect::<Vec<_>>().join(",");
        log_event_with_fields(Event::QueryCompileBegin, &[("datasets", &datasets)]);
        let compiled = QueryPlanner::new()
            .with_coalescing(self.config.coalesce_actions)
            .plan(query)
            .and_then(|plan| {
                let options = LowerOptions {
                    optimize_last_iterate: self.config.optimize_last_iterate,
                };
                let commands = lower(&plan, options)?;
                Ok(CompiledQuery { plan, commands })
            });
        match compiled {
            Ok(compiled) => {
                self.metrics.increment_queries_compiled();
                log_event_with_fields(
                    Event::QueryCompiled,
                    &[
                        ("steps", &compiled.plan.steps.len().to_string()),
                        ("commands", &compiled.commands.len().to_string()),
                    ],
                );
                Ok(compiled)
            }
            Err(err) => {
                self.metrics.increment_queries_rejected();
                log_event_with_fields(Event::QueryRejected, &[("code", err.code()), ("reason", err.message())]);
                Err(err.into())
            }
        }
    }

    /// Compile and execute `query`
    pub fn run(&self, query: Query) -> Result<QueryResult> {
        let row_limit = query.row_limit;
        let datasets = query.datasets.clone();
        let compiled = self.compile(query)?;

        let timer = Timer::new();
        let scope = ObservationScope::new("QUERY");
        let outcome = Session::open(&self.engine, &datasets, self.config.clone())
            .map(|session| session.with_metrics(Arc::clone(&self.metrics)))
            .and_then(|mut session| {
                let result = session.execute(&compiled.commands);
                session.close();
                result
            });
        match outcome {
            Ok(mut result) => {
                if let Some(limit) = row_limit {
                    result.limit(limit);
                }
                self.metrics.increment_queries_executed();
                scope.complete_with_fields(&[("rows", &result.len().to_string())]);
                log_event_with_fields(
                    Event::QueryExecuted,
                    &[
                        ("rows", &result.len().to_string()),
                        ("truncated", if result.truncated { "true" } else { "false" }),
                        ("elapsed_ms", &timer.elapsed_ms()),
                    ],
                );
                Ok(result)
            }
            Err(err) => {
                self.metrics.increment_queries_failed();
                scope.fail(err.code());
                Err(err.into())
            }
        }
    }

    /// Describe how `query` would run, or why it is rejected
    pub fn explain(&self, query: Query) -> ExplainPlan {
        match self.compile(query) {
            Ok(compiled) => ExplainPlan::from_plan(&compiled.plan, &compiled.commands),
            Err(Error::Compile(err)) => ExplainPlan::from_error(&err),
            Err(other) => ExplainPlan::from_error(&CompileError::structural(other.to_string())),
        }
    }
}
