//! Lifecycle events of compilation and execution
//!
//! Events are explicit and typed.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Engine configuration loaded
    ConfigLoaded,

    // Compilation
    /// Query compilation begins
    QueryCompileBegin,
    /// Query compiled into commands
    QueryCompiled,
    /// Query rejected at compile time
    QueryRejected,

    // Session
    /// Dataset sessions opened
    SessionOpened,
    /// Dataset sessions released
    SessionClosed,

    // Commands
    /// A command starts executing
    CommandBegin,
    /// A command finished executing
    CommandComplete,
    /// A new grouping level was built or undone
    RegroupComplete,
    /// Groups dropped by a HAVING filter
    GroupsFiltered,
    /// A precomputed lookup was saved
    PrecomputedStored,
    /// The row-limit safety valve cut accumulation short
    RowLimitReached,
    /// A stat could not be popped while unwinding a failed push
    StatReleaseFailed,

    // Query
    /// Query produced its result
    QueryExecuted,
    /// Execution aborted
    ExecutionFailed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::QueryCompileBegin => "QUERY_COMPILE_BEGIN",
            Event::QueryCompiled => "QUERY_COMPILED",
            Event::QueryRejected => "QUERY_REJECTED",

            Event::SessionOpened => "SESSION_OPENED",
            Event::SessionClosed => "SESSION_CLOSED",

            Event::CommandBegin => "COMMAND_BEGIN",
            Event::CommandComplete => "COMMAND_COMPLETE",
            Event::RegroupComplete => "REGROUP_COMPLETE",
            Event::GroupsFiltered => "GROUPS_FILTERED",
            Event::PrecomputedStored => "PRECOMPUTED_STORED",
            Event::RowLimitReached => "ROW_LIMIT_REACHED",
            Event::StatReleaseFailed => "STAT_RELEASE_FAILED",

            Event::QueryExecuted => "QUERY_EXECUTED",
            Event::ExecutionFailed => "EXECUTION_FAILED",
        }
    }

    /// Returns true if this event reports a failure
    pub fn is_error(&self) -> bool {
        matches!(self, Event::QueryRejected | Event::ExecutionFailed)
    }

    /// Degraded but not failed
    pub fn is_warning(&self) -> bool {
        matches!(self, Event::RowLimitReached | Event::StatReleaseFailed)
    }

    /// Per-command chatter is logged at trace level
    pub fn is_verbose(&self) -> bool {
        matches!(
            self,
            Event::CommandBegin | Event::CommandComplete | Event::RegroupComplete
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Event; 15] = [
        Event::ConfigLoaded,
        Event::QueryCompileBegin,
        Event::QueryCompiled,
        Event::QueryRejected,
        Event::SessionOpened,
        Event::SessionClosed,
        Event::CommandBegin,
        Event::CommandComplete,
        Event::RegroupComplete,
        Event::GroupsFiltered,
        Event::PrecomputedStored,
        Event::RowLimitReached,
        Event::StatReleaseFailed,
        Event::QueryExecuted,
        Event::ExecutionFailed,
    ];

    #[test]
    fn test_all_events_have_string_representation() {
        for event in ALL {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_error_events() {
        assert!(Event::QueryRejected.is_error());
        assert!(Event::ExecutionFailed.is_error());
        assert!(!Event::QueryCompiled.is_error());
        assert!(!Event::RowLimitReached.is_error());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::PrecomputedStored), "PRECOMPUTED_STORED");
    }
}
