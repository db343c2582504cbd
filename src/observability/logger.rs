//! Structured JSON logger
//!
//! One record per event, rendered as a single JSON object with `event` and
//! `severity` first and the remaining fields sorted by key. Records go
//! through the `log` facade under [`LOG_TARGET`]; the host picks the
//! backend and filtering.

use std::fmt;

/// Target every aggql log record is emitted under
pub const LOG_TARGET: &str = "aggql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-command detail
    Trace = 0,
    Info = 1,
    /// Output was cut or degraded but the query succeeded
    Warn = 2,
    Error = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    pub fn level(&self) -> log::Level {
        match self {
            Severity::Trace => log::Level::Trace,
            Severity::Info => log::Level::Info,
            Severity::Warn => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Logger;

impl Logger {
    /// Emit `event` if the facade has a backend listening at this level
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        let level = severity.level();
        if log::log_enabled!(target: LOG_TARGET, level) {
            log::log!(target: LOG_TARGET, level, "{}", Self::render(severity, event, fields));
        }
    }

    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    /// Render one record. Equal inputs give equal output whatever the
    /// order of `fields`.
    pub fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
        sorted.sort_by_key(|(key, _)| *key);

        let mut parts = Vec::with_capacity(sorted.len() + 2);
        parts.push(format!("\"event\":{}", quote(event)));
        parts.push(format!("\"severity\":\"{}\"", severity));
        parts.extend(
            sorted
                .into_iter()
                .map(|(key, value)| format!("{}:{}", quote(key), quote(value))),
        );
        format!("{{{}}}", parts.join(","))
    }
}

fn quote(text: &str) -> String {
    // a str always serializes; the fallback keeps the record well-formed
    serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_maps_to_log_level() {
        assert!(Severity::Trace < Severity::Warn);
        assert_eq!(Severity::Trace.level(), log::Level::Trace);
        assert_eq!(Severity::Warn.level(), log::Level::Warn);
        assert_eq!(Severity::Error.level(), log::Level::Error);
    }

    #[test]
    fn test_render_is_json_with_event_first() {
        let output = Logger::render(Severity::Warn, "ROW_LIMIT_REACHED", &[("limit", "10")]);
        assert!(output.starts_with("{\"event\":\"ROW_LIMIT_REACHED\",\"severity\":\"WARN\""));
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["limit"], "10");
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a = Logger::render(Severity::Info, "E", &[("zebra", "1"), ("apple", "2")]);
        let b = Logger::render(Severity::Info, "E", &[("apple", "2"), ("zebra", "1")]);
        assert_eq!(a, b);
        assert!(a.find("apple").unwrap() < a.find("zebra").unwrap());
    }

    #[test]
    fn test_values_are_escaped() {
        let output = Logger::render(Severity::Info, "E", &[("regex", "a\"b\\c\nd")]);
        assert!(!output.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["regex"], "a\"b\\c\nd");
    }

    #[test]
    fn test_log_without_backend_is_silent() {
        Logger::log(Severity::Info, "E", &[("k", "v")]);
    }
}
