//! Terms: the values a field can take

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single field value
///
/// Ordering is by kind first (int terms sort before string terms), then by
/// value, which is also the order sorted FTGS iteration yields them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    Int(i64),
    Str(String),
}

impl Term {
    pub fn is_int(&self) -> bool {
        matches!(self, Term::Int(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            Term::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Int(_) => None,
            Term::Str(s) => Some(s),
        }
    }

    /// Text form used for regex matching and labels
    pub fn to_text(&self) -> String {
        match self {
            Term::Int(v) => v.to_string(),
            Term::Str(s) => s.clone(),
        }
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Int(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Str(value.to_string())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::Str(value)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{}", v),
            Term::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}
