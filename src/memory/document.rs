//! Documents held by the in-memory engine

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::language::{Term, DEFAULT_TIME_FIELD};

/// A document: a timestamp plus multi-valued int and string fields
///
/// The timestamp is also readable as the int field `unixtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub timestamp: i64,
    pub ints: BTreeMap<String, Vec<i64>>,
    pub strings: BTreeMap<String, Vec<String>>,
}

impl Document {
    /// A document at `timestamp` (seconds since the epoch)
    pub fn at(timestamp: i64) -> Self {
        let mut ints = BTreeMap::new();
        ints.insert(DEFAULT_TIME_FIELD.to_string(), vec![timestamp]);
        Self {
            timestamp,
            ints,
            strings: BTreeMap::new(),
        }
    }

    pub fn int(mut self, field: impl Into<String>, value: i64) -> Self {
        self.ints.entry(field.into()).or_default().push(value);
        self
    }

    pub fn string(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.entry(field.into()).or_default().push(value.into());
        self
    }

    pub fn int_values(&self, field: &str) -> &[i64] {
        self.ints.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn string_values(&self, field: &str) -> &[String] {
        self.strings.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Terms of `field` as the engine iterates them
    pub fn terms(&self, field: &str, is_int: bool) -> Vec<Term> {
        if is_int {
            self.int_values(field).iter().map(|v| Term::Int(*v)).collect()
        } else {
            self.string_values(field)
                .iter()
                .map(|s| Term::Str(s.clone()))
                .collect()
        }
    }

    /// Every term of `field` as text, int values first
    pub fn term_texts(&self, field: &str) -> Vec<String> {
        let mut out: Vec<String> = self.int_values(field).iter().map(|v| v.to_string()).collect();
        out.extend(self.string_values(field).iter().cloned());
        out
    }

    pub fn has_term(&self, field: &str, term: &Term) -> bool {
        match term {
            Term::Int(v) => self.int_values(field).contains(v),
            Term::Str(s) => self.string_values(field).iter().any(|x| x == s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_an_int_field() {
        let doc = Document::at(100).int("x", 3).string("s", "a");
        assert_eq!(doc.int_values("unixtime"), &[100]);
        assert!(doc.has_term("x", &Term::Int(3)));
        assert!(doc.has_term("s", &Term::from("a")));
        assert!(!doc.has_term("s", &Term::from("b")));
        assert_eq!(doc.term_texts("x"), vec!["3"]);
    }
}
