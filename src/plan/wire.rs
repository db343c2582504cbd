//! Command wire format
//!
//! JSON with externally tagged enums: every node is an object keyed by its
//! variant name, so Term, DocMetric and AggregateMetric trees come back
//! exactly as they went in. Floats use the round-trip parser.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::command::Command;
use super::errors::{WireError, WireResult};
use crate::actions::Action;

fn encode<T: Serialize + ?Sized>(value: &T) -> WireResult<String> {
    serde_json::to_string(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(text: &str) -> WireResult<T> {
    serde_json::from_str(text).map_err(|e| WireError::Decode(e.to_string()))
}

pub fn encode_commands(commands: &[Command]) -> WireResult<String> {
    encode(commands)
}

pub fn decode_commands(text: &str) -> WireResult<Vec<Command>> {
    decode(text)
}

pub fn encode_actions(actions: &[Action]) -> WireResult<String> {
    encode(actions)
}

pub fn decode_actions(text: &str) -> WireResult<Vec<Action>> {
    decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{AggregateMetric, DocMetric, FieldSet};
    use crate::plan::MergeType;

    #[test]
    fn test_command_kind_is_tagged() {
        let text = encode_commands(&[Command::RegroupIntoParent {
            merge: MergeType::SumAll,
        }])
        .unwrap();
        assert!(text.contains("RegroupIntoParent"));
        assert!(text.contains("SumAll"));
    }

    #[test]
    fn test_metric_tree_survives() {
        let metric = AggregateMetric::divide(
            AggregateMetric::doc_stats(DocMetric::Field(FieldSet::int("oji", &["ds"]))),
            AggregateMetric::Constant(0.1),
        );
        let commands = vec![Command::GetGroupStats {
            metrics: vec![metric],
        }];
        let decoded = decode_commands(&encode_commands(&commands).unwrap()).unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode_commands("{\"NoSuchCommand\":{}}").unwrap_err();
        assert_eq!(err.code(), "AGG_WIRE_DECODE");
        assert!(decode_commands("not json").is_err());
    }
}
