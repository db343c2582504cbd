//! Push-program and regroup-condition evaluation
//!
//! Programs run on a value stack, one document at a time. Division and
//! modulo by zero yield 0. Logical opcodes push 0 or 1.

use regex::Regex;
use sha2::{Digest, Sha256};

use super::document::Document;
use crate::actions::{BooleanOp, StoreQuery};
use crate::execution::{Condition, EngineError, EngineResult};
use crate::language::PushOp;

fn anchored(pattern: &str) -> EngineResult<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| EngineError::Failed(format!("invalid regex '{}': {}", pattern, e)))
}

#[derive(Debug)]
enum Op {
    Plain(PushOp),
    Regex { field: String, regex: Regex },
    Extract { field: String, regex: Regex, group: usize },
}

/// A push program with its regexes compiled
#[derive(Debug)]
pub struct Program {
    ops: Vec<Op>,
}

impl Program {
    pub fn compile(program: &[PushOp]) -> EngineResult<Self> {
        let mut ops = Vec::with_capacity(program.len());
        let mut depth = 0usize;
        for op in program {
            let arity = op.arity();
            if depth < arity {
                return Err(EngineError::Failed(format!("stack underflow at '{}'", op)));
            }
            depth = depth - arity + 1;
            ops.push(match op {
                PushOp::Regex { field, regex } => Op::Regex {
                    field: field.clone(),
                    regex: anchored(regex)?,
                },
                PushOp::Extract { field, regex, group } => Op::Extract {
                    field: field.clone(),
                    regex: Regex::new(regex)
                        .map_err(|e| EngineError::Failed(format!("invalid regex '{}': {}", regex, e)))?,
                    group: *group as usize,
                },
                PushOp::Lucene(query) => {
                    return Err(EngineError::Failed(format!(
                        "lucene query '{}' is not supported",
                        query
                    )))
                }
                other => Op::Plain(other.clone()),
            });
        }
        if depth != 1 {
            return Err(EngineError::Failed(format!(
                "program leaves {} values on the stack",
                depth
            )));
        }
        Ok(Self { ops })
    }

    pub fn eval(&self, doc: &Document) -> i64 {
        let mut stack: Vec<i64> = Vec::with_capacity(4);
        for op in &self.ops {
            let value = match op {
                Op::Regex { field, regex } => {
                    i64::from(doc.term_texts(field).iter().any(|t| regex.is_match(t)))
                }
                Op::Extract { field, regex, group } => doc
                    .term_texts(field)
                    .iter()
                    .find_map(|t| {
                        regex
                            .captures(t)
                            .and_then(|c| c.get(*group))
                            .and_then(|m| m.as_str().parse::<i64>().ok())
                    })
                    .unwrap_or(0),
                Op::Plain(op) => match op.arity() {
                    0 => leaf(op, doc),
                    1 => {
                        let v = stack.pop().unwrap_or(0);
                        unary(op, v)
                    }
                    _ => {
                        let b = stack.pop().unwrap_or(0);
                        let a = stack.pop().unwrap_or(0);
                        binary(op, a, b)
                    }
                },
            };
            stack.push(value);
        }
        stack.pop().unwrap_or(0)
    }
}

fn leaf(op: &PushOp, doc: &Document) -> i64 {
    match op {
        PushOp::Count => 1,
        PushOp::Constant(v) => *v,
        PushOp::Field(field) => doc.int_values(field).first().copied().unwrap_or(0),
        PushOp::HasIntField(field) => i64::from(!doc.int_values(field).is_empty()),
        PushOp::HasStringField(field) => i64::from(!doc.string_values(field).is_empty()),
        PushOp::HasInt { field, term } => i64::from(doc.int_values(field).contains(term)),
        PushOp::HasString { field, term } => {
            i64::from(doc.string_values(field).iter().any(|s| s == term))
        }
        _ => 0,
    }
}

fn unary(op: &PushOp, v: i64) -> i64 {
    match op {
        PushOp::Abs => v.wrapping_abs(),
        PushOp::Signum => v.signum(),
        PushOp::Log(scale) => {
            if v > 0 {
                ((v as f64).ln() * f64::from(*scale)) as i64
            } else {
                0
            }
        }
        PushOp::Exp(scale) => {
            let scale = f64::from(*scale);
            if scale == 0.0 {
                0
            } else {
                ((v as f64 / scale).exp() * scale) as i64
            }
        }
        _ => v,
    }
}

fn binary(op: &PushOp, a: i64, b: i64) -> i64 {
    match op {
        PushOp::Add => a.wrapping_add(b),
        PushOp::Sub => a.wrapping_sub(b),
        PushOp::Mul => a.wrapping_mul(b),
        PushOp::Div => a.checked_div(b).unwrap_or(0),
        PushOp::Mod => a.checked_rem(b).unwrap_or(0),
        PushOp::Min => a.min(b),
        PushOp::Max => a.max(b),
        PushOp::Eq => i64::from(a == b),
        PushOp::Ne => i64::from(a != b),
        PushOp::Lt => i64::from(a < b),
        PushOp::Lte => i64::from(a <= b),
        PushOp::Gt => i64::from(a > b),
        PushOp::Gte => i64::from(a >= b),
        _ => 0,
    }
}

/// Whether `text` survives sampling at `probability` under `seed`
pub fn sampled(seed: &str, text: &str, probability: f64) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let fraction = u64::from_be_bytes(head) as f64 / u64::MAX as f64;
    fraction < probability
}

/// A regroup condition ready to test documents
#[derive(Debug)]
pub enum Matcher {
    Query(StoreQuery),
    Term(Condition),
    Regex { field: String, regex: Regex },
    StatRange { stat: usize, min: i64, max: i64 },
    Random { field: String, probability: f64, seed: String },
    Always,
}

impl Matcher {
    pub fn compile(condition: &Condition, num_stats: usize) -> EngineResult<Self> {
        Ok(match condition {
            Condition::Query(query) => {
                check_query(query)?;
                Matcher::Query(query.clone())
            }
            Condition::Term { .. } | Condition::IntIn { .. } | Condition::StringIn { .. } => {
                Matcher::Term(condition.clone())
            }
            Condition::Regex { field, regex } => Matcher::Regex {
                field: field.clone(),
                regex: anchored(regex)?,
            },
            Condition::StatRange { stat, min, max } => {
                if *stat >= num_stats {
                    return Err(EngineError::Failed(format!(
                        "stat {} out of range, {} pushed",
                        stat, num_stats
                    )));
                }
                Matcher::StatRange {
                    stat: *stat,
                    min: *min,
                    max: *max,
                }
            }
            Condition::Random {
                field,
                probability,
                seed,
            } => Matcher::Random {
                field: field.clone(),
                probability: *probability,
                seed: seed.clone(),
            },
            Condition::Always => Matcher::Always,
        })
    }

    /// `stats` holds the pushed values of this document
    pub fn matches(&self, doc: &Document, stats: &[i64]) -> bool {
        match self {
            Matcher::Query(query) => query_matches(query, doc),
            Matcher::Term(Condition::Term { field, term }) => doc.has_term(field, term),
            Matcher::Term(Condition::IntIn { field, terms }) => {
                doc.int_values(field).iter().any(|v| terms.contains(v))
            }
            Matcher::Term(Condition::StringIn { field, terms }) => {
                doc.string_values(field).iter().any(|s| terms.contains(s))
            }
            Matcher::Term(_) => false,
            Matcher::Regex { field, regex } => doc.term_texts(field).iter().any(|t| regex.is_match(t)),
            Matcher::StatRange { stat, min, max } => {
                stats.get(*stat).map_or(false, |v| *min <= *v && *v <= *max)
            }
            Matcher::Random {
                field,
                probability,
                seed,
            } => doc
                .term_texts(field)
                .iter()
                .any(|t| sampled(seed, t, *probability)),
            Matcher::Always => true,
        }
    }
}

fn check_query(query: &StoreQuery) -> EngineResult<()> {
    match query {
        StoreQuery::Lucene(text) => Err(EngineError::Failed(format!(
            "lucene query '{}' is not supported",
            text
        ))),
        StoreQuery::Boolean { operands, .. } => operands.iter().try_for_each(check_query),
        _ => Ok(()),
    }
}

fn query_matches(query: &StoreQuery, doc: &Document) -> bool {
    match query {
        StoreQuery::Term { field, term } => doc.has_term(field, term),
        StoreQuery::Range {
            field,
            start,
            end,
            end_inclusive,
        } => doc
            .int_values(field)
            .iter()
            .any(|v| *start <= *v && (*v < *end || (*end_inclusive && *v == *end))),
        StoreQuery::Boolean { op, operands } => match op {
            BooleanOp::And => operands.iter().all(|q| query_matches(q, doc)),
            BooleanOp::Or => operands.iter().any(|q| query_matches(q, doc)),
            BooleanOp::Not => !operands.iter().any(|q| query_matches(q, doc)),
        },
        StoreQuery::Lucene(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Term;

    fn run(program: Vec<PushOp>, doc: &Document) -> i64 {
        Program::compile(&program).unwrap().eval(doc)
    }

    #[test]
    fn test_arithmetic() {
        let doc = Document::at(0).int("x", 7);
        assert_eq!(
            run(vec![PushOp::Field("x".into()), PushOp::Constant(2), PushOp::Mul], &doc),
            14
        );
        assert_eq!(run(vec![PushOp::Constant(5), PushOp::Constant(0), PushOp::Div], &doc), 0);
        assert_eq!(run(vec![PushOp::Constant(5), PushOp::Constant(0), PushOp::Mod], &doc), 0);
        assert_eq!(run(vec![PushOp::Field("missing".into())], &doc), 0);
    }

    #[test]
    fn test_log_scales() {
        let doc = Document::at(0);
        assert_eq!(run(vec![PushOp::Constant(100), PushOp::Log(1000)], &doc), 4605);
        assert_eq!(run(vec![PushOp::Constant(0), PushOp::Log(1000)], &doc), 0);
    }

    #[test]
    fn test_regex_and_extract() {
        let doc = Document::at(0).string("q", "job-42");
        let regex = vec![PushOp::Regex {
            field: "q".into(),
            regex: "job-\\d+".into(),
        }];
        assert_eq!(run(regex, &doc), 1);
        let partial = vec![PushOp::Regex {
            field: "q".into(),
            regex: "job".into(),
        }];
        assert_eq!(run(partial, &doc), 0);
        let extract = vec![PushOp::Extract {
            field: "q".into(),
            regex: "job-(\\d+)".into(),
            group: 1,
        }];
        assert_eq!(run(extract, &doc), 42);
    }

    #[test]
    fn test_malformed_programs_fail() {
        assert!(Program::compile(&[PushOp::Add]).is_err());
        assert!(Program::compile(&[PushOp::Count, PushOp::Count]).is_err());
        assert!(Program::compile(&[PushOp::Lucene("a:b".into())]).is_err());
    }

    #[test]
    fn test_store_queries() {
        let doc = Document::at(0).int("x", 5).string("s", "a");
        let range = StoreQuery::Range {
            field: "x".into(),
            start: 0,
            end: 5,
            end_inclusive: false,
        };
        assert!(!query_matches(&range, &doc));
        let inclusive = StoreQuery::Range {
            field: "x".into(),
            start: 0,
            end: 5,
            end_inclusive: true,
        };
        assert!(query_matches(&inclusive, &doc));
        let not = StoreQuery::boolean(
            BooleanOp::Not,
            vec![StoreQuery::Term {
                field: "s".into(),
                term: Term::from("a"),
            }],
        );
        assert!(!query_matches(&not, &doc));
    }

    #[test]
    fn test_sampling_is_deterministic() {
        assert_eq!(sampled("seed", "a", 0.5), sampled("seed", "a", 0.5));
        assert!(!sampled("seed", "a", 0.0));
        assert!(sampled("seed", "a", 1.0));
    }
}
