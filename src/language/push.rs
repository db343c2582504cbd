//! Push programs: per-document metrics as the engine evaluates them
//!
//! A program is a postfix opcode list. Leaf opcodes push one value per
//! document, operator opcodes pop their operands and push the result. The
//! engine keeps the final value of each pushed program as one entry of the
//! dataset's stat stack.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One opcode of a push program
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PushOp {
    // leaves
    Count,
    Constant(i64),
    Field(String),
    HasIntField(String),
    HasStringField(String),
    HasInt { field: String, term: i64 },
    HasString { field: String, term: String },
    Regex { field: String, regex: String },
    Lucene(String),
    Extract { field: String, regex: String, group: u32 },

    // binary
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,

    // unary
    Abs,
    Signum,
    Log(i32),
    Exp(i32),
}

impl PushOp {
    /// Number of stack operands consumed
    pub fn arity(&self) -> usize {
        match self {
            PushOp::Count
            | PushOp::Constant(_)
            | PushOp::Field(_)
            | PushOp::HasIntField(_)
            | PushOp::HasStringField(_)
            | PushOp::HasInt { .. }
            | PushOp::HasString { .. }
            | PushOp::Regex { .. }
            | PushOp::Lucene(_)
            | PushOp::Extract { .. } => 0,
            PushOp::Abs | PushOp::Signum | PushOp::Log(_) | PushOp::Exp(_) => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for PushOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushOp::Count => write!(f, "count()"),
            PushOp::Constant(v) => write!(f, "{}", v),
            PushOp::Field(name) => write!(f, "{}", name),
            PushOp::HasIntField(name) => write!(f, "hasintfield {}", name),
            PushOp::HasStringField(name) => write!(f, "hasstrfield {}", name),
            PushOp::HasInt { field, term } => write!(f, "hasint {}:{}", field, term),
            PushOp::HasString { field, term } => write!(f, "hasstr {}:{}", field, term),
            PushOp::Regex { field, regex } => write!(f, "regex {}:{}", field, regex),
            PushOp::Lucene(query) => write!(f, "lucene \"{}\"", query),
            PushOp::Extract { field, regex, group } => {
                write!(f, "regexmatch {} {} {}", field, group, regex)
            }
            PushOp::Add => write!(f, "+"),
            PushOp::Sub => write!(f, "-"),
            PushOp::Mul => write!(f, "*"),
            PushOp::Div => write!(f, "/"),
            PushOp::Mod => write!(f, "%"),
            PushOp::Min => write!(f, "min()"),
            PushOp::Max => write!(f, "max()"),
            PushOp::Eq => write!(f, "="),
            PushOp::Ne => write!(f, "!="),
            PushOp::Lt => write!(f, "<"),
            PushOp::Lte => write!(f, "<="),
            PushOp::Gt => write!(f, ">"),
            PushOp::Gte => write!(f, ">="),
            PushOp::Abs => write!(f, "abs()"),
            PushOp::Signum => write!(f, "signum()"),
            PushOp::Log(scale) => write!(f, "log {}", scale),
            PushOp::Exp(scale) => write!(f, "exp {}", scale),
        }
    }
}

/// A push program bound to the dataset it runs on
///
/// The unit of push deduplication: equal values are pushed once per session
/// and share one stat-stack slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedPush {
    pub dataset: String,
    pub program: Vec<PushOp>,
}

impl QualifiedPush {
    pub fn new(dataset: impl Into<String>, program: Vec<PushOp>) -> Self {
        Self {
            dataset: dataset.into(),
            program,
        }
    }
}

impl fmt::Display for QualifiedPush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[", self.dataset)?;
        for (i, op) in self.program.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", op)?;
        }
        write!(f, "]")
    }
}
