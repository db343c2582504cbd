//! Per-document metrics

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::doc_filter::DocFilter;
use super::errors::{CompileError, CompileResult};
use super::field::{FieldSet, Scope};
use super::push::PushOp;
use super::transform::{transform_box, transform_vec, Rewriter};

/// Arithmetic operators over two document metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Min,
    Max,
}

impl ArithOp {
    fn push_op(self) -> PushOp {
        match self {
            ArithOp::Subtract => PushOp::Sub,
            ArithOp::Multiply => PushOp::Mul,
            ArithOp::Divide => PushOp::Div,
            ArithOp::Modulus => PushOp::Mod,
            ArithOp::Min => PushOp::Min,
            ArithOp::Max => PushOp::Max,
        }
    }
}

/// Comparison operators, shared by document metrics, document filters and
/// aggregate filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn push_op(self) -> PushOp {
        match self {
            CompareOp::Eq => PushOp::Eq,
            CompareOp::Ne => PushOp::Ne,
            CompareOp::Lt => PushOp::Lt,
            CompareOp::Lte => PushOp::Lte,
            CompareOp::Gt => PushOp::Gt,
            CompareOp::Gte => PushOp::Gte,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }

    pub fn negate(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Gte,
            CompareOp::Lte => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Lte,
            CompareOp::Gte => CompareOp::Lt,
        }
    }

    pub fn holds<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
        }
    }
}

/// A metric evaluated once per document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocMetric {
    Count,
    Field(FieldSet),
    Constant(i64),
    Negate(Box<DocMetric>),
    Abs(Box<DocMetric>),
    Signum(Box<DocMetric>),
    Log { metric: Box<DocMetric>, scale: i32 },
    Exponentiate { metric: Box<DocMetric>, scale: i32 },
    Add(Vec<DocMetric>),
    Arith { op: ArithOp, left: Box<DocMetric>, right: Box<DocMetric> },
    /// 1 when the comparison holds, 0 otherwise
    Compare { op: CompareOp, left: Box<DocMetric>, right: Box<DocMetric> },
    HasIntField(FieldSet),
    HasStringField(FieldSet),
    HasInt { field: FieldSet, term: i64 },
    HasString { field: FieldSet, term: String },
    IfThenElse {
        condition: Box<DocFilter>,
        then: Box<DocMetric>,
        otherwise: Box<DocMetric>,
    },
    Qualified { dataset: String, metric: Box<DocMetric> },
    PerDataset(BTreeMap<String, DocMetric>),
    Regex { field: FieldSet, regex: String },
    Lucene(String),
    Extract { field: FieldSet, regex: String, group: u32 },
}

impl DocMetric {
    pub fn field(field: FieldSet) -> Self {
        DocMetric::Field(field)
    }

    pub fn arith(op: ArithOp, left: DocMetric, right: DocMetric) -> Self {
        DocMetric::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: CompareOp, left: DocMetric, right: DocMetric) -> Self {
        DocMetric::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn subtract(left: DocMetric, right: DocMetric) -> Self {
        Self::arith(ArithOp::Subtract, left, right)
    }

    pub fn multiply(left: DocMetric, right: DocMetric) -> Self {
        Self::arith(ArithOp::Multiply, left, right)
    }

    pub fn qualified(dataset: impl Into<String>, metric: DocMetric) -> Self {
        DocMetric::Qualified {
            dataset: dataset.into(),
            metric: Box::new(metric),
        }
    }

    /// Sum of `metrics`, flattening nested sums and folding constants.
    /// `count()` is 1 for every document, so it folds like a constant.
    pub fn add(metrics: Vec<DocMetric>) -> Self {
        let mut flat = Vec::with_capacity(metrics.len());
        let mut constant = 0i64;
        for metric in metrics {
            match metric {
                DocMetric::Add(inner) => {
                    for m in inner {
                        match m {
                            DocMetric::Constant(v) => constant += v,
                            DocMetric::Count => constant += 1,
                            other => flat.push(other),
                        }
                    }
                }
                DocMetric::Constant(v) => constant += v,
                DocMetric::Count => constant += 1,
                other => flat.push(other),
            }
        }
        if constant != 0 {
            flat.push(DocMetric::Constant(constant));
        }
        match flat.len() {
            0 => DocMetric::Constant(0),
            1 => flat.remove(0),
            _ => DocMetric::Add(flat),
        }
    }

    /// Full bottom-up rewrite
    pub fn transform(self, r: &mut dyn Rewriter) -> CompileResult<DocMetric> {
        let rebuilt = match self {
            leaf @ (DocMetric::Count
            | DocMetric::Field(_)
            | DocMetric::Constant(_)
            | DocMetric::HasIntField(_)
            | DocMetric::HasStringField(_)
            | DocMetric::HasInt { .. }
            | DocMetric::HasString { .. }
            | DocMetric::Regex { .. }
            | DocMetric::Lucene(_)
            | DocMetric::Extract { .. }) => leaf,
            DocMetric::Negate(m) => DocMetric::Negate(transform_box(m, |m| m.transform(r))?),
            DocMetric::Abs(m) => DocMetric::Abs(transform_box(m, |m| m.transform(r))?),
            DocMetric::Signum(m) => DocMetric::Signum(transform_box(m, |m| m.transform(r))?),
            DocMetric::Log { metric, scale } => DocMetric::Log {
                metric: transform_box(metric, |m| m.transform(r))?,
                scale,
            },
            DocMetric::Exponentiate { metric, scale } => DocMetric::Exponentiate {
                metric: transform_box(metric, |m| m.transform(r))?,
                scale,
            },
            DocMetric::Add(metrics) => DocMetric::add(transform_vec(metrics, |m| m.transform(r))?),
            DocMetric::Arith { op, left, right } => DocMetric::Arith {
                op,
                left: transform_box(left, |m| m.transform(r))?,
                right: transform_box(right, |m| m.transform(r))?,
            },
            DocMetric::Compare { op, left, right } => DocMetric::Compare {
                op,
                left: transform_box(left, |m| m.transform(r))?,
                right: transform_box(right, |m| m.transform(r))?,
            },
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => DocMetric::IfThenElse {
                condition: transform_box(condition, |f| f.transform(r))?,
                then: transform_box(then, |m| m.transform(r))?,
                otherwise: transform_box(otherwise, |m| m.transform(r))?,
            },
            DocMetric::Qualified { dataset, metric } => DocMetric::Qualified {
                dataset,
                metric: transform_box(metric, |m| m.transform(r))?,
            },
            DocMetric::PerDataset(map) => DocMetric::PerDataset(
                map.into_iter()
                    .map(|(d, m)| m.transform(r).map(|m| (d, m)))
                    .collect::<CompileResult<_>>()?,
            ),
        };
        r.doc_metric(rebuilt)
    }

    /// Datasets named by `Qualified` nodes anywhere in this metric
    pub fn qualifications(&self) -> Scope {
        let mut out = Scope::new();
        self.collect_qualifications(&mut out);
        out
    }

    fn collect_qualifications(&self, out: &mut Scope) {
        match self {
            DocMetric::Qualified { dataset, metric } => {
                out.insert(dataset.clone());
                metric.collect_qualifications(out);
            }
            DocMetric::Negate(m)
            | DocMetric::Abs(m)
            | DocMetric::Signum(m)
            | DocMetric::Log { metric: m, .. }
            | DocMetric::Exponentiate { metric: m, .. } => m.collect_qualifications(out),
            DocMetric::Add(metrics) => {
                for m in metrics {
                    m.collect_qualifications(out);
                }
            }
            DocMetric::Arith { left, right, .. } | DocMetric::Compare { left, right, .. } => {
                left.collect_qualifications(out);
                right.collect_qualifications(out);
            }
            DocMetric::IfThenElse { then, otherwise, .. } => {
                then.collect_qualifications(out);
                otherwise.collect_qualifications(out);
            }
            DocMetric::PerDataset(map) => {
                for m in map.values() {
                    m.collect_qualifications(out);
                }
            }
            _ => {}
        }
    }

    /// Compile to the postfix program the engine runs on `dataset`
    pub fn pushes(&self, dataset: &str) -> CompileResult<Vec<PushOp>> {
        let mut program = Vec::new();
        self.append_pushes(dataset, &mut program)?;
        Ok(program)
    }

    fn append_pushes(&self, dataset: &str, out: &mut Vec<PushOp>) -> CompileResult<()> {
        match self {
            DocMetric::Count => out.push(PushOp::Count),
            DocMetric::Constant(v) => out.push(PushOp::Constant(*v)),
            DocMetric::Field(field) => out.push(PushOp::Field(field.physical(dataset)?.to_string())),
            DocMetric::Negate(m) => {
                out.push(PushOp::Constant(0));
                m.append_pushes(dataset, out)?;
                out.push(PushOp::Sub);
            }
            DocMetric::Abs(m) => {
                m.append_pushes(dataset, out)?;
                out.push(PushOp::Abs);
            }
            DocMetric::Signum(m) => {
                m.append_pushes(dataset, out)?;
                out.push(PushOp::Signum);
            }
            DocMetric::Log { metric, scale } => {
                metric.append_pushes(dataset, out)?;
                out.push(PushOp::Log(*scale));
            }
            DocMetric::Exponentiate { metric, scale } => {
                metric.append_pushes(dataset, out)?;
                out.push(PushOp::Exp(*scale));
            }
            DocMetric::Add(metrics) => {
                if metrics.is_empty() {
                    out.push(PushOp::Constant(0));
                }
                for (i, m) in metrics.iter().enumerate() {
                    m.append_pushes(dataset, out)?;
                    if i > 0 {
                        out.push(PushOp::Add);
                    }
                }
            }
            DocMetric::Arith { op, left, right } => {
                left.append_pushes(dataset, out)?;
                right.append_pushes(dataset, out)?;
                out.push(op.push_op());
            }
            DocMetric::Compare { op, left, right } => {
                left.append_pushes(dataset, out)?;
                right.append_pushes(dataset, out)?;
                out.push(op.push_op());
            }
            DocMetric::HasIntField(field) => {
                out.push(PushOp::HasIntField(field.physical(dataset)?.to_string()))
            }
            DocMetric::HasStringField(field) => {
                out.push(PushOp::HasStringField(field.physical(dataset)?.to_string()))
            }
            DocMetric::HasInt { field, term } => out.push(PushOp::HasInt {
                field: field.physical(dataset)?.to_string(),
                term: *term,
            }),
            DocMetric::HasString { field, term } => out.push(PushOp::HasString {
                field: field.physical(dataset)?.to_string(),
                term: term.clone(),
            }),
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let truth = condition.as_zero_one_metric(dataset)?;
                let true_or_zero = DocMetric::multiply(truth.clone(), (**then).clone());
                let false_or_zero = DocMetric::multiply(
                    DocMetric::subtract(DocMetric::Constant(1), truth),
                    (**otherwise).clone(),
                );
                DocMetric::add(vec![true_or_zero, false_or_zero]).append_pushes(dataset, out)?;
            }
            DocMetric::Qualified {
                dataset: qualified,
                metric,
            } => {
                if qualified != dataset {
                    return Err(CompileError::scope(format!(
                        "metric qualified to '{}' cannot be pushed on '{}'",
                        qualified, dataset
                    )));
                }
                metric.append_pushes(dataset, out)?;
            }
            DocMetric::PerDataset(map) => {
                let metric = map.get(dataset).ok_or_else(|| {
                    CompileError::scope(format!("no per-dataset metric for '{}'", dataset))
                })?;
                metric.append_pushes(dataset, out)?;
            }
            DocMetric::Regex { field, regex } => out.push(PushOp::Regex {
                field: field.physical(dataset)?.to_string(),
                regex: regex.clone(),
            }),
            DocMetric::Lucene(query) => out.push(PushOp::Lucene(query.clone())),
            DocMetric::Extract {
                field,
                regex,
                group,
            } => out.push(PushOp::Extract {
                field: field.physical(dataset)?.to_string(),
                regex: regex.clone(),
                group: *group,
            }),
        }
        Ok(())
    }
}

impl fmt::Display for DocMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocMetric::Count => write!(f, "count()"),
            DocMetric::Field(field) => write!(f, "{}", field.name()),
            DocMetric::Constant(v) => write!(f, "{}", v),
            DocMetric::Negate(m) => write!(f, "-({})", m),
            DocMetric::Abs(m) => write!(f, "abs({})", m),
            DocMetric::Signum(m) => write!(f, "signum({})", m),
            DocMetric::Log { metric, scale } => write!(f, "log({}, {})", metric, scale),
            DocMetric::Exponentiate { metric, scale } => write!(f, "exp({}, {})", metric, scale),
            DocMetric::Add(metrics) => {
                write!(f, "(")?;
                for (i, m) in metrics.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, ")")
            }
            DocMetric::Arith { op, left, right } => {
                let symbol = match op {
                    ArithOp::Subtract => "-",
                    ArithOp::Multiply => "*",
                    ArithOp::Divide => "/",
                    ArithOp::Modulus => "%",
                    ArithOp::Min => "min",
                    ArithOp::Max => "max",
                };
                match op {
                    ArithOp::Min | ArithOp::Max => write!(f, "{}({}, {})", symbol, left, right),
                    _ => write!(f, "({} {} {})", left, symbol, right),
                }
            }
            DocMetric::Compare { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            DocMetric::HasIntField(field) => write!(f, "hasintfield({})", field.name()),
            DocMetric::HasStringField(field) => write!(f, "hasstrfield({})", field.name()),
            DocMetric::HasInt { field, term } => write!(f, "hasint({}, {})", field.name(), term),
            DocMetric::HasString { field, term } => {
                write!(f, "hasstr({}, \"{}\")", field.name(), term)
            }
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => write!(f, "if {} then {} else {}", condition, then, otherwise),
            DocMetric::Qualified { dataset, metric } => write!(f, "{}.{}", dataset, metric),
            DocMetric::PerDataset(map) => {
                write!(f, "per_dataset(")?;
                for (i, (d, m)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", d, m)?;
                }
                write!(f, ")")
            }
            DocMetric::Regex { field, regex } => write!(f, "{} =~ \"{}\"", field.name(), regex),
            DocMetric::Lucene(query) => write!(f, "lucene(\"{}\")", query),
            DocMetric::Extract { field, regex, group } => {
                write!(f, "extract({}, \"{}\", {})", field.name(), regex, group)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::term::Term;
    use crate::language::transform::DocMetricRewriter;

    fn oji() -> DocMetric {
        DocMetric::field(FieldSet::int("oji", &["jobsearch"]))
    }

    #[test]
    fn test_add_folds_constants_and_counts() {
        let metric = DocMetric::add(vec![
            DocMetric::Constant(2),
            oji(),
            DocMetric::Count,
            DocMetric::add(vec![DocMetric::Constant(3), oji()]),
        ]);
        assert_eq!(
            metric,
            DocMetric::Add(vec![oji(), oji(), DocMetric::Constant(6)])
        );
        assert_eq!(DocMetric::add(vec![]), DocMetric::Constant(0));
        assert_eq!(DocMetric::add(vec![oji()]), oji());
    }

    #[test]
    fn test_binary_pushes_are_postfix() {
        let metric = DocMetric::subtract(oji(), DocMetric::Constant(1));
        assert_eq!(
            metric.pushes("jobsearch").unwrap(),
            vec![PushOp::Field("oji".into()), PushOp::Constant(1), PushOp::Sub]
        );
    }

    #[test]
    fn test_add_pushes_interleave_operators() {
        let metric = DocMetric::Add(vec![oji(), oji(), DocMetric::Constant(6)]);
        assert_eq!(
            metric.pushes("jobsearch").unwrap(),
            vec![
                PushOp::Field("oji".into()),
                PushOp::Field("oji".into()),
                PushOp::Add,
                PushOp::Constant(6),
                PushOp::Add,
            ]
        );
    }

    #[test]
    fn test_field_missing_in_dataset_is_scope_error() {
        let err = oji().pushes("mobsearch").unwrap_err();
        assert!(matches!(err, CompileError::Scope(_)));
    }

    #[test]
    fn test_qualified_rejects_other_dataset() {
        let metric = DocMetric::qualified("jobsearch", oji());
        assert!(metric.pushes("jobsearch").is_ok());
        assert!(matches!(
            metric.pushes("mobsearch").unwrap_err(),
            CompileError::Scope(_)
        ));
        assert_eq!(metric.qualifications().len(), 1);
    }

    #[test]
    fn test_if_then_else_lowers_to_arithmetic() {
        let country = FieldSet::string("country", &["jobsearch"]);
        let metric = DocMetric::IfThenElse {
            condition: Box::new(DocFilter::FieldIs {
                field: country,
                term: Term::from("us"),
            }),
            then: Box::new(oji()),
            otherwise: Box::new(DocMetric::Constant(0)),
        };
        let program = metric.pushes("jobsearch").unwrap();
        assert!(program.contains(&PushOp::HasString {
            field: "country".into(),
            term: "us".into()
        }));
        assert_eq!(program.last(), Some(&PushOp::Add));
    }

    #[test]
    fn test_transform_visits_bottom_up() {
        let metric = DocMetric::subtract(oji(), DocMetric::Constant(1));
        let mut seen = Vec::new();
        let rewritten = metric
            .transform(&mut DocMetricRewriter(|m: DocMetric| {
                seen.push(m.to_string());
                Ok(match m {
                    DocMetric::Constant(v) => DocMetric::Constant(v * 10),
                    other => other,
                })
            }))
            .unwrap();
        assert_eq!(seen, vec!["oji", "1", "(oji - 10)"]);
        assert_eq!(rewritten.to_string(), "(oji - 10)");
    }
}
