//! One dataset of one query in the in-memory engine

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::document::Document;
use super::program::{Matcher, Program};
use super::{EngineCounters, MemoryLimits};
use crate::execution::{
    DatasetSession, EngineError, EngineResult, FtgsField, FtgsIterator, FtgsTuple, RegroupRule,
};
use crate::language::{PushOp, Term};

/// Releases the open-iterator count when an iteration is dropped
struct FtgsStream {
    tuples: std::vec::IntoIter<FtgsTuple>,
    counters: Arc<EngineCounters>,
}

impl Iterator for FtgsStream {
    type Item = EngineResult<FtgsTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.tuples.next().map(Ok)
    }
}

impl Drop for FtgsStream {
    fn drop(&mut self) {
        self.counters.open_iterators.fetch_sub(1, Ordering::SeqCst);
    }
}

enum CompiledRule {
    Conditions {
        conditions: Vec<(Matcher, usize)>,
        negative: usize,
    },
    Buckets {
        stat: usize,
        min: i64,
        interval: i64,
        count: usize,
        first: usize,
        below: usize,
        above: usize,
    },
}

pub struct MemorySession {
    name: String,
    documents: Arc<Vec<Document>>,
    /// Indices into `documents` of the documents in the time range
    members: Vec<usize>,
    /// Group of each member; 0 is dropped
    groups: Vec<usize>,
    /// Pushed stats, each with one value per member
    stats: Vec<Vec<i64>>,
    num_groups: usize,
    limits: MemoryLimits,
    counters: Arc<EngineCounters>,
    closed: bool,
}

impl MemorySession {
    pub(super) fn new(
        name: &str,
        documents: Arc<Vec<Document>>,
        start: i64,
        end: i64,
        limits: MemoryLimits,
        counters: Arc<EngineCounters>,
    ) -> Self {
        let members: Vec<usize> = documents
            .iter()
            .enumerate()
            .filter(|(_, d)| start <= d.timestamp && d.timestamp < end)
            .map(|(i, _)| i)
            .collect();
        let groups = vec![1; members.len()];
        counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Self {
            name: name.to_string(),
            documents,
            members,
            groups,
            stats: Vec::new(),
            num_groups: 1,
            limits,
            counters,
            closed: false,
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::Failed(format!("session for '{}' is closed", self.name)));
        }
        Ok(())
    }

    fn check_stat(&self, stat: usize) -> EngineResult<()> {
        if stat >= self.stats.len() {
            return Err(EngineError::Failed(format!(
                "stat {} out of range, {} pushed",
                stat,
                self.stats.len()
            )));
        }
        Ok(())
    }

    fn check_groups(&self, num_groups: usize) -> EngineResult<()> {
        if num_groups > self.limits.max_groups {
            return Err(EngineError::ResourceExhausted(format!(
                "{} groups exceed the limit of {}",
                num_groups, self.limits.max_groups
            )));
        }
        Ok(())
    }

    fn member_stats(&self, member: usize) -> Vec<i64> {
        self.stats.iter().map(|column| column[member]).collect()
    }

    fn recount(&mut self, floor: usize) -> usize {
        let highest = self.groups.iter().copied().max().unwrap_or(0);
        self.num_groups = highest.max(floor);
        self.num_groups
    }
}

impl DatasetSession for MemorySession {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_stat(&mut self, program: &[PushOp]) -> EngineResult<usize> {
        self.ensure_open()?;
        if self.stats.len() >= self.limits.max_stats {
            return Err(EngineError::ResourceExhausted(format!(
                "more than {} pushed stats",
                self.limits.max_stats
            )));
        }
        let program = Program::compile(program)?;
        let column = self
            .members
            .iter()
            .map(|&i| program.eval(&self.documents[i]))
            .collect();
        self.stats.push(column);
        Ok(self.stats.len())
    }

    fn pop_stat(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.stats
            .pop()
            .map(|_| ())
            .ok_or_else(|| EngineError::Failed("pop on an empty stat stack".to_string()))
    }

    fn num_stats(&self) -> usize {
        self.stats.len()
    }

    fn regroup(&mut self, rules: &[RegroupRule]) -> EngineResult<usize> {
        self.ensure_open()?;
        let highest = rules.iter().map(RegroupRule::max_destination).max().unwrap_or(0);
        self.check_groups(highest)?;

        let mut by_target: HashMap<usize, CompiledRule> = HashMap::new();
        for rule in rules {
            if by_target.contains_key(&rule.target()) {
                continue;
            }
            let compiled = match rule {
                RegroupRule::Conditions {
                    conditions,
                    negative,
                    ..
                } => CompiledRule::Conditions {
                    conditions: conditions
                        .iter()
                        .map(|(c, g)| Ok((Matcher::compile(c, self.stats.len())?, *g)))
                        .collect::<EngineResult<_>>()?,
                    negative: *negative,
                },
                RegroupRule::Buckets {
                    stat,
                    min,
                    interval,
                    count,
                    first,
                    below,
                    above,
                    ..
                } => {
                    self.check_stat(*stat)?;
                    if *interval <= 0 {
                        return Err(EngineError::Failed(format!("bucket interval {} is not positive", interval)));
                    }
                    CompiledRule::Buckets {
                        stat: *stat,
                        min: *min,
                        interval: *interval,
                        count: *count,
                        first: *first,
                        below: *below,
                        above: *above,
                    }
                }
            };
            by_target.insert(rule.target(), compiled);
        }

        for member in 0..self.members.len() {
            let group = self.groups[member];
            if group == 0 {
                continue;
            }
            let Some(rule) = by_target.get(&group) else {
                continue;
            };
            let doc = &self.documents[self.members[member]];
            let next = match rule {
                CompiledRule::Conditions {
                    conditions,
                    negative,
                } => {
                    let stats = self.member_stats(member);
                    conditions
                        .iter()
                        .find(|(m, _)| m.matches(doc, &stats))
                        .map_or(*negative, |(_, g)| *g)
                }
                CompiledRule::Buckets {
                    stat,
                    min,
                    interval,
                    count,
                    first,
                    below,
                    above,
                } => {
                    let value = self.stats[*stat][member];
                    if value < *min {
                        *below
                    } else {
                        // a difference past i64 is past every bucket
                        match value.checked_sub(*min).map(|offset| offset / interval) {
                            Some(bucket) if bucket < *count as i64 => first + bucket as usize,
                            _ => *above,
                        }
                    }
                }
            };
            self.groups[member] = next;
        }
        Ok(self.recount(highest))
    }

    fn remap_groups(&mut self, mapping: &[usize]) -> EngineResult<usize> {
        self.ensure_open()?;
        let highest = mapping.iter().copied().max().unwrap_or(0);
        self.check_groups(highest)?;
        for group in self.groups.iter_mut() {
            *group = mapping.get(*group).copied().unwrap_or(0);
        }
        Ok(self.recount(highest))
    }

    fn metric_filter(&mut self, stat: usize, min: i64, max: i64, negate: bool) -> EngineResult<()> {
        self.ensure_open()?;
        self.check_stat(stat)?;
        for (member, group) in self.groups.iter_mut().enumerate() {
            let value = self.stats[stat][member];
            let inside = min <= value && value <= max;
            if inside == negate {
                *group = 0;
            }
        }
        Ok(())
    }

    fn get_group_stats(&mut self, stat: usize, num_groups: usize) -> EngineResult<Vec<i64>> {
        self.ensure_open()?;
        self.check_stat(stat)?;
        let mut sums = vec![0i64; num_groups + 1];
        for (member, group) in self.groups.iter().enumerate() {
            if *group != 0 && *group <= num_groups {
                sums[*group] += self.stats[stat][member];
            }
        }
        Ok(sums)
    }

    fn ftgs_iterator(&mut self, fields: &[FtgsField], sorted: bool) -> EngineResult<FtgsIterator<'_>> {
        self.ensure_open()?;
        if sorted {
            self.counters.sorted_requests.fetch_add(1, Ordering::SeqCst);
        }
        let width = self.stats.len();
        let mut tuples = Vec::new();
        for field in fields {
            let mut order: Vec<(Term, usize)> = Vec::new();
            let mut sums: HashMap<(Term, usize), Vec<i64>> = HashMap::new();
            for (member, group) in self.groups.iter().enumerate() {
                if *group == 0 {
                    continue;
                }
                let doc = &self.documents[self.members[member]];
                let terms: BTreeSet<Term> = doc.terms(&field.name, field.is_int).into_iter().collect();
                for term in terms {
                    let key = (term, *group);
                    let entry = sums.entry(key.clone()).or_insert_with(|| {
                        order.push(key);
                        vec![0; width]
                    });
                    for (k, column) in self.stats.iter().enumerate() {
                        entry[k] += column[member];
                    }
                }
            }
            if sorted {
                order.sort();
            }
            for key in order {
                let stats = sums.remove(&key).unwrap_or_default();
                tuples.push(FtgsTuple {
                    field: field.name.clone(),
                    term: key.0,
                    group: key.1,
                    stats,
                });
            }
        }
        self.counters.open_iterators.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FtgsStream {
            tuples: tuples.into_iter(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn get_distinct(&mut self, field: &FtgsField, num_groups: usize) -> EngineResult<Vec<i64>> {
        self.ensure_open()?;
        let mut seen: BTreeMap<usize, BTreeSet<Term>> = BTreeMap::new();
        for (member, group) in self.groups.iter().enumerate() {
            if *group == 0 || *group > num_groups {
                continue;
            }
            let doc = &self.documents[self.members[member]];
            seen.entry(*group)
                .or_default()
                .extend(doc.terms(&field.name, field.is_int));
        }
        let mut counts = vec![0i64; num_groups + 1];
        for (group, terms) in seen {
            counts[group] = terms.len() as i64;
        }
        Ok(counts)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.clear();
            self.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Condition;

    fn session() -> MemorySession {
        let docs = vec![
            Document::at(10).string("country", "us").int("clicks", 1),
            Document::at(20).string("country", "gb").int("clicks", 2),
            Document::at(30).string("country", "us").int("clicks", 3),
            Document::at(99).string("country", "fr").int("clicks", 4),
        ];
        MemorySession::new(
            "jobs",
            Arc::new(docs),
            0,
            50,
            MemoryLimits::default(),
            Arc::new(EngineCounters::default()),
        )
    }

    #[test]
    fn test_time_range_selects_members() {
        let mut s = session();
        s.push_stat(&[PushOp::Count]).unwrap();
        assert_eq!(s.get_group_stats(0, 1).unwrap(), vec![0, 3]);
    }

    #[test]
    fn test_regroup_by_term_and_buckets() {
        let mut s = session();
        let n = s
            .regroup(&[RegroupRule::Conditions {
                target: 1,
                conditions: vec![(
                    Condition::Term {
                        field: "country".into(),
                        term: Term::from("us"),
                    },
                    1,
                )],
                negative: 2,
            }])
            .unwrap();
        assert_eq!(n, 2);
        s.push_stat(&[PushOp::Field("clicks".into())]).unwrap();
        assert_eq!(s.get_group_stats(0, 2).unwrap(), vec![0, 4, 2]);

        s.regroup(&[RegroupRule::Buckets {
            target: 1,
            stat: 0,
            min: 0,
            interval: 2,
            count: 2,
            first: 3,
            below: 0,
            above: 0,
        }])
        .unwrap();
        assert_eq!(s.get_group_stats(0, 4).unwrap(), vec![0, 0, 2, 1, 3]);
    }

    #[test]
    fn test_metric_filter_drops_documents() {
        let mut s = session();
        s.push_stat(&[PushOp::Field("clicks".into())]).unwrap();
        s.metric_filter(0, 2, 3, false).unwrap();
        assert_eq!(s.get_group_stats(0, 1).unwrap(), vec![0, 5]);
    }

    #[test]
    fn test_ftgs_sorted_and_first_seen() {
        let mut s = session();
        s.push_stat(&[PushOp::Count]).unwrap();
        let field = [FtgsField::new("country", false)];
        let sorted: Vec<Term> = s
            .ftgs_iterator(&field, true)
            .unwrap()
            .map(|t| t.unwrap().term)
            .collect();
        assert_eq!(sorted, vec![Term::from("gb"), Term::from("us")]);
        let first_seen: Vec<Term> = s
            .ftgs_iterator(&field, false)
            .unwrap()
            .map(|t| t.unwrap().term)
            .collect();
        assert_eq!(first_seen, vec![Term::from("us"), Term::from("gb")]);
        assert_eq!(s.counters.sorted_requests.load(Ordering::SeqCst), 1);
        assert_eq!(s.counters.open_iterators.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_group_cap_is_resource_exhaustion() {
        let mut s = session();
        s.limits.max_groups = 2;
        let err = s.remap_groups(&[0, 3]).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn test_closed_session_rejects_calls() {
        let mut s = session();
        s.close();
        s.close();
        assert!(s.push_stat(&[PushOp::Count]).is_err());
        assert_eq!(s.counters.sessions_closed.load(Ordering::SeqCst), 1);
    }
}
