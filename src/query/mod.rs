// Predicate-driven query executor (spec §4.8).
//
// Grounded on the teacher's query-planning shape of "pick the narrowest
// applicable index, seek it, then postfilter in memory" seen across the
// pack's index-backed stores, adapted to this engine's `IndexManager`. The
// planner only recognizes the fragment of predicates that can drive an
// index seek (field/op/value conjuncts); anything else is always evaluated
// as an in-memory postfilter, so a predicate that can't be planned never
// produces wrong results, only a full scan.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::collection::{Collection, IndexDescriptor};
use crate::db::Database;
use crate::error::Result;
use crate::index::IndexKey;
use crate::value::{Document, Value};

/// A single field comparison. `And`/`Or` compose these into a full
/// predicate tree; only the `And` branch's direct children are consulted
/// for index planning (spec §4.8 "conjuncts that bind a declared-index
/// field").
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::Eq(f, v) => field_cmp(doc, f, v) == Some(CmpOrdering::Equal),
            Predicate::Ne(f, v) => field_cmp(doc, f, v) != Some(CmpOrdering::Equal),
            Predicate::Lt(f, v) => field_cmp(doc, f, v) == Some(CmpOrdering::Less),
            Predicate::Lte(f, v) => matches!(field_cmp(doc, f, v), Some(CmpOrdering::Less) | Some(CmpOrdering::Equal)),
            Predicate::Gt(f, v) => field_cmp(doc, f, v) == Some(CmpOrdering::Greater),
            Predicate::Gte(f, v) => matches!(field_cmp(doc, f, v), Some(CmpOrdering::Greater) | Some(CmpOrdering::Equal)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(doc)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(doc)),
        }
    }

    /// Top-level conjuncts usable for planning: `self` if it's a single
    /// comparison, or `self`'s children if it's an `And`. An `Or` or a
    /// nested structure yields none, which simply forces a full scan.
    fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(parts) => parts.iter().collect(),
            Predicate::Or(_) => Vec::new(),
            other => vec![other],
        }
    }
}

fn field_cmp(doc: &Document, field: &str, value: &Value) -> Option<CmpOrdering> {
    doc.get(field).map(|v| v.compare(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// The plan chosen for a query, exposed so tests can assert an index was
/// actually used (spec §8.2 S5's "plan inspection hook").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    IndexSeek { index: String },
    IndexRange { index: String },
    FullScan,
}

struct Conjunct<'a> {
    field: &'a str,
    bound: Bound,
    value: &'a Value,
}

fn flatten(predicate: &Predicate) -> Vec<Conjunct<'_>> {
    predicate
        .conjuncts()
        .into_iter()
        .filter_map(|p| match p {
            Predicate::Eq(f, v) => Some(Conjunct { field: f, bound: Bound::Eq, value: v }),
            Predicate::Lt(f, v) => Some(Conjunct { field: f, bound: Bound::Lt, value: v }),
            Predicate::Lte(f, v) => Some(Conjunct { field: f, bound: Bound::Lte, value: v }),
            Predicate::Gt(f, v) => Some(Conjunct { field: f, bound: Bound::Gt, value: v }),
            Predicate::Gte(f, v) => Some(Conjunct { field: f, bound: Bound::Gte, value: v }),
            _ => None,
        })
        .collect()
}

/// A candidate index plan: how many leading fields matched by equality, and
/// whether a trailing range bound narrows the field right after that
/// prefix.
struct Candidate<'a> {
    descriptor: &'a IndexDescriptor,
    eq_prefix: Vec<&'a Value>,
    range: Option<(Bound, &'a Value)>,
}

fn best_candidate<'a>(descriptors: &'a [IndexDescriptor], conjuncts: &'a [Conjunct<'a>]) -> Option<Candidate<'a>> {
    let mut best: Option<Candidate<'a>> = None;
    for descriptor in descriptors {
        let mut eq_prefix = Vec::new();
        for field in &descriptor.fields {
            match conjuncts.iter().find(|c| c.field == field && c.bound == Bound::Eq) {
                Some(c) => eq_prefix.push(c.value),
                None => break,
            }
        }
        let next_field = descriptor.fields.get(eq_prefix.len());
        let range = next_field.and_then(|field| {
            conjuncts
                .iter()
                .find(|c| c.field == field && matches!(c.bound, Bound::Lt | Bound::Lte | Bound::Gt | Bound::Gte))
                .map(|c| (c.bound, c.value))
        });
        if eq_prefix.is_empty() && range.is_none() {
            continue;
        }
        let candidate = Candidate { descriptor, eq_prefix, range };
        best = match best {
            None => Some(candidate),
            Some(current) => Some(pick_better(current, candidate)),
        };
    }
    best
}

/// Prefers unique indexes, then the longer equality prefix, then a
/// narrower estimated selectivity (a bound range beats an unbounded
/// equality-only prefix of the same length, since it cuts the scan on both
/// sides), per spec §4.8's planning order.
fn pick_better<'a>(a: Candidate<'a>, b: Candidate<'a>) -> Candidate<'a> {
    if a.descriptor.unique != b.descriptor.unique {
        return if a.descriptor.unique { a } else { b };
    }
    if a.eq_prefix.len() != b.eq_prefix.len() {
        return if a.eq_prefix.len() > b.eq_prefix.len() { a } else { b };
    }
    if a.range.is_some() != b.range.is_some() {
        return if a.range.is_some() { a } else { b };
    }
    a
}

fn bounds_for(candidate: &Candidate<'_>, arity: usize) -> (Option<IndexKey>, Option<IndexKey>, bool, bool) {
    let mut lo: Vec<Value> = candidate.eq_prefix.iter().map(|v| (*v).clone()).collect();
    let mut hi = lo.clone();
    let mut incl_lo = true;
    let mut incl_hi = true;

    match candidate.range {
        Some((Bound::Lt, v)) => {
            hi.push(v.clone());
            incl_hi = false;
            lo.push(Value::MinKey);
        }
        Some((Bound::Lte, v)) => {
            hi.push(v.clone());
            lo.push(Value::MinKey);
        }
        Some((Bound::Gt, v)) => {
            lo.push(v.clone());
            incl_lo = false;
            hi.push(Value::MaxKey);
        }
        Some((Bound::Gte, v)) => {
            lo.push(v.clone());
            hi.push(Value::MaxKey);
        }
        Some((Bound::Eq, _)) | None => {}
    }

    while lo.len() < arity {
        lo.push(Value::MinKey);
    }
    while hi.len() < arity {
        hi.push(Value::MaxKey);
    }
    (Some(IndexKey(lo)), Some(IndexKey(hi)), incl_lo, incl_hi)
}

/// Builds a query against one collection. Created via `Database::query`.
pub struct QueryBuilder<'a> {
    db: &'a Database,
    collection: Arc<Collection>,
    predicate: Option<Predicate>,
    order_by: Option<(String, bool)>,
    skip: usize,
    take: Option<usize>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(db: &'a Database, collection: Arc<Collection>) -> Self {
        Self { db, collection, predicate: None, order_by: None, skip: 0, take: None }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some((field.into(), ascending));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    /// Reports the plan this query would use, without running it (spec §8.2
    /// S5's plan inspection hook).
    pub fn explain(&self) -> Plan {
        let Some(predicate) = &self.predicate else { return Plan::FullScan };
        let conjuncts = flatten(predicate);
        if conjuncts.is_empty() {
            return Plan::FullScan;
        }
        let descriptors = self.collection.index_manager().descriptors();
        match best_candidate(&descriptors, &conjuncts) {
            Some(candidate) if candidate.range.is_some() || candidate.eq_prefix.len() < candidate.descriptor.fields.len() => {
                Plan::IndexRange { index: candidate.descriptor.name.clone() }
            }
            Some(candidate) => Plan::IndexSeek { index: candidate.descriptor.name.clone() },
            None => Plan::FullScan,
        }
    }

    pub fn run(self) -> Result<Vec<Document>> {
        let _ = self.db; // reserved: future read-lock coordination through the owning database
        let mut docs = match &self.predicate {
            None => self.collection.scan_all()?,
            Some(predicate) => {
                let conjuncts = flatten(predicate);
                let descriptors = self.collection.index_manager().descriptors();
                let candidate = if conjuncts.is_empty() { None } else { best_candidate(&descriptors, &conjuncts) };
                let candidates = match candidate {
                    Some(candidate) => {
                        let arity = candidate.descriptor.fields.len();
                        let (lo, hi, incl_lo, incl_hi) = bounds_for(&candidate, arity);
                        self.collection.range_by_index(
                            &candidate.descriptor.name,
                            lo.as_ref(),
                            hi.as_ref(),
                            incl_lo,
                            incl_hi,
                        )?
                    }
                    None => self.collection.scan_all()?,
                };
                candidates.into_iter().filter(|doc| predicate.matches(doc)).collect()
            }
        };

        if let Some((field, ascending)) = &self.order_by {
            docs.sort_by(|a, b| {
                let ord = match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => x.compare(y),
                    (None, Some(_)) => CmpOrdering::Less,
                    (Some(_), None) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                };
                let ord = if *ascending { ord } else { ord.reverse() };
                ord.then_with(|| {
                    a.get_id()
                        .zip(b.get_id())
                        .map(|(x, y)| x.compare(y))
                        .unwrap_or(CmpOrdering::Equal)
                })
            });
        }

        let docs: Vec<Document> = docs.into_iter().skip(self.skip).collect();
        Ok(match self.take {
            Some(n) => docs.into_iter().take(n).collect(),
            None => docs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::IdPolicy;
    use crate::config::Config;
    use tempfile::tempdir;

    fn doc(age: i64) -> Document {
        let mut d = Document::new();
        d.insert("age", Value::I64(age));
        d
    }

    #[test]
    fn range_query_uses_index_and_returns_matching_docs() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("q.db"), Config::default().with_cache_size(256)).unwrap();
        db.create_collection("people", IdPolicy::Int64Identity).unwrap();
        db.ensure_index("people", "age_idx", vec!["age".to_string()], false, false).unwrap();
        for age in 0..100 {
            db.insert_one("people", doc(age)).unwrap();
        }

        let query = db.query("people").unwrap().filter(Predicate::And(vec![
            Predicate::Gte("age".to_string(), Value::I64(25)),
            Predicate::Lte("age".to_string(), Value::I64(30)),
        ]));
        assert_eq!(query.explain(), Plan::IndexRange { index: "age_idx".to_string() });

        let results = db
            .query("people")
            .unwrap()
            .filter(Predicate::And(vec![
                Predicate::Gte("age".to_string(), Value::I64(25)),
                Predicate::Lte("age".to_string(), Value::I64(30)),
            ]))
            .run()
            .unwrap();
        assert_eq!(results.len(), 6);
        for doc in &results {
            let age = match doc.get("age") {
                Some(Value::I64(v)) => *v,
                _ => panic!("missing age"),
            };
            assert!((25..=30).contains(&age));
        }
    }

    #[test]
    fn no_matching_index_falls_back_to_full_scan() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("q2.db"), Config::default().with_cache_size(64)).unwrap();
        db.create_collection("people", IdPolicy::Int64Identity).unwrap();
        db.insert_one("people", doc(5)).unwrap();

        let query = db.query("people").unwrap().filter(Predicate::Eq("age".to_string(), Value::I64(5)));
        assert_eq!(query.explain(), Plan::FullScan);
        assert_eq!(query.run().unwrap().len(), 1);
    }

    #[test]
    fn order_by_and_pagination_compose() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("q3.db"), Config::default().with_cache_size(64)).unwrap();
        db.create_collection("people", IdPolicy::Int64Identity).unwrap();
        for age in [5, 1, 3, 2, 4] {
            db.insert_one("people", doc(age)).unwrap();
        }

        let page = db.query("people").unwrap().order_by("age", true).skip(1).take(2).run().unwrap();
        let ages: Vec<i64> = page
            .iter()
            .map(|d| match d.get("age") {
                Some(Value::I64(v)) => *v,
                _ => panic!("missing age"),
            })
            .collect();
        assert_eq!(ages, vec![2, 3]);
    }
}
