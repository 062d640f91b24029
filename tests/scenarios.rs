// End-to-end scenarios from spec §8.2.

use tempfile::tempdir;
use tinydb::collection::IdPolicy;
use tinydb::config::{Config, WriteConcern};
use tinydb::db::Database;
use tinydb::error::DbError;
use tinydb::query::{Plan, Predicate};
use tinydb::value::{Document, ObjectId, Value};

fn open(dir: &std::path::Path, name: &str, config: Config) -> Database {
    Database::open(dir.join(name), config).unwrap()
}

// S1: insert/find round-trip.
#[test]
fn s1_insert_find_round_trip() {
    let dir = tempdir().unwrap();
    let db = open(dir.path(), "s1.db", Config::default().with_cache_size(64));
    db.create_collection("users", IdPolicy::ObjectId).unwrap();

    let id = ObjectId::new();
    let mut doc = Document::new();
    doc.insert("_id", Value::ObjectId(id));
    doc.insert("name", Value::String("alice".to_string()));
    doc.insert("age", Value::I32(30));
    let returned_id = db.insert_one("users", doc.clone()).unwrap();
    assert_eq!(returned_id, Value::ObjectId(id));

    let found = db.find_by_id("users", &Value::ObjectId(id)).unwrap().unwrap();
    assert_eq!(found, doc);
    assert_eq!(db.find_all("users").unwrap().len(), 1);
}

// S2: unique index violation.
#[test]
fn s2_unique_violation() {
    let dir = tempdir().unwrap();
    let db = open(dir.path(), "s2.db", Config::default().with_cache_size(64));
    db.create_collection("users", IdPolicy::Int64Identity).unwrap();
    db.ensure_index("users", "email_idx", vec!["email".to_string()], true, false).unwrap();

    let mut first = Document::new();
    first.insert("_id", Value::I64(1));
    first.insert("email", Value::String("x@y".to_string()));
    db.insert_one("users", first).unwrap();

    let mut second = Document::new();
    second.insert("_id", Value::I64(2));
    second.insert("email", Value::String("x@y".to_string()));
    let err = db.insert_one("users", second).unwrap_err();
    assert!(matches!(err, DbError::UniqueConstraint { .. }));

    assert_eq!(db.find_all("users").unwrap().len(), 1);
    let key = tinydb::index::IndexKey::single(Value::String("x@y".to_string()));
    assert_eq!(db.find_by_index("users", "email_idx", &key).unwrap().len(), 1);
}

// S3: rollback restores the pre-transaction state exactly.
#[test]
fn s3_rollback_restores_pre_state() {
    let dir = tempdir().unwrap();
    let db = open(dir.path(), "s3.db", Config::default().with_cache_size(512));
    db.create_collection("docs", IdPolicy::Int64Identity).unwrap();

    for i in 1..=1000i64 {
        let mut d = Document::new();
        d.insert("_id", Value::I64(i));
        d.insert("age", Value::I32(20));
        db.insert_one("docs", d).unwrap();
    }
    assert_eq!(db.count("docs").unwrap(), 1000);

    let mut txn = db.begin().unwrap();
    for i in 1001..=1010i64 {
        let mut d = Document::new();
        d.insert("_id", Value::I64(i));
        txn.record_insert("docs", d).unwrap();
    }
    let mut updated = db.find_by_id("docs", &Value::I64(1)).unwrap().unwrap();
    updated.insert("age", Value::I32(999));
    txn.record_update("docs", Value::I64(1), updated).unwrap();
    txn.rollback();

    assert_eq!(db.count("docs").unwrap(), 1000);
    let doc1 = db.find_by_id("docs", &Value::I64(1)).unwrap().unwrap();
    assert_eq!(doc1.get("age"), Some(&Value::I32(20)));
}

// S4: durability under WriteConcern::Journaled across a simulated crash
// (dropping the handle without calling `close`, so data pages are never
// explicitly flushed; only the WAL carries the committed write).
#[test]
fn s4_durability_under_journaled() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s4.db");
    let config = Config::default().with_write_concern(WriteConcern::Journaled).with_cache_size(64);
    {
        let db = Database::open(&path, config.clone()).unwrap();
        db.create_collection("docs", IdPolicy::Int64Identity).unwrap();
        let mut d = Document::new();
        d.insert("_id", Value::I64(1));
        d.insert("v", Value::String("durable".to_string()));
        db.insert_one("docs", d).unwrap();
        // No `close()`: simulates the process dying right after commit
        // returns, before the background flusher or an explicit flush
        // ever touches the data file.
    }
    let db2 = Database::open(&path, config).unwrap();
    let doc = db2.find_by_id("docs", &Value::I64(1)).unwrap().unwrap();
    assert_eq!(doc.get("v"), Some(&Value::String("durable".to_string())));
}

// S5: a bounded range predicate on an indexed field uses an index range
// scan and returns exactly the matching documents.
#[test]
fn s5_range_scan_uses_index() {
    let dir = tempdir().unwrap();
    let db = open(dir.path(), "s5.db", Config::default().with_cache_size(1024));
    db.create_collection("docs", IdPolicy::Int64Identity).unwrap();
    db.ensure_index("docs", "age_idx", vec!["age".to_string()], false, false).unwrap();

    for i in 0..10_000i64 {
        let mut d = Document::new();
        d.insert("_id", Value::I64(i));
        d.insert("age", Value::I32((i % 100) as i32));
        db.insert_one("docs", d).unwrap();
    }

    let query = db
        .query("docs")
        .unwrap()
        .filter(Predicate::And(vec![Predicate::Gte("age".to_string(), Value::I32(25)), Predicate::Lte("age".to_string(), Value::I32(30))]));
    assert_eq!(query.explain(), Plan::IndexRange { index: "age_idx".to_string() });

    let results = db
        .query("docs")
        .unwrap()
        .filter(Predicate::And(vec![Predicate::Gte("age".to_string(), Value::I32(25)), Predicate::Lte("age".to_string(), Value::I32(30))]))
        .run()
        .unwrap();
    assert_eq!(results.len(), 10_000 / 100 * 6);
    for doc in &results {
        match doc.get("age") {
            Some(Value::I32(age)) => assert!((25..=30).contains(age)),
            other => panic!("unexpected age value: {other:?}"),
        }
    }
}

// S6: a foreign key violation at commit time rolls the whole transaction
// back and leaves the referencing collection untouched.
#[test]
fn s6_foreign_key_check() {
    let dir = tempdir().unwrap();
    let db = open(dir.path(), "s6.db", Config::default().with_cache_size(64));
    db.create_collection("users", IdPolicy::Int64Identity).unwrap();
    db.create_collection("orders", IdPolicy::Int64Identity).unwrap();
    db.declare_foreign_key("orders", "user_id", "users").unwrap();

    let mut u = Document::new();
    u.insert("_id", Value::I64(1));
    db.insert_one("users", u).unwrap();

    let mut txn = db.begin().unwrap();
    let mut order = Document::new();
    order.insert("_id", Value::I64(100));
    order.insert("user_id", Value::String("nope".to_string()));
    txn.record_insert("orders", order).unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    assert_eq!(db.count("orders").unwrap(), 0);
}
