// Binary value model (spec §3.1, §6.1).
//
// A tagged union over the closed variant set, with a small trait providing
// `type_tag`/`compare`/the stable binary encoding, replacing what the
// teacher's document_store module did with a per-kind struct hierarchy
// plus BSON/JSON convertor functions.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

pub const TAG_DOUBLE: u8 = 0x01;
pub const TAG_STRING: u8 = 0x02;
pub const TAG_DOCUMENT: u8 = 0x03;
pub const TAG_ARRAY: u8 = 0x04;
pub const TAG_BINARY: u8 = 0x05;
pub const TAG_OBJECT_ID: u8 = 0x07;
pub const TAG_BOOL: u8 = 0x08;
pub const TAG_DATETIME: u8 = 0x09;
pub const TAG_NULL: u8 = 0x0A;
pub const TAG_REGEX: u8 = 0x0B;
pub const TAG_INT32: u8 = 0x10;
pub const TAG_TIMESTAMP: u8 = 0x11;
pub const TAG_INT64: u8 = 0x12;
pub const TAG_DECIMAL128: u8 = 0x13;
pub const TAG_MIN_KEY: u8 = 0xFF;
pub const TAG_MAX_KEY: u8 = 0x7F;

/// 12-byte identifier: 4 bytes timestamp, 5 bytes random, 3 bytes counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let mut rand_bytes = [0u8; 5];
        rand::rng().fill_bytes(&mut rand_bytes);
        let counter = NEXT_OID_COUNTER.next();
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&ts.to_be_bytes());
        bytes[4..9].copy_from_slice(&rand_bytes);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }

    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

struct OidCounter(parking_lot::Mutex<u32>);
impl OidCounter {
    fn next(&self) -> u32 {
        let mut guard = self.0.lock();
        *guard = guard.wrapping_add(1);
        *guard
    }
}
static NEXT_OID_COUNTER: OidCounter = OidCounter(parking_lot::Mutex::new(0));

/// IEEE 754-2008 decimal128, stored as its raw 16-byte interchange
/// representation so encode/decode round-trips exactly.
///
/// Ordering decodes the dominant binary-encoding case (combination field
/// prefix `00`/`01`/`10`, i.e. leading coefficient digit 0-7) into a
/// (sign, exponent, coefficient) triple for numeric comparison. The rare
/// `11`-prefixed case (leading coefficient digit 8 or 9) falls back to
/// comparing the raw bit pattern: still a valid total order, just not one
/// that is numerically meaningful across differing exponents in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decimal128(pub [u8; 16]);

struct DecodedDecimal {
    negative: bool,
    exponent: i32,
    coefficient: u128,
}

impl Decimal128 {
    fn decode(&self) -> Option<DecodedDecimal> {
        // Interpret the 16 bytes (little-endian on disk) as a 128-bit integer.
        let mut be = self.0;
        be.reverse();
        let bits = u128::from_be_bytes(be);

        let negative = (bits >> 127) & 1 == 1;
        let combination = ((bits >> 110) & 0x1FFFF) as u32; // 17 bits

        if (combination >> 15) == 0b11 {
            // Special or rare-case encoding; not decoded numerically.
            return None;
        }

        let exponent_bits = (combination >> 3) & 0x3FFF; // 14 bits
        let leading_digit = (combination & 0x7) as u128; // 0-7
        let trailing = bits & ((1u128 << 110) - 1);
        let coefficient = leading_digit
            .checked_shl(110)
            .map(|v| v | trailing)
            .unwrap_or(trailing);
        let exponent = exponent_bits as i32 - 6176;

        Some(DecodedDecimal {
            negative,
            exponent,
            coefficient,
        })
    }
}

impl PartialOrd for Decimal128 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal128 {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.decode(), other.decode()) {
            (Some(a), Some(b)) => {
                let ord = match (a.negative, b.negative) {
                    (false, true) => Ordering::Greater,
                    (true, false) => Ordering::Less,
                    (neg, _) => {
                        // Align exponents by widening the smaller-exponent
                        // coefficient before comparing magnitudes.
                        let magnitude_ord = if a.exponent == b.exponent {
                            a.coefficient.cmp(&b.coefficient)
                        } else if a.exponent > b.exponent {
                            let scale = (a.exponent - b.exponent) as u32;
                            match a.coefficient.checked_mul(10u128.saturating_pow(scale)) {
                                Some(scaled) => scaled.cmp(&b.coefficient),
                                None => Ordering::Greater,
                            }
                        } else {
                            let scale = (b.exponent - a.exponent) as u32;
                            match b.coefficient.checked_mul(10u128.saturating_pow(scale)) {
                                Some(scaled) => a.coefficient.cmp(&scaled),
                                None => Ordering::Less,
                            }
                        };
                        if neg {
                            magnitude_ord.reverse()
                        } else {
                            magnitude_ord
                        }
                    }
                };
                ord
            }
            _ => {
                let mut a = self.0;
                let mut b = other.0;
                a.reverse();
                b.reverse();
                a.cmp(&b)
            }
        }
    }
}

/// One of the closed set of variants a stored value can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    Double(f64),
    Decimal128(Decimal128),
    String(String),
    /// UTC milliseconds since epoch.
    DateTime(i64),
    ObjectId(ObjectId),
    Binary { subtype: u8, data: Vec<u8> },
    Document(Document),
    Array(Vec<Value>),
    Regex { pattern: String, options: String },
    Timestamp { increment: u32, seconds: u32 },
    MinKey,
    MaxKey,
}

impl Value {
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
            Value::Document(_) => TAG_DOCUMENT,
            Value::Array(_) => TAG_ARRAY,
            Value::Binary { .. } => TAG_BINARY,
            Value::ObjectId(_) => TAG_OBJECT_ID,
            Value::Bool(_) => TAG_BOOL,
            Value::DateTime(_) => TAG_DATETIME,
            Value::Null => TAG_NULL,
            Value::Regex { .. } => TAG_REGEX,
            Value::I32(_) => TAG_INT32,
            Value::Timestamp { .. } => TAG_TIMESTAMP,
            Value::I64(_) => TAG_INT64,
            Value::Decimal128(_) => TAG_DECIMAL128,
            Value::MinKey => TAG_MIN_KEY,
            Value::MaxKey => TAG_MAX_KEY,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::I32(_) | Value::I64(_) | Value::Double(_) | Value::Decimal128(_)
        )
    }

    /// Canonical cross-type ordering bucket. Numbers of every width share a
    /// bucket so `compare` can widen within it; this is the "tag" ordering
    /// spec §3.1 refers to, made explicit since the wire type-tag bytes
    /// themselves are not monotonic with the intended sort order (e.g.
    /// min-key's tag 0xFF is numerically larger than max-key's 0x7F).
    fn type_rank(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Null => 1,
            Value::I32(_) | Value::I64(_) | Value::Double(_) | Value::Decimal128(_) => 2,
            Value::String(_) => 3,
            Value::Document(_) => 4,
            Value::Array(_) => 5,
            Value::Binary { .. } => 6,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::DateTime(_) => 9,
            Value::Timestamp { .. } => 10,
            Value::Regex { .. } => 11,
            Value::MaxKey => 12,
        }
    }

    /// Total order over values, used for document equality, index keys, and
    /// the B+tree's strict-ascending invariant.
    pub fn compare(&self, other: &Value) -> Ordering {
        if self.is_numeric() && other.is_numeric() {
            return compare_numeric(self, other);
        }

        let rank_ord = self.type_rank().cmp(&other.type_rank());
        if rank_ord != Ordering::Equal {
            return rank_ord;
        }

        match (self, other) {
            (Value::MinKey, Value::MinKey) => Ordering::Equal,
            (Value::MaxKey, Value::MaxKey) => Ordering::Equal,
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Document(a), Value::Document(b)) => a.compare(b),
            (Value::Array(a), Value::Array(b)) => compare_slices(a, b),
            (
                Value::Binary { subtype: st_a, data: a },
                Value::Binary { subtype: st_b, data: b },
            ) => st_a.cmp(st_b).then_with(|| a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (
                Value::Timestamp { increment: ia, seconds: sa },
                Value::Timestamp { increment: ib, seconds: sb },
            ) => sa.cmp(sb).then_with(|| ia.cmp(ib)),
            (
                Value::Regex { pattern: pa, options: oa },
                Value::Regex { pattern: pb, options: ob },
            ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),
            _ => Ordering::Equal,
        }
    }
}

fn compare_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.compare(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (I32(x), I32(y)) => x.cmp(y),
        (I64(x), I64(y)) => x.cmp(y),
        (I32(x), I64(y)) => (*x as i64).cmp(y),
        (I64(x), I32(y)) => x.cmp(&(*y as i64)),
        (Decimal128(x), Decimal128(y)) => x.cmp(y),
        (Double(x), Double(y)) => x.total_cmp(y),
        (I32(x), Double(y)) => (*x as f64).total_cmp(y),
        (Double(x), I32(y)) => x.total_cmp(&(*y as f64)),
        (I64(x), Double(y)) => (*x as f64).total_cmp(y),
        (Double(x), I64(y)) => x.total_cmp(&(*y as f64)),
        (Decimal128(x), I32(y)) | (Decimal128(x), I64(y)) => {
            let y_val = match b {
                I32(v) => *v as f64,
                I64(v) => *v as f64,
                _ => unreachable!(),
            };
            decimal_as_f64(x).total_cmp(&y_val)
        }
        (I32(x), Decimal128(y)) => (*x as f64).total_cmp(&decimal_as_f64(y)),
        (I64(x), Decimal128(y)) => (*x as f64).total_cmp(&decimal_as_f64(y)),
        (Decimal128(x), Double(y)) => decimal_as_f64(x).total_cmp(y),
        (Double(x), Decimal128(y)) => x.total_cmp(&decimal_as_f64(y)),
    }
}

fn decimal_as_f64(d: &Decimal128) -> f64 {
    match d.decode() {
        Some(dec) => {
            let mag = dec.coefficient as f64 * 10f64.powi(dec.exponent);
            if dec.negative {
                -mag
            } else {
                mag
            }
        }
        None => 0.0,
    }
}

/// An ordered mapping of unique UTF-8 keys to values (spec §3.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Inserts a key, replacing any prior value for the same key in place
    /// (preserving its original position).
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(existing) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Inserts a key, failing if it is already present (used when decoding
    /// a document off disk, where a duplicate key is `InvalidArgument`).
    pub fn insert_unique(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(DbError::InvalidArgument(format!("duplicate key {key:?}")));
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get_id(&self) -> Option<&Value> {
        self.get("_id")
    }

    /// Documents are equal iff they have the same set of keys mapping to
    /// pairwise equal values, regardless of insertion order.
    fn sorted_entries(&self) -> Vec<(&str, &Value)> {
        let mut v: Vec<(&str, &Value)> = self.entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        v.sort_by(|a, b| a.0.cmp(b.0));
        v
    }

    /// Compares two documents by their entries sorted by key. This both
    /// implements the strict total order the B+tree requires and stays
    /// consistent with the key-order-independent equality above; spec
    /// §3.1's literal "insertion order of the left operand" wording would
    /// not guarantee that consistency (see DESIGN.md).
    fn compare(&self, other: &Document) -> Ordering {
        let a = self.sorted_entries();
        let b = other.sorted_entries();
        for (x, y) in a.iter().zip(b.iter()) {
            let key_ord = x.0.cmp(y.0);
            if key_ord != Ordering::Equal {
                return key_ord;
            }
            let val_ord = x.1.compare(y.1);
            if val_ord != Ordering::Equal {
                return val_ord;
            }
        }
        a.len().cmp(&b.len())
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}
impl Eq for Document {}

// --- Binary encoding (spec §6.1) -------------------------------------------------

fn push_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn read_cstring(buf: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DbError::Corruption("unterminated cstring".to_string()))?;
    let s = std::str::from_utf8(&buf[start..start + end])
        .map_err(|e| DbError::Corruption(format!("invalid utf8: {e}")))?
        .to_string();
    *pos = start + end + 1;
    Ok(s)
}

fn encode_element_payload(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Double(d) => buf.extend_from_slice(&d.to_le_bytes()),
        Value::String(s) => {
            let len = (s.len() + 1) as i32;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        Value::Document(doc) => buf.extend_from_slice(&encode_document(doc)?),
        Value::Array(items) => {
            let mut doc = Document::new();
            for (i, item) in items.iter().enumerate() {
                doc.insert(i.to_string(), item.clone());
            }
            buf.extend_from_slice(&encode_document(&doc)?);
        }
        Value::Binary { subtype, data } => {
            buf.extend_from_slice(&(data.len() as i32).to_le_bytes());
            buf.push(*subtype);
            buf.extend_from_slice(data);
        }
        Value::ObjectId(oid) => buf.extend_from_slice(&oid.0),
        Value::Bool(b) => buf.push(if *b { 1 } else { 0 }),
        Value::DateTime(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        Value::Null => {}
        Value::Regex { pattern, options } => {
            push_cstring(buf, pattern);
            push_cstring(buf, options);
        }
        Value::I32(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Timestamp { increment, seconds } => {
            buf.extend_from_slice(&increment.to_le_bytes());
            buf.extend_from_slice(&seconds.to_le_bytes());
        }
        Value::I64(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Decimal128(d) => buf.extend_from_slice(&d.0),
        Value::MinKey | Value::MaxKey => {}
    }
    Ok(())
}

fn decode_element_payload(tag: u8, buf: &[u8], pos: &mut usize) -> Result<Value> {
    let need = |n: usize, buf: &[u8], pos: usize| -> Result<()> {
        if pos + n > buf.len() {
            return Err(DbError::Corruption("truncated element payload".to_string()));
        }
        Ok(())
    };
    match tag {
        TAG_DOUBLE => {
            need(8, buf, *pos)?;
            let v = f64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            Ok(Value::Double(v))
        }
        TAG_STRING => {
            need(4, buf, *pos)?;
            let len = i32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
            *pos += 4;
            need(len, buf, *pos)?;
            if len == 0 {
                return Err(DbError::Corruption("zero-length string field".to_string()));
            }
            let s = std::str::from_utf8(&buf[*pos..*pos + len - 1])
                .map_err(|e| DbError::Corruption(format!("invalid utf8: {e}")))?
                .to_string();
            *pos += len;
            Ok(Value::String(s))
        }
        TAG_DOCUMENT => {
            let (doc, consumed) = decode_document_at(buf, *pos)?;
            *pos += consumed;
            Ok(Value::Document(doc))
        }
        TAG_ARRAY => {
            let (doc, consumed) = decode_document_at(buf, *pos)?;
            *pos += consumed;
            let mut items: Vec<(usize, Value)> = Vec::with_capacity(doc.len());
            for (k, v) in doc.iter() {
                let idx: usize = k
                    .parse()
                    .map_err(|_| DbError::Corruption(format!("non-numeric array index {k:?}")))?;
                items.push((idx, v.clone()));
            }
            items.sort_by_key(|(i, _)| *i);
            Ok(Value::Array(items.into_iter().map(|(_, v)| v).collect()))
        }
        TAG_BINARY => {
            need(5, buf, *pos)?;
            let len = i32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
            let subtype = buf[*pos + 4];
            *pos += 5;
            need(len, buf, *pos)?;
            let data = buf[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(Value::Binary { subtype, data })
        }
        TAG_OBJECT_ID => {
            need(12, buf, *pos)?;
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(&buf[*pos..*pos + 12]);
            *pos += 12;
            Ok(Value::ObjectId(ObjectId(bytes)))
        }
        TAG_BOOL => {
            need(1, buf, *pos)?;
            let v = buf[*pos] != 0;
            *pos += 1;
            Ok(Value::Bool(v))
        }
        TAG_DATETIME => {
            need(8, buf, *pos)?;
            let v = i64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            Ok(Value::DateTime(v))
        }
        TAG_NULL => Ok(Value::Null),
        TAG_REGEX => {
            let pattern = read_cstring(buf, pos)?;
            let options = read_cstring(buf, pos)?;
            Ok(Value::Regex { pattern, options })
        }
        TAG_INT32 => {
            need(4, buf, *pos)?;
            let v = i32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            Ok(Value::I32(v))
        }
        TAG_TIMESTAMP => {
            need(8, buf, *pos)?;
            let increment = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
            let seconds = u32::from_le_bytes(buf[*pos + 4..*pos + 8].try_into().unwrap());
            *pos += 8;
            Ok(Value::Timestamp { increment, seconds })
        }
        TAG_INT64 => {
            need(8, buf, *pos)?;
            let v = i64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            Ok(Value::I64(v))
        }
        TAG_DECIMAL128 => {
            need(16, buf, *pos)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&buf[*pos..*pos + 16]);
            *pos += 16;
            Ok(Value::Decimal128(Decimal128(bytes)))
        }
        TAG_MIN_KEY => Ok(Value::MinKey),
        TAG_MAX_KEY => Ok(Value::MaxKey),
        other => Err(DbError::Corruption(format!("unknown type tag 0x{other:02X}"))),
    }
}

/// Encodes a document into its stable binary form.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for (key, value) in doc.iter() {
        body.push(value.type_tag());
        push_cstring(&mut body, key);
        encode_element_payload(&mut body, value)?;
    }
    let total_len = 4 + body.len() + 1;
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as i32).to_le_bytes());
    out.extend_from_slice(&body);
    out.push(0);
    Ok(out)
}

/// Decodes a document from the start of `bytes`, returning it alone (erroring
/// if trailing bytes remain).
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let (doc, consumed) = decode_document_at(bytes, 0)?;
    if consumed != bytes.len() {
        return Err(DbError::Corruption(format!(
            "trailing bytes after document: consumed {consumed} of {}",
            bytes.len()
        )));
    }
    Ok(doc)
}

/// Decodes a document starting at `start`, returning it with the number of
/// bytes consumed (so callers can decode back-to-back documents, e.g. array
/// elements or page slots).
pub fn decode_document_at(bytes: &[u8], start: usize) -> Result<(Document, usize)> {
    if start + 4 > bytes.len() {
        return Err(DbError::Corruption("truncated document length".to_string()));
    }
    let total_len = i32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
    if total_len < 5 {
        return Err(DbError::Corruption(format!("impossible document length {total_len}")));
    }
    let total_len = total_len as usize;
    if start + total_len > bytes.len() {
        return Err(DbError::Corruption("document length exceeds buffer".to_string()));
    }
    if bytes[start + total_len - 1] != 0 {
        return Err(DbError::Corruption("document missing terminator".to_string()));
    }

    let mut doc = Document::new();
    let mut pos = start + 4;
    let end = start + total_len - 1;
    while pos < end {
        let tag = bytes[pos];
        pos += 1;
        let key = read_cstring(bytes, &mut pos)?;
        let value = decode_element_payload(tag, bytes, &mut pos)?;
        doc.insert_unique(key, value)?;
    }
    if pos != end {
        return Err(DbError::Corruption("element overran document body".to_string()));
    }
    Ok((doc, total_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_document() -> Document {
        let mut doc = Document::new();
        doc.insert("_id", Value::ObjectId(ObjectId::new()));
        doc.insert("name", Value::String("alice".to_string()));
        doc.insert("age", Value::I32(30));
        doc.insert("balance", Value::Double(12.5));
        doc.insert("active", Value::Bool(true));
        doc.insert(
            "tags",
            Value::Array(vec![Value::String("a".to_string()), Value::String("b".to_string())]),
        );
        doc.insert("meta", Value::Null);
        doc
    }

    #[test]
    fn round_trip_document() {
        let doc = sample_document();
        let encoded = encode_document(&doc).unwrap();
        let decoded = decode_document(&encoded).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn duplicate_keys_rejected_on_insert_unique() {
        let mut doc = Document::new();
        doc.insert_unique("a", Value::I32(1)).unwrap();
        assert!(doc.insert_unique("a", Value::I32(2)).is_err());
    }

    #[test]
    fn document_equality_ignores_key_order() {
        let mut a = Document::new();
        a.insert("x", Value::I32(1));
        a.insert("y", Value::I32(2));

        let mut b = Document::new();
        b.insert("y", Value::I32(2));
        b.insert("x", Value::I32(1));

        assert_eq!(a, b);
    }

    #[test]
    fn numeric_widening_orders_across_subtypes() {
        assert_eq!(Value::I32(5).compare(&Value::I64(5)), Ordering::Equal);
        assert_eq!(Value::I32(4).compare(&Value::Double(5.0)), Ordering::Less);
        assert_eq!(Value::Double(5.5).compare(&Value::I32(5)), Ordering::Greater);
    }

    #[test]
    fn type_rank_orders_min_and_max_key() {
        assert_eq!(Value::MinKey.compare(&Value::Null), Ordering::Less);
        assert_eq!(Value::MaxKey.compare(&Value::Regex { pattern: "x".into(), options: "".into() }), Ordering::Greater);
    }

    #[test]
    fn array_encoding_preserves_order() {
        let arr = Value::Array(vec![Value::I32(3), Value::I32(1), Value::I32(2)]);
        let mut doc = Document::new();
        doc.insert("values", arr.clone());
        let encoded = encode_document(&doc).unwrap();
        let decoded = decode_document(&encoded).unwrap();
        assert_eq!(decoded.get("values"), Some(&arr));
    }

    proptest::proptest! {
        // spec §8.1 invariant 1: decode(encode(D)) == D for any document
        // with no duplicate keys.
        #[test]
        fn round_trip_arbitrary_scalar_documents(
            name in "[a-zA-Z0-9_]{1,12}",
            age in any::<i32>(),
            score in any::<f64>().prop_filter("finite", |f| f.is_finite()),
            active in any::<bool>(),
            note in ".{0,40}",
        ) {
            let mut doc = Document::new();
            doc.insert("name", Value::String(name));
            doc.insert("age", Value::I32(age));
            doc.insert("score", Value::Double(score));
            doc.insert("active", Value::Bool(active));
            doc.insert("note", Value::String(note));
            let encoded = encode_document(&doc).unwrap();
            let decoded = decode_document(&encoded).unwrap();
            prop_assert_eq!(doc, decoded);
        }

        #[test]
        fn i64_ordering_matches_compare(a in any::<i64>(), b in any::<i64>()) {
            let expected = a.cmp(&b);
            prop_assert_eq!(Value::I64(a).compare(&Value::I64(b)), expected);
        }
    }
}
