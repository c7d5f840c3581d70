//! The seam between raw lines and structured records.
//!
//! Rule compilation and matching live behind the [`Normalizer`] trait; the
//! engine only relies on the mapping being pure and synchronous. Records
//! are JSON objects and serialize to exactly one line — a compact JSON
//! document cannot contain a raw newline.

use std::io;

use serde_json::Value;

use crate::source::Line;

/// A structured record produced from one raw line.
pub type Record = serde_json::Map<String, Value>;

/// Turns a raw line into a structured record, or drops it.
///
/// `None` means the line matched no rule; the engine silently discards it —
/// the normalizer is the filter.
pub trait Normalizer: std::fmt::Debug + Send {
    /// Map one raw line to a record, or `None` to drop it.
    fn normalize(&self, line: &[u8]) -> Option<Record>;
}

/// The identity rulebase: every line becomes `{"message": "<line>"}`.
///
/// Used by the stdio debugging mode and wherever no real rulebase is
/// loaded. Invalid UTF-8 is replaced rather than dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Normalizer for Passthrough {
    fn normalize(&self, line: &[u8]) -> Option<Record> {
        let mut record = Record::new();
        record.insert(
            "message".to_owned(),
            Value::String(String::from_utf8_lossy(line).into_owned()),
        );
        Some(record)
    }
}

/// Serialize a record to its single-line wire form (no trailing newline).
pub fn serialize(record: &Record) -> io::Result<Line> {
    serde_json::to_vec(record).map_err(io::Error::from)
}
