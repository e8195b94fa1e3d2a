//! Memory entries and the replica metadata attached to them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::timestamp;

/// Identifier used when an entry carries no `id`.
pub const UNKNOWN_ID: &str = "unknown";

/// Host recorded on synthetic metadata for entries that arrived without any.
pub const RECOVERY_HOST: &str = "recovery";

/// Per-entry replica metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    /// Host that last wrote the entry.
    pub host: String,
    /// ISO-8601 write time, stored verbatim.
    pub timestamp: String,
    /// Number of times this entry has been stamped.
    pub version: u64,
    /// Tiebreaker for writes with identical timestamps.
    pub unique_id: String,
}

impl ReplicaMetadata {
    /// Metadata for an entry that was seen without any.
    ///
    /// The epoch timestamp guarantees it loses against every real write.
    pub fn recovery(entry_id: &str) -> Self {
        let timestamp = timestamp::epoch();
        Self {
            unique_id: unique_id(RECOVERY_HOST, entry_id, &timestamp),
            host: RECOVERY_HOST.to_string(),
            timestamp,
            version: 0,
        }
    }

    /// Parsed write time.
    pub fn instant(&self) -> DateTime<Utc> {
        timestamp::parse(&self.timestamp)
    }

    pub fn is_recovery(&self) -> bool {
        self.host == RECOVERY_HOST
    }
}

/// Build a unique id from host, entry id, timestamp and 64 fresh random bits.
///
/// The random suffix is always present: two writes on one host within the
/// same clock tick must still get distinct ids.
pub fn unique_id(host: &str, entry_id: &str, timestamp: &str) -> String {
    format!("{host}:{entry_id}:{timestamp}:{:016x}", random_u64())
}

/// 64 uniformly random bits from a v4 UUID.
///
/// Each half of a v4 UUID has fixed bits (version nibble, variant bits) at
/// positions where the other half is random, so XOR-ing them leaves none.
fn random_u64() -> u64 {
    let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
    hi ^ lo
}

/// Identity of an entry, in the JSON type it was written with.
///
/// Ids serialize back unchanged, and identity is type-aware: the number `1`
/// and the string `"1"` are different entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Text(String),
    Number(Number),
    Bool(bool),
    Null,
    /// No `id` field at all. Shares identity with the text id [`UNKNOWN_ID`].
    Missing,
}

impl EntryId {
    fn from_json(raw: Option<Value>) -> Result<Self, EntryShapeError> {
        match raw {
            None => Ok(EntryId::Missing),
            Some(Value::Null) => Ok(EntryId::Null),
            Some(Value::String(s)) => Ok(EntryId::Text(s)),
            Some(Value::Number(n)) => Ok(EntryId::Number(n)),
            Some(Value::Bool(b)) => Ok(EntryId::Bool(b)),
            Some(other) => Err(EntryShapeError::InvalidId(kind_of(&other))),
        }
    }

    fn to_json(&self) -> Option<Value> {
        match self {
            EntryId::Text(s) => Some(Value::String(s.clone())),
            EntryId::Number(n) => Some(Value::Number(n.clone())),
            EntryId::Bool(b) => Some(Value::Bool(*b)),
            EntryId::Null => Some(Value::Null),
            EntryId::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, EntryId::Missing)
    }

    /// The id when it is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntryId::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Merge key, tagged with the JSON type.
    pub fn key(&self) -> String {
        match self {
            EntryId::Text(s) => format!("s:{s}"),
            EntryId::Missing => format!("s:{UNKNOWN_ID}"),
            EntryId::Number(n) => format!("n:{n}"),
            EntryId::Bool(b) => format!("b:{b}"),
            EntryId::Null => "null".to_string(),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Text(s) => f.write_str(s),
            EntryId::Number(n) => write!(f, "{n}"),
            EntryId::Bool(b) => write!(f, "{b}"),
            EntryId::Null => f.write_str("null"),
            EntryId::Missing => f.write_str(UNKNOWN_ID),
        }
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId::Text(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId::Text(s)
    }
}

impl From<u64> for EntryId {
    fn from(n: u64) -> Self {
        EntryId::Number(n.into())
    }
}

impl From<i64> for EntryId {
    fn from(n: i64) -> Self {
        EntryId::Number(n.into())
    }
}

impl From<bool> for EntryId {
    fn from(b: bool) -> Self {
        EntryId::Bool(b)
    }
}

impl PartialEq<str> for EntryId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == Some(other)
    }
}

impl PartialEq<&str> for EntryId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EntryId::Text(s) => serializer.serialize_str(s),
            EntryId::Number(n) => n.serialize(serializer),
            EntryId::Bool(b) => serializer.serialize_bool(*b),
            EntryId::Null | EntryId::Missing => serializer.serialize_unit(),
        }
    }
}

/// A single memory record.
///
/// `extra` holds every field other than `id` and `metadata` so unknown keys
/// survive a load/save cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryEntry {
    #[serde(skip_serializing_if = "EntryId::is_missing")]
    pub id: EntryId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReplicaMetadata>,
}

/// Why a JSON value could not be read as an entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryShapeError {
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),

    #[error("entry id must be a string, number or boolean, found {0}")]
    InvalidId(&'static str),
}

impl MemoryEntry {
    pub fn new(id: impl Into<EntryId>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
            metadata: None,
        }
    }

    /// Add an arbitrary field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, metadata: ReplicaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Field lookup over the open part of the record.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Decode an entry from a JSON value.
    ///
    /// The `id` keeps its JSON type; a missing `id` is keyed as
    /// [`UNKNOWN_ID`] but stays absent on output. A `metadata` object that
    /// does not have the expected shape is dropped, so the entry is treated
    /// as never stamped.
    pub fn from_value(value: Value) -> Result<Self, EntryShapeError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(EntryShapeError::NotAnObject(kind_of(&other))),
        };

        let id = EntryId::from_json(map.remove("id"))?;

        let metadata = match map.remove("metadata") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value::<ReplicaMetadata>(raw) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "discarding malformed metadata");
                    None
                }
            },
        };

        Ok(Self {
            id,
            extra: map,
            metadata,
        })
    }

    /// Encode back into a JSON value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.extra.len() + 2);
        if let Some(id) = self.id.to_json() {
            map.insert("id".to_string(), id);
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        if let Some(meta) = &self.metadata {
            map.insert(
                "metadata".to_string(),
                serde_json::json!({
                    "host": meta.host,
                    "timestamp": meta.timestamp,
                    "version": meta.version,
                    "unique_id": meta.unique_id,
                }),
            );
        }
        Value::Object(map)
    }
}

impl<'de> Deserialize<'de> for MemoryEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        MemoryEntry::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// One replica's entries: a single host file or one side of a conflict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaEntryList {
    /// Where the entries came from, for log lines and error messages.
    pub label: String,
    pub entries: Vec<MemoryEntry>,
    /// Elements that could not be read as entries.
    pub skipped: usize,
}

impl ReplicaEntryList {
    pub fn new(label: impl Into<String>, entries: Vec<MemoryEntry>) -> Self {
        Self {
            label: label.into(),
            entries,
            skipped: 0,
        }
    }

    /// Decode a JSON array, skipping elements that are not entry objects.
    pub fn from_values(label: impl Into<String>, values: Vec<Value>) -> Self {
        let label = label.into();
        let mut entries = Vec::with_capacity(values.len());
        let mut skipped = 0;
        for (index, value) in values.into_iter().enumerate() {
            match MemoryEntry::from_value(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(source = %label, index, error = %e, "skipping non-entry element");
                    skipped += 1;
                }
            }
        }
        Self {
            label,
            entries,
            skipped,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialise entries as the pretty JSON array stored in memory files.
pub fn to_json_array(entries: &[MemoryEntry]) -> serde_json::Result<String> {
    let mut out = serde_json::to_string_pretty(entries)?;
    out.push('\n');
    Ok(out)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_roundtrip() {
        let raw = json!({
            "id": "m1",
            "content": "x",
            "tags": ["a", "b"],
            "nested": {"score": 0.5}
        });
        let entry = MemoryEntry::from_value(raw.clone()).unwrap();
        assert_eq!(entry.id, "m1");
        assert_eq!(entry.field("content"), Some(&json!("x")));
        assert!(entry.metadata.is_none());
        assert_eq!(entry.to_value(), raw);
    }

    #[test]
    fn test_metadata_is_parsed() {
        let entry = MemoryEntry::from_value(json!({
            "id": "m1",
            "metadata": {
                "host": "h1",
                "timestamp": "2024-01-01T00:00:00+00:00",
                "version": 2,
                "unique_id": "h1:m1:x:0001"
            }
        }))
        .unwrap();
        let meta = entry.metadata.unwrap();
        assert_eq!(meta.host, "h1");
        assert_eq!(meta.version, 2);
    }

    #[test]
    fn test_malformed_metadata_is_dropped() {
        let entry =
            MemoryEntry::from_value(json!({"id": "m1", "metadata": {"host": 3}})).unwrap();
        assert!(entry.metadata.is_none());
        assert!(entry.field("metadata").is_none());
    }

    #[test]
    fn test_missing_id_is_keyed_unknown_but_not_written() {
        let missing = MemoryEntry::from_value(json!({"content": "x"})).unwrap();
        assert_eq!(missing.id, EntryId::Missing);
        assert_eq!(missing.id.to_string(), UNKNOWN_ID);
        assert_eq!(missing.id.key(), EntryId::from(UNKNOWN_ID).key());
        assert_eq!(missing.to_value(), json!({"content": "x"}));
    }

    #[test]
    fn test_non_string_ids_keep_their_type() {
        for raw in [
            json!({"id": 42, "content": "x"}),
            json!({"id": 1.5}),
            json!({"id": true}),
            json!({"id": null}),
        ] {
            let entry = MemoryEntry::from_value(raw.clone()).unwrap();
            assert_eq!(entry.to_value(), raw);
            assert_eq!(serde_json::to_value(&entry).unwrap(), raw);
        }

        let bad = MemoryEntry::from_value(json!({"id": ["nope"]}));
        assert_eq!(bad, Err(EntryShapeError::InvalidId("array")));
    }

    #[test]
    fn test_number_and_string_ids_are_distinct() {
        let number = MemoryEntry::from_value(json!({"id": 1})).unwrap();
        let text = MemoryEntry::from_value(json!({"id": "1"})).unwrap();
        assert_ne!(number.id, text.id);
        assert_ne!(number.id.key(), text.id.key());
        assert_eq!(number.id.to_string(), text.id.to_string());
    }

    #[test]
    fn test_non_objects_are_skipped() {
        let list = ReplicaEntryList::from_values(
            "test",
            vec![json!({"id": "a"}), json!(7), json!("str"), json!({"id": "b"})],
        );
        assert_eq!(list.len(), 2);
        assert_eq!(list.skipped, 2);
    }

    #[test]
    fn test_recovery_metadata_is_epoch() {
        let meta = ReplicaMetadata::recovery("m1");
        assert!(meta.is_recovery());
        assert_eq!(meta.instant(), DateTime::<Utc>::UNIX_EPOCH);
        assert!(meta.unique_id.starts_with("recovery:m1:"));
    }

    #[test]
    fn test_unique_id_suffix_has_no_fixed_bits() {
        let mut ones = 0u64;
        let mut zeros = 0u64;
        for _ in 0..512 {
            let id = unique_id("h", "m", "t");
            let suffix = id.rsplit(':').next().unwrap();
            assert_eq!(suffix.len(), 16);
            let bits = u64::from_str_radix(suffix, 16).unwrap();
            ones |= bits;
            zeros |= !bits;
        }
        assert_eq!(ones, u64::MAX, "bits never set: {:016x}", !ones);
        assert_eq!(zeros, u64::MAX, "bits never cleared: {:016x}", !zeros);
    }

    #[test]
    fn test_unique_ids_differ_for_identical_inputs() {
        let a = unique_id("h1", "m1", "2024-01-01T00:00:00+00:00");
        let b = unique_id("h1", "m1", "2024-01-01T00:00:00+00:00");
        assert_ne!(a, b);
    }

    #[test]
    fn test_deserialize_via_serde() {
        let entries: Vec<MemoryEntry> =
            serde_json::from_str(r#"[{"id":"a","x":1},{"id":"b"}]"#).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].field("x"), Some(&json!(1)));
    }

    #[test]
    fn test_json_array_has_trailing_newline() {
        let out = to_json_array(&[MemoryEntry::new("a")]).unwrap();
        assert!(out.ends_with("]\n"));
    }
}
