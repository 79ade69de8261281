//! Compliance Records
//!
//! A record is one resource's describe output as emitted by the compliance
//! job, stamped with the logical date and key of the batch it was read from.

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ReportError, Result};

/// Field injected into every record on fetch
pub const BATCH_DATE_FIELD: &str = "BatchDate";

/// Field naming the object key or file a record was read from
pub const BATCH_KEY_FIELD: &str = "BatchKey";

/// Field holding the `{Key, Value}` tag sequence
pub const TAGS_FIELD: &str = "Tags";

/// A single resource snapshot plus its batch date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(
        rename = "BatchDate",
        skip_serializing_if = "Option::is_none"
    )]
    batch_date: Option<DateTime<Utc>>,
    #[serde(
        rename = "BatchKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    batch_key: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            batch_date: None,
            batch_key: None,
            fields,
        }
    }

    /// Stamp the record with the date of its batch
    pub fn with_batch_date(mut self, date: DateTime<Utc>) -> Self {
        self.batch_date = Some(date);
        self
    }

    pub fn batch_date(&self) -> Option<DateTime<Utc>> {
        self.batch_date
    }

    /// Record where the batch came from
    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        self.batch_key = Some(key.into());
        self
    }

    pub fn batch_key(&self) -> Option<&str> {
        self.batch_key.as_deref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Look up a nested value by a `.`-separated path, e.g. `State.Name`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        parts.try_fold(self.fields.get(first)?, |value, part| value.get(part))
    }

    /// Render a field as a report cell; `None` if the field is absent
    pub fn cell(&self, field: &str) -> Option<String> {
        self.fields.get(field).map(value_to_cell)
    }

    /// Build the tag key → value mapping from the `Tags` field
    pub fn tag_map(&self) -> TagMap {
        let mut tags = HashMap::new();
        if let Some(entries) = self.fields.get(TAGS_FIELD).and_then(Value::as_array) {
            for entry in entries {
                let key = entry.get("Key").and_then(Value::as_str);
                let value = entry.get("Value").map(value_to_cell);
                if let (Some(key), Some(value)) = (key, value) {
                    tags.insert(key.to_string(), value);
                }
            }
        }
        TagMap(tags)
    }
}

/// Convert a JSON value into the text written to a CSV cell
pub fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tag key → value mapping derived from a record's tag collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap(HashMap<String, String>);

impl TagMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Tag value, or the empty string when the tag is absent
    pub fn get_or_empty(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Records read from one archive object or snapshot file
#[derive(Debug, Clone)]
pub struct Batch {
    /// Object key or file path the batch came from
    pub key: String,
    /// Logical date shared by every record in the batch
    pub date: DateTime<Utc>,
    pub records: Vec<Record>,
}

impl Batch {
    /// Parse a JSON array of record objects and stamp each with `date` and `key`
    pub fn parse<R: Read>(key: impl Into<String>, date: DateTime<Utc>, reader: R) -> Result<Self> {
        let key = key.into();
        let array: Vec<Value> =
            serde_json::from_reader(reader).map_err(|e| ReportError::malformed_batch(&key, e))?;

        let mut records = Vec::with_capacity(array.len());
        for (i, value) in array.into_iter().enumerate() {
            match value {
                Value::Object(fields) => records.push(
                    Record::new(fields)
                        .with_batch_date(date)
                        .with_batch_key(key.as_str()),
                ),
                other => {
                    return Err(ReportError::malformed_batch(
                        &key,
                        format!("element {} is not an object: {}", i, type_name(&other)),
                    ))
                }
            }
        }

        Ok(Self { key, date, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The merged record set for one report run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordCollection {
    records: Vec<Record>,
}

impl RecordCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch; order across batches is not meaningful
    pub fn absorb(&mut self, batch: Batch) {
        self.records.extend(batch.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.records
    }

    pub fn into_inner(self) -> Vec<Record> {
        self.records
    }
}

impl From<Vec<Record>> for RecordCollection {
    fn from(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl<'a> IntoIterator for &'a RecordCollection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Cursor;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(fields) => Record::new(fields),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_tag_map() {
        let rec = record(json!({
            "InstanceId": "i-1",
            "Tags": [
                {"Key": "Name", "Value": "web"},
                {"Key": "ASV", "Value": "payments"}
            ]
        }));

        let tags = rec.tag_map();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("Name"), Some("web"));
        assert_eq!(tags.get_or_empty("OwnerContact"), "");
    }

    #[test]
    fn test_tag_map_without_tags() {
        let rec = record(json!({"Name": "bucket"}));
        assert!(rec.tag_map().is_empty());
    }

    #[test]
    fn test_nested_path_lookup() {
        let rec = record(json!({"State": {"Name": "running", "Code": 16}}));
        assert_eq!(rec.get_path("State.Name"), Some(&json!("running")));
        assert_eq!(rec.get_path("State.Missing"), None);
    }

    #[test]
    fn test_cell_rendering() {
        let rec = record(json!({"s": "text", "n": 3, "b": true, "z": null}));
        assert_eq!(rec.cell("s").as_deref(), Some("text"));
        assert_eq!(rec.cell("n").as_deref(), Some("3"));
        assert_eq!(rec.cell("b").as_deref(), Some("true"));
        assert_eq!(rec.cell("z").as_deref(), Some(""));
        assert_eq!(rec.cell("missing"), None);
    }

    #[test]
    fn test_batch_parse_stamps_date() {
        let date = Utc.with_ymd_and_hms(2016, 1, 2, 0, 0, 0).unwrap();
        let data = r#"[{"InstanceId": "i-1"}, {"InstanceId": "i-2"}]"#;
        let batch = Batch::parse("k", date, Cursor::new(data)).unwrap();

        assert_eq!(batch.len(), 2);
        assert!(batch.records.iter().all(|r| r.batch_date() == Some(date)));
        assert!(batch.records.iter().all(|r| r.batch_key() == Some("k")));
    }

    #[test]
    fn test_batch_parse_rejects_non_objects() {
        let date = Utc::now();
        let err = Batch::parse("bad-key", date, Cursor::new("[1, 2]")).unwrap_err();
        assert!(matches!(err, ReportError::MalformedBatch { ref key, .. } if key == "bad-key"));

        let err = Batch::parse("bad-key", date, Cursor::new("{not json")).unwrap_err();
        assert!(matches!(err, ReportError::MalformedBatch { .. }));
    }

    #[test]
    fn test_record_serializes_batch_date() {
        let date = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let rec = record(json!({"Name": "b"})).with_batch_date(date);
        let value = serde_json::to_value(&rec).unwrap();

        assert_eq!(value["Name"], json!("b"));
        assert_eq!(value[BATCH_DATE_FIELD], json!("2016-01-01T00:00:00Z"));
    }

    #[test]
    fn test_record_restores_batch_date() {
        let date = Utc.with_ymd_and_hms(2016, 1, 1, 6, 0, 0).unwrap();
        let rec = record(json!({"Name": "b", "Tags": []}))
            .with_batch_date(date)
            .with_batch_key("p/2016-01-01-06/resources.json.gz");

        let restored: Record = serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
        assert_eq!(restored.batch_date(), Some(date));
        assert!(restored.get(BATCH_DATE_FIELD).is_none());
        assert_eq!(restored.batch_key(), Some("p/2016-01-01-06/resources.json.gz"));
        assert!(restored.get(BATCH_KEY_FIELD).is_none());
        assert_eq!(restored, rec);
    }

    #[test]
    fn test_collection_absorbs_batches() {
        let date = Utc::now();
        let mut collection = RecordCollection::new();
        collection.absorb(Batch::parse("a", date, Cursor::new(r#"[{"x": 1}]"#)).unwrap());
        collection.absorb(Batch::parse("b", date, Cursor::new(r#"[{"x": 2}, {"x": 3}]"#)).unwrap());
        assert_eq!(collection.len(), 3);
    }
}
