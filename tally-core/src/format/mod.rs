//! Report Formatting
//!
//! A [`Formatter`] owns the per-resource-type policy of a report: which
//! records count, what identifies a resource, and how a record becomes a
//! row of cells. [`format_records`] runs the shared pipeline around it:
//!
//! 1. filter
//! 2. drop records lacking the identifying field
//! 3. newest batch first, ties broken by batch key
//! 4. first record per identity wins
//! 5. project with the record's tag map

mod builtin;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{ReportError, Result};
use crate::record::{value_to_cell, Record, TagMap};

pub use builtin::{AsgFormatter, CfnFormatter, Ec2Formatter, S3Formatter};

/// Tag columns shared by the built-in formatters
pub const TAG_NAME: &str = "Name";
pub const TAG_ASV: &str = "ASV";
pub const TAG_ENVIRONMENT: &str = "CMDBEnvironment";
pub const TAG_OWNER: &str = "OwnerContact";

/// One output row, cells in header order
pub type Row = Vec<String>;

/// Per-resource-type report policy
pub trait Formatter: Send + Sync {
    /// Resource type tag this formatter is registered under
    fn resource_type(&self) -> &str;

    /// Field whose value identifies a resource across batches
    fn id_field(&self) -> &str;

    /// Column headers, in output order
    fn headers(&self) -> &[&'static str];

    /// Whether a record belongs in the report at all
    fn filter(&self, _record: &Record) -> bool {
        true
    }

    /// Turn an accepted record into cells matching [`Formatter::headers`]
    fn project(&self, record: &Record, tags: &TagMap) -> Result<Row>;
}

/// Resource type → formatter lookup
#[derive(Default, Clone)]
pub struct FormatterRegistry {
    formatters: BTreeMap<String, Arc<dyn Formatter>>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `ec2`, `asg`, `s3` and `cfn` formatters
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Ec2Formatter));
        registry.register(Arc::new(AsgFormatter));
        registry.register(Arc::new(S3Formatter));
        registry.register(Arc::new(CfnFormatter));
        registry
    }

    /// Register a formatter, replacing any previous one for its type
    pub fn register(&mut self, formatter: Arc<dyn Formatter>) -> &mut Self {
        self.formatters
            .insert(formatter.resource_type().to_string(), formatter);
        self
    }

    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn Formatter>> {
        self.formatters.get(resource_type).cloned().ok_or_else(|| {
            ReportError::Configuration(format!(
                "No formatter for resource type {}, valid: {}",
                resource_type,
                self.resource_types().join(", ")
            ))
        })
    }

    /// Registered resource types, sorted
    pub fn resource_types(&self) -> Vec<&str> {
        self.formatters.keys().map(String::as_str).collect()
    }
}

/// Run the formatter pipeline over a merged record set
pub fn format_records<'a, I>(formatter: &dyn Formatter, records: I) -> Result<Vec<Row>>
where
    I: IntoIterator<Item = &'a Record>,
{
    let id_field = formatter.id_field();
    let mut total = 0usize;

    let mut accepted: Vec<&Record> = records
        .into_iter()
        .inspect(|_| total += 1)
        .filter(|record| formatter.filter(record))
        .filter(|record| record.get(id_field).is_some())
        .collect();
    debug!(
        resource_type = formatter.resource_type(),
        "Filtered from {} to {}",
        total,
        accepted.len()
    );

    if accepted.iter().any(|record| record.batch_date().is_some()) {
        accepted.sort_by_cached_key(|&record| dedup_order(record));
    }

    let unique = unique_by_id(id_field, accepted);
    debug!(
        resource_type = formatter.resource_type(),
        "Uniqued to {}",
        unique.len()
    );

    unique
        .into_iter()
        .map(|record| formatter.project(record, &record.tag_map()))
        .collect()
}

/// First record for each identifying value, in first-seen order.
///
/// Identity is the JSON value itself, so `1` and `"1"` stay distinct.
fn unique_by_id<'a>(id_field: &str, records: Vec<&'a Record>) -> Vec<&'a Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.get(id_field).map(canonical)))
        .collect()
}

/// Newest batch first, then by batch key so equal dates never depend on
/// merge order. Records from one batch keep their order; records with no
/// batch key fall back to their content.
fn dedup_order(record: &Record) -> (Reverse<Option<DateTime<Utc>>>, Option<&str>, Option<String>) {
    let content = match record.batch_key() {
        Some(_) => None,
        None => Some(canonical(record.fields())),
    };
    (Reverse(record.batch_date()), record.batch_key(), content)
}

/// Stable text form of a JSON value; object keys come out sorted
fn canonical<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Required non-tag field as a cell
pub(crate) fn required(formatter: &dyn Formatter, record: &Record, field: &str) -> Result<String> {
    record
        .get(field)
        .map(value_to_cell)
        .ok_or_else(|| missing(formatter, record, field))
}

pub(crate) fn missing(formatter: &dyn Formatter, record: &Record, field: &str) -> ReportError {
    ReportError::MalformedRecord {
        resource_type: formatter.resource_type().to_string(),
        record_id: record.cell(formatter.id_field()).unwrap_or_default(),
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(fields) => Record::new(fields),
            _ => panic!("expected object"),
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, d, 0, 0, 0).unwrap()
    }

    fn instance(id: &str, name: &str, state: &str, date: DateTime<Utc>) -> Record {
        record(json!({
            "InstanceId": id,
            "InstanceType": "m4.large",
            "LaunchTime": "2015-12-01T00:00:00Z",
            "State": {"Name": state},
            "Tags": [{"Key": "Name", "Value": name}],
        }))
        .with_batch_date(date)
    }

    #[test]
    fn test_registry_lookup() {
        let registry = FormatterRegistry::with_defaults();
        assert_eq!(registry.resource_types(), vec!["asg", "cfn", "ec2", "s3"]);
        assert_eq!(registry.get("ec2").unwrap().id_field(), "InstanceId");

        let err = registry.get("lambda").err().unwrap();
        let message = err.to_string();
        assert!(message.contains("lambda"));
        assert!(message.contains("asg, cfn, ec2, s3"));
    }

    #[test]
    fn test_register_replaces_existing() {
        struct Custom;
        impl Formatter for Custom {
            fn resource_type(&self) -> &str {
                "ec2"
            }
            fn id_field(&self) -> &str {
                "Custom"
            }
            fn headers(&self) -> &[&'static str] {
                &["custom"]
            }
            fn project(&self, record: &Record, _tags: &TagMap) -> Result<Row> {
                Ok(vec![record.cell("Custom").unwrap_or_default()])
            }
        }

        let mut registry = FormatterRegistry::with_defaults();
        registry.register(Arc::new(Custom));
        assert_eq!(registry.get("ec2").unwrap().id_field(), "Custom");
        assert_eq!(registry.resource_types().len(), 4);
    }

    #[test]
    fn test_newest_batch_wins() {
        let records = vec![
            instance("i-1", "web", "running", day(1)),
            instance("i-1", "web2", "running", day(2)),
            instance("i-2", "db", "running", day(1)),
        ];

        let rows = format_records(&Ec2Formatter, &records).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "2016-01-02");
        assert_eq!(rows[0][1], "i-1");
        assert_eq!(rows[0][2], "web2");
        assert_eq!(rows[1][1], "i-2");
    }

    #[test]
    fn test_terminated_instances_excluded() {
        let records = vec![
            instance("i-1", "web", "terminated", day(2)),
            instance("i-2", "db", "running", day(1)),
        ];

        let rows = format_records(&Ec2Formatter, &records).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], "i-2");
    }

    #[test]
    fn test_records_without_id_are_dropped() {
        let records = vec![
            record(json!({"AutoScalingGroupName": "asg-1", "Instances": []})),
            record(json!({"Instances": [1, 2]})),
        ];

        let rows = format_records(&AsgFormatter, &records).unwrap();
        assert_eq!(rows, vec![vec!["asg-1", "0", "", "", ""]]);
    }

    #[test]
    fn test_undated_records_keep_merge_order() {
        let records = vec![
            record(json!({"AutoScalingGroupName": "b", "Instances": [1]})),
            record(json!({"AutoScalingGroupName": "a", "Instances": [1, 2]})),
            record(json!({"AutoScalingGroupName": "b", "Instances": []})),
        ];

        let rows = format_records(&AsgFormatter, &records).unwrap();
        let names: Vec<_> = rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(rows[0][1], "1");
    }

    #[test]
    fn test_unbatched_same_date_winner_ignores_input_order() {
        let group = |asv: &str| {
            record(json!({
                "AutoScalingGroupName": "g",
                "Instances": [],
                "Tags": [{"Key": "ASV", "Value": asv}],
            }))
            .with_batch_date(day(2))
        };
        let forward = vec![group("x"), group("y")];
        let backward = vec![group("y"), group("x")];

        let a = format_records(&AsgFormatter, &forward).unwrap();
        let b = format_records(&AsgFormatter, &backward).unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_date_batches_order_by_key() {
        // `2016-01-02` and `2016-01-02-00` name the same instant
        let group = |asv: &str, key: &str| {
            record(json!({
                "AutoScalingGroupName": "g",
                "Instances": [],
                "Tags": [{"Key": "ASV", "Value": asv}],
            }))
            .with_batch_date(day(2))
            .with_batch_key(key)
        };
        let daily = group("daily", "p/2016-01-02/resources.json.gz");
        let hourly = group("hourly", "p/2016-01-02-00/resources.json.gz");

        let a = format_records(&AsgFormatter, &[daily.clone(), hourly.clone()]).unwrap();
        let b = format_records(&AsgFormatter, &[hourly, daily]).unwrap();

        assert_eq!(a, b);
        assert_eq!(a, vec![vec!["g", "0", "hourly", "", ""]]);
    }

    #[test]
    fn test_numeric_and_string_ids_are_distinct() {
        let records = vec![
            record(json!({"AutoScalingGroupName": 1, "Instances": [1]})).with_batch_date(day(1)),
            record(json!({"AutoScalingGroupName": "1", "Instances": []})).with_batch_date(day(1)),
        ];

        let rows = format_records(&AsgFormatter, &records).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_empty_input() {
        let rows = format_records(&S3Formatter, &Vec::<Record>::new()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_missing_required_field_errors() {
        let records = vec![record(json!({
            "InstanceId": "i-9",
            "State": {"Name": "running"},
        }))
        .with_batch_date(day(1))];

        let err = format_records(&Ec2Formatter, &records).unwrap_err();
        match err {
            ReportError::MalformedRecord {
                resource_type,
                record_id,
                field,
            } => {
                assert_eq!(resource_type, "ec2");
                assert_eq!(record_id, "i-9");
                assert_eq!(field, "InstanceType");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Batches over few ids and few days, so identities and batch dates
    /// collide often. Keys are unique per batch.
    fn arb_batches() -> impl Strategy<Value = Vec<Vec<Record>>> {
        let batch = (1u32..4, prop::collection::vec((0u8..6, "[a-z]{1,6}"), 0..6));
        prop::collection::vec(batch, 0..10).prop_map(|batches| {
            batches
                .into_iter()
                .enumerate()
                .map(|(n, (d, entries))| {
                    let key = format!("p/{}/2016-01-{:02}/resources.json.gz", n, d);
                    entries
                        .into_iter()
                        .map(|(id, name)| {
                            instance(&format!("i-{}", id), &name, "running", day(d))
                                .with_batch_key(key.as_str())
                        })
                        .collect()
                })
                .collect()
        })
    }

    fn arb_records() -> impl Strategy<Value = Vec<Record>> {
        arb_batches().prop_map(|batches| batches.concat())
    }

    proptest! {
        #[test]
        fn prop_output_independent_of_merge_order(
            (batches, shuffled) in arb_batches().prop_flat_map(|batches| {
                let shuffled = Just(batches.clone()).prop_shuffle();
                (Just(batches), shuffled)
            })
        ) {
            let a = format_records(&Ec2Formatter, &batches.concat()).unwrap();
            let b = format_records(&Ec2Formatter, &shuffled.concat()).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_one_row_per_identity(records in arb_records()) {
            let rows = format_records(&Ec2Formatter, &records).unwrap();

            let ids: HashSet<_> = records.iter().filter_map(|r| r.get_str("InstanceId")).collect();
            prop_assert_eq!(rows.len(), ids.len());

            for row in &rows {
                let same_id: Vec<&Record> = records
                    .iter()
                    .filter(|r| r.get_str("InstanceId") == Some(row[1].as_str()))
                    .collect();
                let newest = same_id.iter().filter_map(|r| r.batch_date()).max();
                let candidates: Vec<String> = same_id
                    .iter()
                    .filter(|r| r.batch_date() == newest)
                    .map(|r| r.tag_map().get_or_empty("Name"))
                    .collect();
                prop_assert!(candidates.contains(&row[2]));
            }
        }
    }
}
