//! Built-in resource formatters.

use serde_json::Value;

use super::{missing, required, Formatter, Row, TAG_ASV, TAG_ENVIRONMENT, TAG_NAME, TAG_OWNER};
use crate::error::Result;
use crate::record::{value_to_cell, Record, TagMap};

/// EC2 instances; terminated instances are left out
#[derive(Debug, Clone, Copy, Default)]
pub struct Ec2Formatter;

impl Formatter for Ec2Formatter {
    fn resource_type(&self) -> &str {
        "ec2"
    }

    fn id_field(&self) -> &str {
        "InstanceId"
    }

    fn headers(&self) -> &[&'static str] {
        &[
            "action-date",
            "instance-id",
            "name",
            "instance-type",
            "launch",
            "vpc-id",
            "ip-addr",
            "asv",
            "env",
            "owner",
        ]
    }

    fn filter(&self, record: &Record) -> bool {
        record.get_path("State.Name").and_then(Value::as_str) != Some("terminated")
    }

    fn project(&self, record: &Record, tags: &TagMap) -> Result<Row> {
        let action_date = record
            .batch_date()
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        Ok(vec![
            action_date,
            required(self, record, "InstanceId")?,
            tags.get_or_empty(TAG_NAME),
            required(self, record, "InstanceType")?,
            required(self, record, "LaunchTime")?,
            record.cell("VpcId").unwrap_or_default(),
            record.cell("PrivateIpAddress").unwrap_or_default(),
            tags.get_or_empty(TAG_ASV),
            tags.get_or_empty(TAG_ENVIRONMENT),
            tags.get_or_empty(TAG_OWNER),
        ])
    }
}

/// Auto scaling groups
#[derive(Debug, Clone, Copy, Default)]
pub struct AsgFormatter;

impl Formatter for AsgFormatter {
    fn resource_type(&self) -> &str {
        "asg"
    }

    fn id_field(&self) -> &str {
        "AutoScalingGroupName"
    }

    fn headers(&self) -> &[&'static str] {
        &["name", "instance-count", "asv", "env", "owner"]
    }

    fn project(&self, record: &Record, tags: &TagMap) -> Result<Row> {
        let instances = record
            .get("Instances")
            .and_then(Value::as_array)
            .ok_or_else(|| missing(self, record, "Instances"))?;

        Ok(vec![
            required(self, record, "AutoScalingGroupName")?,
            instances.len().to_string(),
            tags.get_or_empty(TAG_ASV),
            tags.get_or_empty(TAG_ENVIRONMENT),
            tags.get_or_empty(TAG_OWNER),
        ])
    }
}

/// S3 buckets
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Formatter;

impl Formatter for S3Formatter {
    fn resource_type(&self) -> &str {
        "s3"
    }

    fn id_field(&self) -> &str {
        "Name"
    }

    fn headers(&self) -> &[&'static str] {
        &[
            "name",
            "creation-date",
            "global-permissions",
            "ownercontact",
            "asv",
            "env",
        ]
    }

    fn project(&self, record: &Record, tags: &TagMap) -> Result<Row> {
        let permissions = record
            .get("GlobalPermissions")
            .and_then(Value::as_array)
            .ok_or_else(|| missing(self, record, "GlobalPermissions"))?
            .iter()
            .map(value_to_cell)
            .collect::<Vec<_>>()
            .join(",");

        Ok(vec![
            required(self, record, "Name")?,
            required(self, record, "CreationDate")?,
            permissions,
            tags.get_or_empty(TAG_OWNER),
            tags.get_or_empty(TAG_ASV),
            tags.get_or_empty(TAG_ENVIRONMENT),
        ])
    }
}

/// CloudFormation stacks
#[derive(Debug, Clone, Copy, Default)]
pub struct CfnFormatter;

impl Formatter for CfnFormatter {
    fn resource_type(&self) -> &str {
        "cfn"
    }

    fn id_field(&self) -> &str {
        "StackName"
    }

    fn headers(&self) -> &[&'static str] {
        &["name", "status", "creation-time", "asv", "env", "owner"]
    }

    fn project(&self, record: &Record, tags: &TagMap) -> Result<Row> {
        Ok(vec![
            required(self, record, "StackName")?,
            required(self, record, "StackStatus")?,
            required(self, record, "CreationTime")?,
            tags.get_or_empty(TAG_ASV),
            tags.get_or_empty(TAG_ENVIRONMENT),
            tags.get_or_empty(TAG_OWNER),
        ])
    }
}
