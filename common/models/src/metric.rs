use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// One metric occurrence: measurement name, tag set, field set, timestamp.
///
/// Tags and fields live in ordered maps so every traversal of a metric is
/// deterministic regardless of how the producer assembled it. Metrics are
/// immutable once built; exclusion of tags or fields is tracked by the
/// batch working set, never by mutating the metric.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metric {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Canonical key for this metric's tag set: keys in sorted order,
    /// concatenated as `key value;` pairs. Two metrics with equal tag sets
    /// produce the same key no matter the insertion order; the empty tag
    /// set maps to the empty string.
    pub fn tag_set_key(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.tags {
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push(';');
        }
        out
    }
}
