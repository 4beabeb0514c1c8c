//! Per-(measurement, batch) working set: accumulates the columns the batch
//! needs, produces the row tuples lazily, and absorbs column drops decided
//! by schema reconciliation. Lives only for one write cycle.

use std::collections::{HashMap, HashSet};

use models::errors::ColumnNotDroppableSnafu;
use models::{
    Column, ColumnList, ColumnRole, FieldValue, Metric, PgDataType, TagId,
    FIELDS_JSON_COLUMN_NAME, TAGS_JSON_COLUMN_NAME,
};
use tracing::{debug, warn};

use crate::db::{RowSource, SqlValue};
use crate::error::{InternalSnafu, Result};
use crate::layout::{ColumnLayout, FieldLayout, TagLayout};

pub struct TableSource {
    name: String,
    layout: ColumnLayout,
    metrics: Vec<Metric>,
    tag_columns: ColumnList,
    field_columns: ColumnList,
    dropped_tags: HashSet<String>,
    dropped_fields: HashSet<String>,
    /// tag-set key -> resolved id (foreign-key layout only).
    tag_ids: HashMap<String, TagId>,
    /// tag sets whose id could not be resolved; their metrics are skipped.
    dropped_tag_sets: HashSet<String>,
    cursor: Option<usize>,
}

impl TableSource {
    pub fn new(name: impl Into<String>, layout: ColumnLayout) -> Self {
        Self {
            name: name.into(),
            layout,
            metrics: Vec::new(),
            tag_columns: ColumnList::new(),
            field_columns: ColumnList::new(),
            dropped_tags: HashSet::new(),
            dropped_fields: HashSet::new(),
            tag_ids: HashMap::new(),
            dropped_tag_sets: HashSet::new(),
            cursor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> ColumnLayout {
        self.layout
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Register a metric's columns and queue it for row production.
    ///
    /// Column types are inferred from the first value seen under each name;
    /// later values that no longer fit are handled per row at conversion
    /// time.
    pub fn add_metric(&mut self, metric: Metric) {
        if self.layout.tags != TagLayout::Json {
            for key in metric.tags().keys() {
                self.tag_columns.add(Column::tag(key.clone()));
            }
        }
        if self.layout.fields == FieldLayout::Inline {
            for (key, value) in metric.fields() {
                self.field_columns
                    .add(Column::field(key.clone(), value.infer_type()));
            }
        }
        self.metrics.push(metric);
    }

    /// Tag columns this batch still carries, canonically ordered.
    pub fn tag_columns(&self) -> Vec<Column> {
        self.tag_columns
            .sorted()
            .into_iter()
            .filter(|c| !self.dropped_tags.contains(&c.name))
            .collect()
    }

    /// Field columns this batch still carries, canonically ordered.
    pub fn field_columns(&self) -> Vec<Column> {
        self.field_columns
            .sorted()
            .into_iter()
            .filter(|c| !self.dropped_fields.contains(&c.name))
            .collect()
    }

    /// The full metric-table column list: time, then the tag columns or
    /// their stand-in, then the field columns or theirs.
    pub fn metric_table_columns(&self) -> Vec<Column> {
        let mut columns = vec![Column::time()];
        match self.layout.tag_marker_column() {
            Some(marker) => columns.push(marker),
            None => columns.extend(self.tag_columns()),
        }
        match self.layout.field_marker_column() {
            Some(marker) => {
                if !self.dropped_fields.contains(FIELDS_JSON_COLUMN_NAME) {
                    columns.push(marker);
                }
            }
            None => columns.extend(self.field_columns()),
        }
        columns
    }

    /// The paired tag table's column list: the generated `tag_id` key, then
    /// the tag columns.
    pub fn tag_table_columns(&self) -> Vec<Column> {
        let mut columns = vec![Column::tag_id_serial()];
        columns.extend(self.tag_columns());
        columns
    }

    pub fn column_names(columns: &[Column]) -> Vec<String> {
        columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Remove a column the schema cannot hold.
    ///
    /// Dropping a tag excludes every metric carrying that tag key: shrinking
    /// a tag set would alias it onto a different, smaller set and corrupt
    /// tag-id deduplication. Dropping a field only omits that field; rows
    /// survive unless nothing is left in them. Time and tag_id are never
    /// droppable.
    pub fn drop_column(&mut self, column: &Column) -> Result<()> {
        match column.role {
            ColumnRole::Tag => {
                let affected = self
                    .metrics
                    .iter()
                    .filter(|m| m.has_tag(&column.name))
                    .count();
                warn!(
                    table = %self.name,
                    column = %column.name,
                    affected_metrics = affected,
                    "dropping tag column; metrics carrying it are excluded from the batch"
                );
                self.dropped_tags.insert(column.name.clone());
                Ok(())
            }
            ColumnRole::Field => {
                warn!(
                    table = %self.name,
                    column = %column.name,
                    "dropping field column from the batch"
                );
                self.dropped_fields.insert(column.name.clone());
                Ok(())
            }
            ColumnRole::Time | ColumnRole::TagId => Err(ColumnNotDroppableSnafu {
                name: column.name.clone(),
                role: column.role,
            }
            .build()
            .into()),
        }
    }

    /// Record the resolved id for a tag set.
    pub fn set_tag_id(&mut self, key: String, id: TagId) {
        self.tag_ids.insert(key, id);
    }

    /// Exclude every metric with this tag set; its id could not be resolved.
    pub fn drop_tag_set(&mut self, key: String) {
        self.dropped_tag_sets.insert(key);
    }

    /// One metric per distinct live tag set, keyed by the canonical tag-set
    /// key. Input to tag-id resolution.
    pub fn distinct_tag_sets(&self) -> Vec<(String, Metric)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for metric in &self.metrics {
            if !self.passes_drops(metric) {
                continue;
            }
            let key = metric.tag_set_key();
            if seen.insert(key.clone()) {
                out.push((key, metric.clone()));
            }
        }
        out
    }

    /// Drop rules only: no dropped tag key, at least one live field.
    fn passes_drops(&self, metric: &Metric) -> bool {
        if metric.tags().keys().any(|k| self.dropped_tags.contains(k)) {
            return false;
        }
        match self.layout.fields {
            FieldLayout::Json => {
                !self.dropped_fields.contains(FIELDS_JSON_COLUMN_NAME)
                    && !metric.fields().is_empty()
            }
            FieldLayout::Inline => metric
                .fields()
                .keys()
                .any(|k| !self.dropped_fields.contains(k)),
        }
    }

    /// Full row-emission predicate: drop rules plus, in foreign-key mode, a
    /// resolved tag id.
    fn row_live(&self, metric: &Metric) -> bool {
        if !self.passes_drops(metric) {
            return false;
        }
        if self.layout.uses_tag_table() {
            let key = metric.tag_set_key();
            if self.dropped_tag_sets.contains(&key) {
                return false;
            }
            if !self.tag_ids.contains_key(&key) {
                debug!(
                    table = %self.name,
                    "skipping metric with unresolved tag set"
                );
                return false;
            }
        }
        true
    }

    fn current(&self) -> Result<&Metric> {
        let idx = self.cursor.filter(|i| *i < self.metrics.len());
        match idx {
            Some(idx) => Ok(&self.metrics[idx]),
            None => InternalSnafu {
                reason: "row cursor is not positioned on a row",
            }
            .fail(),
        }
    }

    fn row_values(&self, metric: &Metric) -> Result<Vec<SqlValue>> {
        let columns = self.metric_table_columns();
        let mut values = Vec::with_capacity(columns.len());
        for column in &columns {
            let value = match column.role {
                ColumnRole::Time => SqlValue::TimestampTz(metric.timestamp()),
                ColumnRole::TagId => {
                    let key = metric.tag_set_key();
                    match self.tag_ids.get(&key) {
                        Some(id) => SqlValue::I64(*id),
                        None => {
                            return InternalSnafu {
                                reason: format!(
                                    "metric in table '{}' reached row production without a tag id",
                                    self.name
                                ),
                            }
                            .fail()
                        }
                    }
                }
                ColumnRole::Tag if column.name == TAGS_JSON_COLUMN_NAME
                    && self.layout.tags == TagLayout::Json =>
                {
                    SqlValue::Json(tags_json(metric))
                }
                ColumnRole::Tag => metric
                    .tags()
                    .get(&column.name)
                    .map(|v| SqlValue::Text(v.clone()))
                    .unwrap_or(SqlValue::Null),
                ColumnRole::Field if column.name == FIELDS_JSON_COLUMN_NAME
                    && self.layout.fields == FieldLayout::Json =>
                {
                    SqlValue::Json(fields_json(metric))
                }
                ColumnRole::Field => match metric.fields().get(&column.name) {
                    None => SqlValue::Null,
                    Some(field) => match coerce_field(field, column.data_type) {
                        Some(value) => value,
                        None => {
                            // data error: this one field is dropped from
                            // this one row, the row survives
                            warn!(
                                table = %self.name,
                                column = %column.name,
                                value_type = field.type_name(),
                                column_type = ?column.data_type,
                                "field value not convertible to column type, writing NULL"
                            );
                            SqlValue::Null
                        }
                    },
                },
            };
            values.push(value);
        }
        Ok(values)
    }
}

impl RowSource for TableSource {
    fn next(&mut self) -> bool {
        let mut idx = self.cursor.map_or(0, |i| i + 1);
        while idx < self.metrics.len() {
            if self.row_live(&self.metrics[idx]) {
                self.cursor = Some(idx);
                return true;
            }
            idx += 1;
        }
        self.cursor = Some(self.metrics.len());
        false
    }

    fn values(&self) -> Result<Vec<SqlValue>> {
        let metric = self.current()?;
        self.row_values(metric)
    }

    fn reset(&mut self) {
        self.cursor = None;
    }
}

/// Convert a field value for storage in a column of the given type.
/// Total over the closed value set; `None` means the pair is incompatible
/// and the field is dropped from the row.
fn coerce_field(value: &FieldValue, data_type: PgDataType) -> Option<SqlValue> {
    match (value, data_type) {
        (FieldValue::Bool(v), PgDataType::Bool) => Some(SqlValue::Bool(*v)),
        (FieldValue::I64(v), PgDataType::Int8) => Some(SqlValue::I64(*v)),
        (FieldValue::I64(v), PgDataType::Float8) => Some(SqlValue::F64(*v as f64)),
        (FieldValue::I64(v), PgDataType::Numeric) => Some(SqlValue::I64(*v)),
        (FieldValue::U64(v), PgDataType::Numeric) => Some(SqlValue::U64(*v)),
        (FieldValue::U64(v), PgDataType::Int8) => i64::try_from(*v).ok().map(SqlValue::I64),
        (FieldValue::F64(v), PgDataType::Float8) => Some(SqlValue::F64(*v)),
        (FieldValue::F64(v), PgDataType::Numeric) => Some(SqlValue::F64(*v)),
        (FieldValue::Str(v), PgDataType::Text) => Some(SqlValue::Text(v.clone())),
        (FieldValue::Timestamp(v), PgDataType::TimestampTz)
        | (FieldValue::Timestamp(v), PgDataType::Timestamp) => Some(SqlValue::TimestampTz(*v)),
        _ => None,
    }
}

fn tags_json(metric: &Metric) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in metric.tags() {
        map.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}

fn fields_json(metric: &Metric) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in metric.fields() {
        map.insert(key.clone(), field_json(value));
    }
    serde_json::Value::Object(map)
}

fn field_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Bool(v) => serde_json::Value::Bool(*v),
        FieldValue::I64(v) => serde_json::Value::from(*v),
        FieldValue::U64(v) => serde_json::Value::from(*v),
        // non-finite floats have no JSON representation
        FieldValue::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        FieldValue::Str(v) => serde_json::Value::String(v.clone()),
        FieldValue::Timestamp(v) => serde_json::Value::String(v.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use models::TIME_COLUMN_NAME;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000, 0).unwrap()
    }

    fn inline_layout() -> ColumnLayout {
        ColumnLayout::new(TagLayout::Inline, FieldLayout::Inline)
    }

    fn collect_rows(source: &mut TableSource) -> Vec<Vec<SqlValue>> {
        let mut rows = Vec::new();
        source.reset();
        while source.next() {
            rows.push(source.values().unwrap());
        }
        rows
    }

    #[test]
    fn test_columns_accumulate_and_sort() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_field("value", 1i64),
        );
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_tag("region", "us")
                .with_field("value", 2i64),
        );

        let names: Vec<String> = source
            .metric_table_columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, [TIME_COLUMN_NAME, "host", "region", "value"]);
    }

    #[test]
    fn test_missing_tag_reads_back_null() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_field("value", 1i64),
        );
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_tag("region", "us")
                .with_field("value", 2i64),
        );

        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 2);
        // columns: time, host, region, value
        assert_eq!(rows[0][2], SqlValue::Null);
        assert_eq!(rows[1][2], SqlValue::Text("us".to_string()));
    }

    #[test]
    fn test_drop_field_keeps_row() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(
            Metric::new("cpu", ts())
                .with_field("bad", "oops")
                .with_field("good", 7i64),
        );
        source
            .drop_column(&Column::field("bad", PgDataType::Text))
            .unwrap();

        let columns = source.metric_table_columns();
        assert!(columns.iter().all(|c| c.name != "bad"));
        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::I64(7));
    }

    #[test]
    fn test_drop_tag_excludes_metric() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_field("v", 1i64),
        );
        source.add_metric(Metric::new("cpu", ts()).with_field("v", 2i64));
        source.drop_column(&Column::tag("host")).unwrap();

        let rows = collect_rows(&mut source);
        // only the metric without the dropped tag survives
        assert_eq!(rows.len(), 1);
        assert_eq!(*rows[0].last().unwrap(), SqlValue::I64(2));
    }

    #[test]
    fn test_fieldless_row_is_skipped() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(Metric::new("cpu", ts()).with_field("only", 1i64));
        source.add_metric(Metric::new("cpu", ts()).with_field("other", 2i64));
        source
            .drop_column(&Column::field("only", PgDataType::Int8))
            .unwrap();

        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_time_and_tag_id_are_not_droppable() {
        let mut source = TableSource::new("cpu", inline_layout());
        assert!(source.drop_column(&Column::time()).is_err());
        assert!(source.drop_column(&Column::tag_id()).is_err());
    }

    #[test]
    fn test_cursor_resets() {
        let mut source = TableSource::new("cpu", inline_layout());
        source.add_metric(Metric::new("cpu", ts()).with_field("v", 1i64));

        assert!(source.next());
        assert!(!source.next());
        source.reset();
        assert!(source.next());
        assert!(source.values().is_ok());
    }

    #[test]
    fn test_foreign_key_rows_need_resolved_ids() {
        let layout = ColumnLayout::new(TagLayout::ForeignKey, FieldLayout::Inline);
        let mut source = TableSource::new("cpu", layout);
        let m1 = Metric::new("cpu", ts()).with_tag("host", "a").with_field("v", 1i64);
        let m2 = Metric::new("cpu", ts()).with_tag("host", "b").with_field("v", 2i64);
        let key1 = m1.tag_set_key();
        source.add_metric(m1);
        source.add_metric(m2);

        // only one tag set resolved; the other row is skipped
        source.set_tag_id(key1, 41);
        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::I64(41));
    }

    #[test]
    fn test_json_layout_rows() {
        let layout = ColumnLayout::new(TagLayout::Json, FieldLayout::Json);
        let mut source = TableSource::new("cpu", layout);
        source.add_metric(
            Metric::new("cpu", ts())
                .with_tag("host", "a")
                .with_field("v", 1i64),
        );

        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::Json(serde_json::json!({"host": "a"})));
        assert_eq!(rows[0][2], SqlValue::Json(serde_json::json!({"v": 1})));
    }

    #[test]
    fn test_inconvertible_field_value_becomes_null() {
        let mut source = TableSource::new("cpu", inline_layout());
        // first value fixes the column type to bigint
        source.add_metric(Metric::new("cpu", ts()).with_field("v", 1i64));
        source.add_metric(Metric::new("cpu", ts()).with_field("v", "not a number"));

        let rows = collect_rows(&mut source);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], SqlValue::I64(1));
        assert_eq!(rows[1][1], SqlValue::Null);
    }
}
