//! Data model shared by the pgsink engine: metrics, field values, and the
//! column model used for schema reconciliation.

pub mod column;
pub mod errors;
pub mod metric;
pub mod value;

pub use column::{
    sort_canonical, Column, ColumnList, ColumnRole, PgDataType, FIELDS_JSON_COLUMN_NAME,
    MAX_IDENTIFIER_BYTES, TAGS_JSON_COLUMN_NAME, TAG_ID_COLUMN_NAME, TIME_COLUMN_NAME,
};
pub use errors::{ModelError, ModelResult};
pub use metric::Metric;
pub use value::FieldValue;

/// Identifier assigned to a deduplicated tag set, generated by the tag table.
pub type TagId = i64;
