use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Fixed name of the timestamp column in every metric table.
pub const TIME_COLUMN_NAME: &str = "time";
/// Fixed name of the tag-set id column (metric table and tag table).
pub const TAG_ID_COLUMN_NAME: &str = "tag_id";
/// Name of the single jsonb column holding all tags in JSON tag mode.
pub const TAGS_JSON_COLUMN_NAME: &str = "tags";
/// Name of the single jsonb column holding all fields in JSON field mode.
pub const FIELDS_JSON_COLUMN_NAME: &str = "fields";

/// PostgreSQL truncates identifiers beyond this many bytes. Names over the
/// limit are excluded outright, never truncated.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Role of a column within a metric or tag table.
///
/// The derived ordering is load-bearing: it is the first key of the
/// canonical column order used for deterministic DDL and diffing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnRole {
    Time,
    TagId,
    Tag,
    Field,
}

impl ColumnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnRole::Time => "time",
            ColumnRole::TagId => "tag_id",
            ColumnRole::Tag => "tag",
            ColumnRole::Field => "field",
        }
    }
}

impl Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of PostgreSQL types the engine emits or reads back from
/// the catalog. Anything else comes back as `Unknown` and is only ever
/// compatible with itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgDataType {
    Bool,
    Int4,
    Int8,
    Float8,
    Numeric,
    Text,
    Timestamp,
    TimestampTz,
    Jsonb,
    Serial8,
    Unknown,
}

impl PgDataType {
    /// SQL spelling used when rendering DDL.
    pub fn as_sql(&self) -> &'static str {
        match self {
            PgDataType::Bool => "boolean",
            PgDataType::Int4 => "integer",
            PgDataType::Int8 => "bigint",
            PgDataType::Float8 => "double precision",
            PgDataType::Numeric => "numeric",
            PgDataType::Text => "text",
            PgDataType::Timestamp => "timestamp without time zone",
            PgDataType::TimestampTz => "timestamp with time zone",
            PgDataType::Jsonb => "jsonb",
            PgDataType::Serial8 => "bigserial",
            PgDataType::Unknown => "text",
        }
    }

    /// Parse the `data_type` spelling reported by `information_schema.columns`.
    pub fn from_catalog(s: &str) -> Self {
        match s {
            "boolean" => PgDataType::Bool,
            "integer" => PgDataType::Int4,
            "bigint" => PgDataType::Int8,
            "double precision" => PgDataType::Float8,
            "numeric" => PgDataType::Numeric,
            "text" => PgDataType::Text,
            "timestamp without time zone" => PgDataType::Timestamp,
            "timestamp with time zone" => PgDataType::TimestampTz,
            "jsonb" => PgDataType::Jsonb,
            _ => PgDataType::Unknown,
        }
    }

    /// Whether a column of this type can store every value of `other`
    /// without loss. Existing columns never narrow; an incompatible pair is
    /// a permanent error at reconciliation time.
    pub fn can_contain(&self, other: PgDataType) -> bool {
        if *self == other {
            return true;
        }
        match self {
            // a created bigserial reads back from the catalog as bigint
            PgDataType::Int8 => matches!(other, PgDataType::Int4 | PgDataType::Serial8),
            PgDataType::Float8 => matches!(other, PgDataType::Int4),
            PgDataType::Numeric => {
                matches!(other, PgDataType::Int4 | PgDataType::Int8 | PgDataType::Float8)
            }
            PgDataType::TimestampTz => matches!(other, PgDataType::Timestamp),
            // bigserial is a bigint with a default attached
            PgDataType::Serial8 => matches!(other, PgDataType::Int4 | PgDataType::Int8),
            _ => false,
        }
    }
}

/// A single column of a metric or tag table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: PgDataType,
    pub role: ColumnRole,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: PgDataType, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            data_type,
            role,
        }
    }

    pub fn time() -> Self {
        Self::new(TIME_COLUMN_NAME, PgDataType::TimestampTz, ColumnRole::Time)
    }

    /// The `tag_id` column as it appears in a metric table.
    pub fn tag_id() -> Self {
        Self::new(TAG_ID_COLUMN_NAME, PgDataType::Int8, ColumnRole::TagId)
    }

    /// The `tag_id` column as it appears in a tag table, where the database
    /// generates the ids.
    pub fn tag_id_serial() -> Self {
        Self::new(TAG_ID_COLUMN_NAME, PgDataType::Serial8, ColumnRole::TagId)
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self::new(name, PgDataType::Text, ColumnRole::Tag)
    }

    pub fn field(name: impl Into<String>, data_type: PgDataType) -> Self {
        Self::new(name, data_type, ColumnRole::Field)
    }

    pub fn tags_json() -> Self {
        Self::new(TAGS_JSON_COLUMN_NAME, PgDataType::Jsonb, ColumnRole::Tag)
    }

    pub fn fields_json() -> Self {
        Self::new(FIELDS_JSON_COLUMN_NAME, PgDataType::Jsonb, ColumnRole::Field)
    }

    /// Byte-length identifier check. The limit is a hard database constant;
    /// violating names are excluded, never truncated.
    pub fn identifier_valid(name: &str) -> bool {
        !name.is_empty() && name.len() <= MAX_IDENTIFIER_BYTES
    }

    /// Total order over columns: role first, then case-insensitive name.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        self.role.cmp(&other.role).then_with(|| {
            self.name
                .to_lowercase()
                .cmp(&other.name.to_lowercase())
                .then_with(|| self.name.cmp(&other.name))
        })
    }
}

/// Sort columns into the canonical `[time, tag_id?, tags.., fields..]` order.
pub fn sort_canonical(columns: &mut [Column]) {
    columns.sort_by(Column::cmp_canonical);
}

/// Order-preserving column collection with O(1) name deduplication.
#[derive(Debug, Clone, Default)]
pub struct ColumnList {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl ColumnList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `column` unless a column with the same name is already
    /// present. Returns whether the column was inserted.
    pub fn add(&mut self, column: Column) -> bool {
        if self.index.contains_key(&column.name) {
            return false;
        }
        self.index.insert(column.name.clone(), self.columns.len());
        self.columns.push(column);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|idx| &self.columns[*idx])
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let idx = self.index.remove(name)?;
        let column = self.columns.remove(idx);
        self.index = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Some(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// Canonically ordered snapshot.
    pub fn sorted(&self) -> Vec<Column> {
        let mut out = self.columns.clone();
        sort_canonical(&mut out);
        out
    }
}
