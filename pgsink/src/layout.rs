//! Column layout strategy, resolved once at construction.

use models::Column;

/// How tags are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagLayout {
    /// One text column per tag key, inline in the metric table.
    Inline,
    /// A `tag_id` column referencing a paired tag table.
    ForeignKey,
    /// A single jsonb column holding the whole tag set.
    Json,
}

/// How fields are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLayout {
    /// One typed column per field key.
    Inline,
    /// A single jsonb column holding the whole field set.
    Json,
}

/// The resolved tag × field strategy. One of six closed layouts; nothing
/// downstream branches on raw config booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub tags: TagLayout,
    pub fields: FieldLayout,
}

impl ColumnLayout {
    pub fn new(tags: TagLayout, fields: FieldLayout) -> Self {
        Self { tags, fields }
    }

    /// The column standing in for the tag set in the metric table, if the
    /// tags are not inlined.
    pub fn tag_marker_column(&self) -> Option<Column> {
        match self.tags {
            TagLayout::Inline => None,
            TagLayout::ForeignKey => Some(Column::tag_id()),
            TagLayout::Json => Some(Column::tags_json()),
        }
    }

    /// The column standing in for the field set, if fields are not inlined.
    pub fn field_marker_column(&self) -> Option<Column> {
        match self.fields {
            FieldLayout::Inline => None,
            FieldLayout::Json => Some(Column::fields_json()),
        }
    }

    /// The fixed skeleton every metric table starts from under this layout.
    pub fn initial_columns(&self) -> Vec<Column> {
        let mut columns = vec![Column::time()];
        columns.extend(self.tag_marker_column());
        columns.extend(self.field_marker_column());
        columns
    }

    pub fn uses_tag_table(&self) -> bool {
        self.tags == TagLayout::ForeignKey
    }
}

#[cfg(test)]
mod tests {
    use models::{ColumnRole, TAG_ID_COLUMN_NAME};

    use super::*;

    #[test]
    fn test_initial_columns_per_layout() {
        let inline = ColumnLayout::new(TagLayout::Inline, FieldLayout::Inline);
        assert_eq!(inline.initial_columns().len(), 1);

        let fk = ColumnLayout::new(TagLayout::ForeignKey, FieldLayout::Inline);
        let cols = fk.initial_columns();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[1].name, TAG_ID_COLUMN_NAME);
        assert_eq!(cols[1].role, ColumnRole::TagId);

        let json = ColumnLayout::new(TagLayout::Json, FieldLayout::Json);
        let cols = json.initial_columns();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[1].name, "tags");
        assert_eq!(cols[2].name, "fields");
    }

    #[test]
    fn test_only_foreign_key_layout_uses_tag_table() {
        assert!(ColumnLayout::new(TagLayout::ForeignKey, FieldLayout::Inline).uses_tag_table());
        assert!(!ColumnLayout::new(TagLayout::Json, FieldLayout::Inline).uses_tag_table());
        assert!(!ColumnLayout::new(TagLayout::Inline, FieldLayout::Json).uses_tag_table());
    }
}
