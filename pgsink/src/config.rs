use models::Column;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigSnafu, Result};
use crate::layout::{ColumnLayout, FieldLayout, TagLayout};
use crate::sqltemplate::{
    Template, DEFAULT_ADD_COLUMN_TEMPLATE, DEFAULT_CREATE_TEMPLATE,
    DEFAULT_TAG_TABLE_CREATE_TEMPLATE,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// libpq-style connection string (keyword/value or URI).
    #[serde(default)]
    pub connection: String,

    #[serde(default = "SinkConfig::default_schema")]
    pub schema: String,

    /// Normalize tag sets into a paired `<measurement><suffix>` table and
    /// reference them by `tag_id`.
    #[serde(default)]
    pub tags_as_foreign_keys: bool,

    /// Store the whole tag set as one jsonb column.
    #[serde(default)]
    pub tags_as_jsonb: bool,

    /// Store the whole field set as one jsonb column.
    #[serde(default)]
    pub fields_as_jsonb: bool,

    /// Fail a sub-batch when its tag rows cannot be written, instead of
    /// logging and continuing.
    #[serde(default)]
    pub foreign_tag_constraint: bool,

    #[serde(default = "SinkConfig::default_tag_table_suffix")]
    pub tag_table_suffix: String,

    /// Per-measurement tag cache entries; 0 means unbounded.
    #[serde(default = "SinkConfig::default_tag_cache_size")]
    pub tag_cache_size: usize,

    /// Number of writer connections. Above 1, sub-batches are dispatched to
    /// worker tasks and transient failures retry internally.
    #[serde(default = "SinkConfig::default_pool_size")]
    pub pool_size: usize,

    /// Cap for the exponential retry backoff used by worker tasks.
    #[serde(default = "SinkConfig::default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "SinkConfig::default_create_templates")]
    pub create_templates: Vec<Template>,

    #[serde(default = "SinkConfig::default_add_column_templates")]
    pub add_column_templates: Vec<Template>,

    #[serde(default = "SinkConfig::default_tag_table_create_templates")]
    pub tag_table_create_templates: Vec<Template>,

    #[serde(default = "SinkConfig::default_add_column_templates")]
    pub tag_table_add_column_templates: Vec<Template>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            schema: Self::default_schema(),
            tags_as_foreign_keys: false,
            tags_as_jsonb: false,
            fields_as_jsonb: false,
            foreign_tag_constraint: false,
            tag_table_suffix: Self::default_tag_table_suffix(),
            tag_cache_size: Self::default_tag_cache_size(),
            pool_size: Self::default_pool_size(),
            retry_max_backoff_ms: Self::default_retry_max_backoff_ms(),
            create_templates: Self::default_create_templates(),
            add_column_templates: Self::default_add_column_templates(),
            tag_table_create_templates: Self::default_tag_table_create_templates(),
            tag_table_add_column_templates: Self::default_add_column_templates(),
        }
    }
}

impl SinkConfig {
    fn default_schema() -> String {
        "public".to_string()
    }

    fn default_tag_table_suffix() -> String {
        "_tag".to_string()
    }

    fn default_tag_cache_size() -> usize {
        100_000
    }

    fn default_pool_size() -> usize {
        1
    }

    fn default_retry_max_backoff_ms() -> u64 {
        15_000
    }

    fn default_create_templates() -> Vec<Template> {
        vec![Template::new(DEFAULT_CREATE_TEMPLATE)]
    }

    fn default_add_column_templates() -> Vec<Template> {
        vec![Template::new(DEFAULT_ADD_COLUMN_TEMPLATE)]
    }

    fn default_tag_table_create_templates() -> Vec<Template> {
        vec![Template::new(DEFAULT_TAG_TABLE_CREATE_TEMPLATE)]
    }

    /// The resolved tag × field storage strategy.
    pub fn layout(&self) -> ColumnLayout {
        let tags = if self.tags_as_foreign_keys {
            TagLayout::ForeignKey
        } else if self.tags_as_jsonb {
            TagLayout::Json
        } else {
            TagLayout::Inline
        };
        let fields = if self.fields_as_jsonb {
            FieldLayout::Json
        } else {
            FieldLayout::Inline
        };
        ColumnLayout::new(tags, fields)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tags_as_foreign_keys && self.tags_as_jsonb {
            return ConfigSnafu {
                reason: "tags_as_foreign_keys and tags_as_jsonb are mutually exclusive",
            }
            .fail();
        }
        if !Column::identifier_valid(&self.schema) {
            return ConfigSnafu {
                reason: format!("schema name '{}' is not a valid identifier", self.schema),
            }
            .fail();
        }
        if self.tag_table_suffix.is_empty() && self.tags_as_foreign_keys {
            return ConfigSnafu {
                reason: "tag_table_suffix must not be empty with tags_as_foreign_keys",
            }
            .fail();
        }
        if self.pool_size == 0 {
            return ConfigSnafu {
                reason: "pool_size must be at least 1",
            }
            .fail();
        }

        for (name, templates) in [
            ("create_templates", &self.create_templates),
            ("add_column_templates", &self.add_column_templates),
            (
                "tag_table_create_templates",
                &self.tag_table_create_templates,
            ),
            (
                "tag_table_add_column_templates",
                &self.tag_table_add_column_templates,
            ),
        ] {
            if templates.is_empty() {
                return ConfigSnafu {
                    reason: format!("{name} must contain at least one template"),
                }
                .fail();
            }
            for template in templates {
                template.check()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schema, "public");
        assert_eq!(config.tag_table_suffix, "_tag");
        assert_eq!(config.tag_cache_size, 100_000);
        assert_eq!(config.pool_size, 1);
    }

    #[test]
    fn test_layout_resolution() {
        let mut config = SinkConfig::default();
        assert_eq!(
            config.layout(),
            ColumnLayout::new(TagLayout::Inline, FieldLayout::Inline)
        );
        config.tags_as_foreign_keys = true;
        config.fields_as_jsonb = true;
        assert_eq!(
            config.layout(),
            ColumnLayout::new(TagLayout::ForeignKey, FieldLayout::Json)
        );
    }

    #[test]
    fn test_conflicting_tag_modes_rejected() {
        let config = SinkConfig {
            tags_as_foreign_keys: true,
            tags_as_jsonb: true,
            ..SinkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broken_template_rejected() {
        let config = SinkConfig {
            create_templates: vec![Template::new("CREATE TABLE {{table")],
            ..SinkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_template_list_rejected() {
        let config = SinkConfig {
            add_column_templates: Vec::new(),
            ..SinkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserializes_from_json() {
        let config: SinkConfig = serde_json::from_str(
            r#"{
                "connection": "host=localhost user=ingest",
                "tags_as_foreign_keys": true,
                "tag_cache_size": 500,
                "create_templates": ["CREATE TABLE {{table}} ({{columns}})"]
            }"#,
        )
        .unwrap();
        assert!(config.tags_as_foreign_keys);
        assert_eq!(config.tag_cache_size, 500);
        assert_eq!(config.create_templates.len(), 1);
        config.validate().unwrap();
    }
}
