//! Tiny template language for the configurable DDL statements.
//!
//! A template is plain SQL with `{{variable}}` placeholders. A list-valued
//! variable joins its entries with `", "`, overridable per placeholder:
//! `{{columns | join ", ADD COLUMN IF NOT EXISTS "}}`. Identifier values
//! are rendered pre-quoted by the caller; the helpers at the bottom do the
//! quoting.
//!
//! Parsing never fails — malformed placeholders are carried along and
//! reported either by `check()` during config validation or as a permanent
//! error at render time.

use std::collections::HashMap;
use std::fmt;

use models::Column;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;

pub type TemplateResult<T, E = TemplateError> = std::result::Result<T, E>;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum TemplateError {
    #[snafu(display("unclosed placeholder at byte {} of '{}'", pos, template))]
    Unclosed { template: String, pos: usize },

    #[snafu(display("malformed placeholder '{{{{{}}}}}'", body))]
    Malformed { body: String },

    #[snafu(display("unknown template variable '{}'", name))]
    UnknownVariable { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { name: String, join: Option<String> },
    Bad(TemplateError),
}

/// A parsed DDL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let segments = parse(&source);
        Self { source, segments }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Surface syntax errors eagerly; used by config validation so a broken
    /// template fails startup instead of the first write cycle.
    pub fn check(&self) -> TemplateResult<()> {
        for segment in &self.segments {
            if let Segment::Bad(err) = segment {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    pub fn render(&self, ctx: &RenderContext) -> TemplateResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, join } => match ctx.get(name) {
                    Some(Value::Str(value)) => out.push_str(value),
                    Some(Value::List(items)) => {
                        let sep = join.as_deref().unwrap_or(", ");
                        out.push_str(&items.join(sep));
                    }
                    None => return UnknownVariableSnafu { name: name.clone() }.fail(),
                },
                Segment::Bad(err) => return Err(err.clone()),
            }
        }
        Ok(out)
    }
}

fn parse(source: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                segments.push(parse_placeholder(&after[..end]));
                offset += start + 2 + end + 2;
                rest = &after[end + 2..];
            }
            None => {
                segments.push(Segment::Bad(TemplateError::Unclosed {
                    template: source.to_string(),
                    pos: offset + start,
                }));
                return segments;
            }
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    segments
}

fn parse_placeholder(body: &str) -> Segment {
    let malformed = || {
        Segment::Bad(TemplateError::Malformed {
            body: body.to_string(),
        })
    };

    let mut parts = body.splitn(2, '|');
    let name = parts.next().unwrap_or("").trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return malformed();
    }
    let join = match parts.next() {
        None => None,
        Some(modifier) => {
            let modifier = modifier.trim();
            let Some(arg) = modifier.strip_prefix("join") else {
                return malformed();
            };
            let arg = arg.trim();
            if arg.len() < 2 || !arg.starts_with('"') || !arg.ends_with('"') {
                return malformed();
            }
            Some(arg[1..arg.len() - 1].to_string())
        }
    };
    Segment::Placeholder {
        name: name.to_string(),
        join,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    List(Vec<String>),
}

/// Variable bindings for one render.
#[derive(Debug, Default)]
pub struct RenderContext {
    vars: HashMap<String, Value>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), Value::Str(value.into()));
    }

    pub fn set_list(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.vars.insert(name.into(), Value::List(values));
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TemplateVisitor;
        impl<'de> Visitor<'de> for TemplateVisitor {
            type Value = Template;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a DDL template string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Template, E> {
                Ok(Template::new(v))
            }
        }
        deserializer.deserialize_str(TemplateVisitor)
    }
}

pub const DEFAULT_CREATE_TEMPLATE: &str = "CREATE TABLE {{table}} ({{columns}})";
pub const DEFAULT_ADD_COLUMN_TEMPLATE: &str =
    "ALTER TABLE {{table}} ADD COLUMN IF NOT EXISTS {{columns | join \", ADD COLUMN IF NOT EXISTS \"}}";
pub const DEFAULT_TAG_TABLE_CREATE_TEMPLATE: &str =
    "CREATE TABLE {{table}} ({{columns}}, PRIMARY KEY (tag_id))";

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified, quoted table identifier.
pub fn full_table_ident(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `"name" type` definition used in the column lists handed to templates.
pub fn column_def(column: &Column) -> String {
    format!("{} {}", quote_ident(&column.name), column.data_type.as_sql())
}

#[cfg(test)]
mod tests {
    use models::PgDataType;

    use super::*;

    fn ctx() -> RenderContext {
        let mut ctx = RenderContext::new();
        ctx.set_str("table", "\"public\".\"cpu\"");
        ctx.set_list(
            "columns",
            vec!["\"time\" timestamp with time zone".into(), "\"v\" bigint".into()],
        );
        ctx
    }

    #[test]
    fn test_render_default_create() {
        let t = Template::new(DEFAULT_CREATE_TEMPLATE);
        assert_eq!(
            t.render(&ctx()).unwrap(),
            "CREATE TABLE \"public\".\"cpu\" (\"time\" timestamp with time zone, \"v\" bigint)"
        );
    }

    #[test]
    fn test_render_join_modifier() {
        let t = Template::new(DEFAULT_ADD_COLUMN_TEMPLATE);
        assert_eq!(
            t.render(&ctx()).unwrap(),
            "ALTER TABLE \"public\".\"cpu\" ADD COLUMN IF NOT EXISTS \"time\" timestamp with time zone, ADD COLUMN IF NOT EXISTS \"v\" bigint"
        );
    }

    #[test]
    fn test_unknown_variable_is_an_error() {
        let t = Template::new("CREATE TABLE {{tabel}} ()");
        assert!(matches!(
            t.render(&ctx()),
            Err(TemplateError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_unclosed_placeholder_fails_check() {
        let t = Template::new("CREATE TABLE {{table");
        assert!(matches!(t.check(), Err(TemplateError::Unclosed { .. })));
    }

    #[test]
    fn test_malformed_modifier_fails_check() {
        let t = Template::new("{{columns | explode}}");
        assert!(matches!(t.check(), Err(TemplateError::Malformed { .. })));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(full_table_ident("public", "cpu"), "\"public\".\"cpu\"");
        let col = Column::field("v", PgDataType::Float8);
        assert_eq!(column_def(&col), "\"v\" double precision");
    }
}
