//! In-memory database double.
//!
//! Implements the capability traits over a hash-map catalog and row store,
//! understanding exactly the statement shapes the engine emits (catalog
//! reads, templated DDL, column comments, tag lookups/upserts, generated
//! inserts). Statements are logged and failures can be scripted, which is
//! what the reconciliation and write-cycle tests are built on.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use models::Column;

use super::{Db, DbConn, DbError, DbResult, DbRow, DbTx, RowSource, SqlValue};

#[derive(Debug, Clone, PartialEq)]
pub struct MockColumn {
    pub name: String,
    pub data_type: String,
    pub comment: Option<String>,
}

impl MockColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// One recorded `bulk_insert` call.
#[derive(Debug, Clone, Default)]
pub struct BulkInsert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl BulkInsert {
    /// Value of `column` in row `row`, if the column was part of the call.
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

#[derive(Debug, Clone)]
pub struct TagRow {
    pub id: i64,
    pub values: BTreeMap<String, SqlValue>,
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    error: DbError,
    remaining: usize,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// `schema.table` -> column definitions, as the catalog would report them.
    catalog: HashMap<String, Vec<MockColumn>>,
    /// Every bulk insert, in call order.
    inserted: Vec<BulkInsert>,
    /// `schema.table` -> tag rows.
    tag_rows: HashMap<String, Vec<TagRow>>,
    next_tag_id: i64,
    pub exec_log: Vec<String>,
    pub query_log: Vec<String>,
    failures: Vec<Failure>,
}

impl MockState {
    /// Number of executed schema-altering statements (comments excluded).
    pub fn ddl_count(&self) -> usize {
        self.exec_log
            .iter()
            .filter(|sql| sql.starts_with("CREATE TABLE") || sql.starts_with("ALTER TABLE"))
            .count()
    }

    pub fn catalog_columns(&self, schema: &str, table: &str) -> Option<&Vec<MockColumn>> {
        self.catalog.get(&format!("{schema}.{table}"))
    }

    pub fn seed_table(&mut self, schema: &str, table: &str, columns: Vec<MockColumn>) {
        self.catalog.insert(format!("{schema}.{table}"), columns);
    }

    /// Bulk inserts targeting one table, in call order.
    pub fn inserted_into(&self, schema: &str, table: &str) -> Vec<&BulkInsert> {
        let ident = crate::sqltemplate::full_table_ident(schema, table);
        self.inserted.iter().filter(|b| b.table == ident).collect()
    }

    /// Total rows bulk-inserted into one table.
    pub fn row_count(&self, schema: &str, table: &str) -> usize {
        self.inserted_into(schema, table)
            .iter()
            .map(|b| b.rows.len())
            .sum()
    }

    pub fn tag_table_rows(&self, schema: &str, table: &str) -> &[TagRow] {
        self.tag_rows
            .get(&format!("{schema}.{table}"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn take_failure(&mut self, sql: &str) -> Option<DbError> {
        for failure in &mut self.failures {
            if failure.remaining > 0 && sql.contains(&failure.pattern) {
                failure.remaining -= 1;
                return Some(failure.error.clone());
            }
        }
        None
    }
}

/// Shareable mock database; clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` statements containing `pattern`.
    pub fn fail_when(&self, pattern: impl Into<String>, error: DbError, times: usize) {
        self.lock().failures.push(Failure {
            pattern: pattern.into(),
            error,
            remaining: times,
        });
    }
}

#[async_trait]
impl DbConn for MockDb {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        apply_exec(&mut self.lock(), sql, params)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
        apply_query(&mut self.lock(), sql, params)
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &mut dyn RowSource,
    ) -> DbResult<u64> {
        apply_bulk_insert(&self.state, table, columns, rows)
    }
}

#[async_trait]
impl Db for MockDb {
    async fn begin<'a>(&'a mut self) -> DbResult<Box<dyn DbTx + Send + 'a>> {
        self.lock().exec_log.push("BEGIN".to_string());
        Ok(Box::new(MockTx {
            state: Arc::clone(&self.state),
        }))
    }

    async fn is_alive(&mut self) -> bool {
        true
    }
}

pub struct MockTx {
    state: Arc<Mutex<MockState>>,
}

impl MockTx {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DbConn for MockTx {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        apply_exec(&mut self.lock(), sql, params)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
        apply_query(&mut self.lock(), sql, params)
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &mut dyn RowSource,
    ) -> DbResult<u64> {
        apply_bulk_insert(&self.state, table, columns, rows)
    }
}

#[async_trait]
impl DbTx for MockTx {
    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.lock().exec_log.push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.lock().exec_log.push("ROLLBACK".to_string());
        Ok(())
    }
}

fn apply_exec(state: &mut MockState, sql: &str, _params: &[SqlValue]) -> DbResult<u64> {
    state.exec_log.push(sql.to_string());
    if let Some(err) = state.take_failure(sql) {
        return Err(err);
    }
    if sql.starts_with("SELECT pg_advisory_xact_lock") {
        return Ok(0);
    }
    if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
        return create_table(state, rest).map(|_| 0);
    }
    if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
        return alter_table(state, rest).map(|_| 0);
    }
    if let Some(rest) = sql.strip_prefix("COMMENT ON COLUMN ") {
        return comment_column(state, rest).map(|_| 0);
    }
    Ok(0)
}

fn apply_query(state: &mut MockState, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
    state.query_log.push(sql.to_string());
    if let Some(err) = state.take_failure(sql) {
        return Err(err);
    }
    if sql.contains("information_schema.columns") {
        return catalog_query(state, params);
    }
    if sql.starts_with("SELECT \"tag_id\" FROM ") {
        return tag_select(state, sql, params);
    }
    if sql.starts_with("INSERT INTO ") && sql.contains("RETURNING") {
        return tag_insert(state, sql, params);
    }
    Ok(Vec::new())
}

fn apply_bulk_insert(
    state: &Arc<Mutex<MockState>>,
    table: &str,
    columns: &[Column],
    rows: &mut dyn RowSource,
) -> DbResult<u64> {
    {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let pseudo = format!("BULK INSERT {table}");
        state.exec_log.push(pseudo.clone());
        if let Some(err) = state.take_failure(&pseudo) {
            return Err(err);
        }
    }

    let mut buffered = Vec::new();
    rows.reset();
    while rows.next() {
        let values = rows
            .values()
            .map_err(|err| DbError::permanent(err.to_string()))?;
        buffered.push(values);
    }

    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    let count = buffered.len() as u64;
    state.inserted.push(BulkInsert {
        table: table.to_string(),
        columns: columns.iter().map(|c| c.name.clone()).collect(),
        rows: buffered,
    });
    Ok(count)
}

fn catalog_query(state: &MockState, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
    let (Some(SqlValue::Text(schema)), Some(SqlValue::Text(table))) =
        (params.first(), params.get(1))
    else {
        return Err(DbError::permanent("catalog query expects schema and table"));
    };
    let key = format!("{schema}.{table}");
    let columns = state.catalog.get(&key).cloned().unwrap_or_default();
    Ok(columns
        .into_iter()
        .map(|col| {
            DbRow::new(
                vec![
                    "column_name".to_string(),
                    "data_type".to_string(),
                    "column_comment".to_string(),
                ],
                vec![
                    SqlValue::Text(col.name),
                    SqlValue::Text(col.data_type),
                    col.comment.map(SqlValue::Text).unwrap_or(SqlValue::Null),
                ],
            )
        })
        .collect())
}

fn tag_select(state: &MockState, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
    let rest = &sql["SELECT \"tag_id\" FROM ".len()..];
    let (ident, where_clause) = match rest.split_once(" WHERE ") {
        Some((ident, clause)) => (ident, Some(clause)),
        None => (rest, None),
    };
    let (key, _) = parse_table_key(ident)?;

    let mut predicates: Vec<(String, Option<&SqlValue>)> = Vec::new();
    if let Some(clause) = where_clause {
        for part in clause.split(" AND ") {
            let part = part.trim();
            if let Some(col) = part.strip_suffix(" IS NULL") {
                predicates.push((unquote(col)?, None));
            } else if let Some((col, param)) = part.split_once(" = $") {
                let idx: usize = param
                    .trim()
                    .parse()
                    .map_err(|_| DbError::permanent(format!("bad placeholder in '{part}'")))?;
                predicates.push((unquote(col)?, params.get(idx - 1)));
            } else {
                return Err(DbError::permanent(format!("unparsable predicate '{part}'")));
            }
        }
    }

    let rows = state.tag_rows.get(&key).map(Vec::as_slice).unwrap_or(&[]);
    for row in rows {
        let matches = predicates.iter().all(|(col, expected)| {
            let actual = row.values.get(col).filter(|v| !v.is_null());
            match expected {
                None => actual.is_none(),
                Some(value) => actual == Some(*value),
            }
        });
        if matches {
            return Ok(vec![DbRow::new(
                vec!["tag_id".to_string()],
                vec![SqlValue::I64(row.id)],
            )]);
        }
    }
    Ok(Vec::new())
}

fn tag_insert(state: &mut MockState, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
    let rest = &sql["INSERT INTO ".len()..];
    let mut values: BTreeMap<String, SqlValue> = BTreeMap::new();
    let key = if let Some((ident, _)) = rest.split_once(" DEFAULT VALUES") {
        parse_table_key(ident)?.0
    } else {
        let (ident, cols) = rest
            .split_once(" (")
            .ok_or_else(|| DbError::permanent(format!("unparsable insert '{sql}'")))?;
        let (col_list, _) = cols
            .split_once(')')
            .ok_or_else(|| DbError::permanent(format!("unparsable insert '{sql}'")))?;
        for (idx, col) in split_top_level(col_list).into_iter().enumerate() {
            let name = unquote(&col)?;
            let value = params.get(idx).cloned().unwrap_or(SqlValue::Null);
            values.insert(name, value);
        }
        parse_table_key(ident)?.0
    };

    let live: BTreeMap<&String, &SqlValue> =
        values.iter().filter(|(_, v)| !v.is_null()).collect();
    let rows = state.tag_rows.entry(key).or_default();
    let duplicate = rows.iter().any(|row| {
        let existing: BTreeMap<&String, &SqlValue> =
            row.values.iter().filter(|(_, v)| !v.is_null()).collect();
        existing == live
    });
    if duplicate {
        // ON CONFLICT DO NOTHING: no row comes back
        return Ok(Vec::new());
    }

    state.next_tag_id += 1;
    let id = state.next_tag_id;
    rows.push(TagRow { id, values });
    Ok(vec![DbRow::new(
        vec!["tag_id".to_string()],
        vec![SqlValue::I64(id)],
    )])
}

fn create_table(state: &mut MockState, rest: &str) -> DbResult<()> {
    let paren = rest
        .find('(')
        .ok_or_else(|| DbError::permanent(format!("unparsable CREATE TABLE '{rest}'")))?;
    let (key, _) = parse_table_key(rest[..paren].trim())?;
    let close = rest
        .rfind(')')
        .ok_or_else(|| DbError::permanent(format!("unparsable CREATE TABLE '{rest}'")))?;
    let body = &rest[paren + 1..close];

    if state.catalog.contains_key(&key) {
        return Err(DbError::transient("relation already exists").with_sqlstate("42P07"));
    }

    let mut columns = Vec::new();
    for def in split_top_level(body) {
        if def.starts_with("PRIMARY KEY") || def.starts_with("FOREIGN KEY") {
            continue;
        }
        columns.push(parse_column_def(&def)?);
    }
    state.catalog.insert(key, columns);
    Ok(())
}

fn alter_table(state: &mut MockState, rest: &str) -> DbResult<()> {
    const ADD: &str = "ADD COLUMN IF NOT EXISTS ";
    let first = rest
        .find(ADD)
        .ok_or_else(|| DbError::permanent(format!("unparsable ALTER TABLE '{rest}'")))?;
    let (key, _) = parse_table_key(rest[..first].trim())?;

    let mut defs = Vec::new();
    for chunk in rest[first..].split(ADD) {
        let chunk = chunk.trim().trim_end_matches(',').trim();
        if !chunk.is_empty() {
            defs.push(parse_column_def(chunk)?);
        }
    }

    let columns = state
        .catalog
        .get_mut(&key)
        .ok_or_else(|| DbError::permanent("relation does not exist").with_sqlstate("42P01"))?;
    for def in defs {
        if !columns.iter().any(|c| c.name == def.name) {
            columns.push(def);
        }
    }
    Ok(())
}

fn comment_column(state: &mut MockState, rest: &str) -> DbResult<()> {
    let (target, literal) = rest
        .split_once(" IS ")
        .ok_or_else(|| DbError::permanent(format!("unparsable COMMENT '{rest}'")))?;
    let (schema, target) = take_quoted(target)?;
    let target = target.strip_prefix('.').unwrap_or(target);
    let (table, target) = take_quoted(target)?;
    let target = target.strip_prefix('.').unwrap_or(target);
    let (column, _) = take_quoted(target)?;
    let comment = literal.trim().trim_matches('\'').to_string();

    let key = format!("{schema}.{table}");
    let columns = state
        .catalog
        .get_mut(&key)
        .ok_or_else(|| DbError::permanent("relation does not exist").with_sqlstate("42P01"))?;
    let col = columns
        .iter_mut()
        .find(|c| c.name == column)
        .ok_or_else(|| DbError::permanent("column does not exist").with_sqlstate("42703"))?;
    col.comment = Some(comment);
    Ok(())
}

fn parse_column_def(def: &str) -> DbResult<MockColumn> {
    let (name, rest) = take_quoted(def)?;
    let data_type = match rest.trim() {
        // the catalog reports serials as their base type
        "bigserial" => "bigint".to_string(),
        other => other.to_string(),
    };
    Ok(MockColumn::new(name, data_type))
}

/// Split on commas that are not inside double quotes.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    parts
}

/// `"schema"."table"` -> (`schema.table`, table).
fn parse_table_key(ident: &str) -> DbResult<(String, String)> {
    let (schema, rest) = take_quoted(ident)?;
    let rest = rest
        .strip_prefix('.')
        .ok_or_else(|| DbError::permanent(format!("unqualified identifier '{ident}'")))?;
    let (table, _) = take_quoted(rest)?;
    Ok((format!("{schema}.{table}"), table))
}

fn unquote(s: &str) -> DbResult<String> {
    take_quoted(s).map(|(name, _)| name)
}

/// Read one leading `"quoted"` identifier, un-doubling embedded quotes.
fn take_quoted(s: &str) -> DbResult<(String, &str)> {
    let s = s.trim_start();
    let rest = s
        .strip_prefix('"')
        .ok_or_else(|| DbError::permanent(format!("expected quoted identifier at '{s}'")))?;
    let mut name = String::new();
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let ch = rest[i..]
            .chars()
            .next()
            .ok_or_else(|| DbError::permanent("invalid identifier"))?;
        if ch == '"' {
            if rest[i + 1..].starts_with('"') {
                name.push('"');
                i += 2;
            } else {
                return Ok((name, &rest[i + 1..]));
            }
        } else {
            name.push(ch);
            i += ch.len_utf8();
        }
    }
    Err(DbError::permanent(format!("unterminated identifier '{s}'")))
}
