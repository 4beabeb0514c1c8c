//! tokio-postgres binding of the DB capability traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use models::{Column, PgDataType};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{GenericClient, NoTls, Row};
use tracing::warn;

use super::{Db, DbConn, DbError, DbErrorKind, DbResult, DbRow, DbTx, RowSource, SqlValue};

/// Rows per generated INSERT statement.
const INSERT_CHUNK_ROWS: usize = 500;

/// A single postgres connection driving the capability traits.
pub struct PgDb {
    client: tokio_postgres::Client,
    conn_task: JoinHandle<()>,
}

impl PgDb {
    /// Connect with a libpq-style connection string (keyword/value or URI).
    pub async fn connect(connection: &str) -> DbResult<Self> {
        let (client, connection) = tokio_postgres::connect(connection, NoTls)
            .await
            .map_err(classify)?;
        let conn_task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Self { client, conn_task })
    }
}

impl Drop for PgDb {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

#[async_trait]
impl DbConn for PgDb {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        run_exec(&self.client, sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
        run_query(&self.client, sql, params).await
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &mut dyn RowSource,
    ) -> DbResult<u64> {
        run_bulk_insert(&self.client, table, columns, rows).await
    }
}

#[async_trait]
impl Db for PgDb {
    async fn begin<'a>(&'a mut self) -> DbResult<Box<dyn DbTx + Send + 'a>> {
        let tx = self.client.transaction().await.map_err(classify)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn is_alive(&mut self) -> bool {
        self.client.simple_query("SELECT 1").await.is_ok()
    }
}

pub struct PgTx<'a> {
    tx: tokio_postgres::Transaction<'a>,
}

#[async_trait]
impl DbConn for PgTx<'_> {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        run_exec(&self.tx, sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>> {
        run_query(&self.tx, sql, params).await
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: &mut dyn RowSource,
    ) -> DbResult<u64> {
        run_bulk_insert(&self.tx, table, columns, rows).await
    }
}

#[async_trait]
impl DbTx for PgTx<'_> {
    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await.map_err(classify)
    }
}

async fn run_exec<C>(client: &C, sql: &str, params: &[SqlValue]) -> DbResult<u64>
where
    C: GenericClient + Sync,
{
    let owned = to_params(params);
    let refs: Vec<&(dyn ToSql + Sync)> = owned
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client.execute(sql, &refs).await.map_err(classify)
}

async fn run_query<C>(client: &C, sql: &str, params: &[SqlValue]) -> DbResult<Vec<DbRow>>
where
    C: GenericClient + Sync,
{
    let owned = to_params(params);
    let refs: Vec<&(dyn ToSql + Sync)> = owned
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let rows = client.query(sql, &refs).await.map_err(classify)?;
    Ok(rows.iter().map(convert_row).collect())
}

async fn run_bulk_insert<C>(
    client: &C,
    table: &str,
    columns: &[Column],
    rows: &mut dyn RowSource,
) -> DbResult<u64>
where
    C: GenericClient + Sync,
{
    let mut total = 0u64;
    let mut buffer: Vec<Vec<SqlValue>> = Vec::with_capacity(INSERT_CHUNK_ROWS);

    rows.reset();
    while rows.next() {
        let values = rows
            .values()
            .map_err(|err| DbError::permanent(err.to_string()))?;
        buffer.push(values);
        if buffer.len() == INSERT_CHUNK_ROWS {
            total += flush_chunk(client, table, columns, &buffer).await?;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        total += flush_chunk(client, table, columns, &buffer).await?;
    }
    Ok(total)
}

async fn flush_chunk<C>(
    client: &C,
    table: &str,
    columns: &[Column],
    rows: &[Vec<SqlValue>],
) -> DbResult<u64>
where
    C: GenericClient + Sync,
{
    let sql = insert_sql(table, columns, rows.len());
    let flat: Vec<SqlValue> = rows.iter().flatten().cloned().collect();
    let owned = to_params(&flat);
    let refs: Vec<&(dyn ToSql + Sync)> = owned
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client.execute(&sql, &refs).await.map_err(classify)
}

/// Build `INSERT INTO t ("a", "b") VALUES ($1, $2::numeric), (...)` with an
/// explicit cast wherever the bound representation differs from the column
/// type (u64 travels as text, timestamps always travel with a zone).
fn insert_sql(table: &str, columns: &[Column], row_count: usize) -> String {
    let col_list: Vec<String> = columns
        .iter()
        .map(|c| crate::sqltemplate::quote_ident(&c.name))
        .collect();
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, col_list.join(", "));
    let width = columns.len();
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&(row * width + i + 1).to_string());
            sql.push_str(cast_suffix(column.data_type));
        }
        sql.push(')');
    }
    sql
}

fn cast_suffix(data_type: PgDataType) -> &'static str {
    match data_type {
        PgDataType::Numeric => "::numeric",
        PgDataType::Timestamp => "::timestamp",
        _ => "",
    }
}

fn to_params(values: &[SqlValue]) -> Vec<Box<dyn ToSql + Send + Sync>> {
    values.iter().map(to_param).collect()
}

fn to_param(value: &SqlValue) -> Box<dyn ToSql + Send + Sync> {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Bool(v) => Box::new(*v),
        SqlValue::I64(v) => Box::new(*v),
        // bound as text and cast server-side; bigint cannot hold the range
        SqlValue::U64(v) => Box::new(v.to_string()),
        SqlValue::F64(v) => Box::new(*v),
        SqlValue::Text(v) => Box::new(v.clone()),
        SqlValue::TimestampTz(v) => Box::new(*v),
        SqlValue::Json(v) => Box::new(v.clone()),
    }
}

fn convert_row(row: &Row) -> DbRow {
    let mut names = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        names.push(column.name().to_string());
        values.push(convert_value(row, idx, column.type_()));
    }
    DbRow::new(names, values)
}

fn convert_value(row: &Row, idx: usize, ty: &Type) -> SqlValue {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).ok().flatten().map(SqlValue::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::I64(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::I64(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).ok().flatten().map(SqlValue::I64)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::F64(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).ok().flatten().map(SqlValue::F64)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::TimestampTz)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Json)
    } else {
        row.try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Text)
    };
    value.unwrap_or(SqlValue::Null)
}

/// Map a driver error into the transient/permanent taxonomy.
///
/// SQLSTATE classes that resolve themselves when the whole transaction is
/// replayed (another worker created the table first, deadlock victim,
/// resource pressure) are transient; everything else the server reports is
/// permanent. Errors without a server code are connection-level and
/// retryable only when the connection actually went away.
fn classify(err: tokio_postgres::Error) -> DbError {
    let sqlstate = err.code().map(|c| c.code().to_string());
    let message = match err.as_db_error() {
        Some(db_err) => match db_err.detail() {
            Some(detail) => format!("{}; {}", db_err.message(), detail),
            None => db_err.message().to_string(),
        },
        None => err.to_string(),
    };

    let transient = match err.code() {
        Some(code) => is_transient_code(code, &message),
        None => err.is_closed(),
    };

    DbError {
        kind: if transient {
            DbErrorKind::Transient
        } else {
            DbErrorKind::Permanent
        },
        message,
        sqlstate,
    }
}

fn is_transient_code(code: &SqlState, message: &str) -> bool {
    let c = code.code();
    if c.len() < 2 {
        return false;
    }
    match &c[..2] {
        // connection exceptions
        "08" => true,
        // unique_violation on the type catalog: two workers creating the
        // same table at once
        "23" => c == "23505" && message.contains("pg_type_typname_nsp_index"),
        // invalid transaction state
        "25" => true,
        // transaction rollback: deadlock victim retries cleanly
        "40" => c == "40P01",
        // duplicate column / duplicate table: another worker got there first
        "42" => c == "42701" || c == "42P07",
        // insufficient resources
        "53" => true,
        // operator intervention, except query_canceled and database_dropped
        "57" => c != "57014" && c != "57P04",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql_numbers_and_casts() {
        let columns = vec![
            Column::time(),
            Column::field("u", PgDataType::Numeric),
            Column::field("v", PgDataType::Float8),
        ];
        let sql = insert_sql("\"public\".\"cpu\"", &columns, 2);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"cpu\" (\"time\", \"u\", \"v\") VALUES \
             ($1, $2::numeric, $3), ($4, $5::numeric, $6)"
        );
    }

    #[test]
    fn test_cast_suffix_only_where_needed() {
        assert_eq!(cast_suffix(PgDataType::Numeric), "::numeric");
        assert_eq!(cast_suffix(PgDataType::Timestamp), "::timestamp");
        assert_eq!(cast_suffix(PgDataType::Text), "");
    }
}
