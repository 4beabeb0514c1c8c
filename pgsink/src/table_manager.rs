//! Schema reconciliation: guarantee the metric table (and its paired tag
//! table) holds a superset of the columns a batch requires before any row
//! is written.
//!
//! Checking happens in three rings: the in-memory column cache under a read
//! lock, the cache again under the write lock, and the database catalog
//! inside a transaction holding the schema advisory lock. Only the last
//! ring may execute DDL, so concurrent writers in this process and in other
//! processes serialize on the same point.

use std::collections::HashMap;
use std::sync::Arc;

use models::{sort_canonical, Column, ColumnRole, PgDataType, TAG_ID_COLUMN_NAME, TIME_COLUMN_NAME};
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::db::{Db, DbConn, DbRow, SqlValue};
use crate::error::{Result, UnresolvableColumnSnafu};
use crate::layout::ColumnLayout;
use crate::sqltemplate::{
    column_def, full_table_ident, quote_ident, quote_literal, RenderContext, Template,
};
use crate::table_source::TableSource;

/// Advisory-lock key serializing schema changes across every process that
/// shares the target schema. Fixed by convention; all writers must agree.
const SCHEMA_ADVISORY_LOCK_KEY: i64 = 0x7067_7369_6e6b; // "pgsink"

/// Comment attached to tag columns; without it, tags and fields are
/// indistinguishable once created. A pre-existing tag column lacking the
/// marker reads back as a field.
pub const TAG_COLUMN_COMMENT: &str = "tag";

const REFRESH_COLUMNS_SQL: &str = "SELECT column_name, data_type, \
     col_description(format('%I.%I', table_schema, table_name)::regclass::oid, ordinal_position) \
     AS column_comment \
     FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2";

/// Which template set applies to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Metric,
    Tag,
}

/// Cached column set for one table. `columns` is `None` until the catalog
/// has been read at least once.
#[derive(Debug)]
pub struct TableState {
    name: String,
    columns: Option<HashMap<String, Column>>,
}

impl TableState {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> Option<&HashMap<String, Column>> {
        self.columns.as_ref()
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct EnsureOutcome {
    /// Columns the table does not have and nothing could create, plus
    /// columns whose existing type cannot hold the required one. The caller
    /// drops the corresponding tags/fields and the rest of the batch
    /// proceeds.
    pub missing: Vec<Column>,
    /// Columns rejected before any statement was built (identifier over the
    /// byte limit). Never rendered into DDL.
    pub invalid: Vec<Column>,
}

impl EnsureOutcome {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

pub struct TableManager {
    schema: String,
    tag_table_suffix: String,
    layout: ColumnLayout,
    create_templates: Vec<Template>,
    add_column_templates: Vec<Template>,
    tag_table_create_templates: Vec<Template>,
    tag_table_add_column_templates: Vec<Template>,
    tables: Mutex<HashMap<String, Arc<RwLock<TableState>>>>,
}

impl TableManager {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            schema: config.schema.clone(),
            tag_table_suffix: config.tag_table_suffix.clone(),
            layout: config.layout(),
            create_templates: config.create_templates.clone(),
            add_column_templates: config.add_column_templates.clone(),
            tag_table_create_templates: config.tag_table_create_templates.clone(),
            tag_table_add_column_templates: config.tag_table_add_column_templates.clone(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tag_table_name(&self, measurement: &str) -> String {
        format!("{measurement}{}", self.tag_table_suffix)
    }

    /// Drop every cached column set. The next write re-reads the catalog.
    pub async fn clear_cache(&self) {
        self.tables.lock().await.clear();
    }

    /// Cached columns for `table`, empty if the catalog was never read.
    pub async fn cached_columns(&self, table: &str) -> Vec<Column> {
        let state = self.table(table).await;
        let guard = state.read().await;
        match &guard.columns {
            Some(columns) => {
                let mut out: Vec<Column> = columns.values().cloned().collect();
                sort_canonical(&mut out);
                out
            }
            None => Vec::new(),
        }
    }

    /// Ensure both tables backing `source` can hold everything the batch
    /// requires; anything that cannot be stored is dropped from the source
    /// (and logged) so the remaining rows still go through.
    pub async fn match_source(&self, db: &mut dyn Db, source: &mut TableSource) -> Result<()> {
        let metric_table = source.name().to_string();
        let tag_table = self
            .layout
            .uses_tag_table()
            .then(|| self.tag_table_name(source.name()));

        // fast path: read locks only, no database round-trip
        if let Some(unusable) = self
            .fast_path(source, &metric_table, tag_table.as_deref())
            .await
        {
            for column in &unusable {
                self.fail_column(source, &metric_table, column)?;
            }
            return Ok(());
        }

        let metric_state = self.table(&metric_table).await;
        let tag_state = match &tag_table {
            Some(name) => Some(self.table(name).await),
            None => None,
        };

        // Both write locks are taken through one helper so the ordering
        // invariant (tag table first) holds no matter the call site.
        let (tag_guard, mut metric_guard) =
            Self::acquire_pair(tag_state.as_ref(), &metric_state).await;

        if let Some(mut tag_guard) = tag_guard {
            let required = source.tag_table_columns();
            let outcome = self
                .ensure_locked(db, &mut tag_guard, &required, TableKind::Tag, source.name())
                .await?;
            self.apply_outcome(source, &tag_guard, &outcome)?;
        }

        let required = source.metric_table_columns();
        let outcome = self
            .ensure_locked(
                db,
                &mut metric_guard,
                &required,
                TableKind::Metric,
                source.name(),
            )
            .await?;
        self.apply_outcome(source, &metric_guard, &outcome)?;
        Ok(())
    }

    /// Reconcile one table directly. Used by callers that manage their own
    /// sources and by the scenario tests; `match_source` is the batched
    /// front door.
    pub async fn ensure_structure(
        &self,
        db: &mut dyn Db,
        measurement: &str,
        required: &[Column],
        kind: TableKind,
    ) -> Result<EnsureOutcome> {
        let table_name = match kind {
            TableKind::Metric => measurement.to_string(),
            TableKind::Tag => self.tag_table_name(measurement),
        };
        let state = self.table(&table_name).await;

        // fast path under the read lock
        {
            let guard = state.read().await;
            let (missing, unusable) = split_missing(&guard, required);
            if missing.is_empty() {
                return Ok(EnsureOutcome {
                    missing: unusable,
                    invalid: Vec::new(),
                });
            }
        }

        let mut guard = state.write().await;
        self.ensure_locked(db, &mut guard, required, kind, measurement)
            .await
    }

    async fn table(&self, name: &str) -> Arc<RwLock<TableState>> {
        let mut tables = self.tables.lock().await;
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TableState::new(name))))
            .clone()
    }

    /// Tag-before-metric lock acquisition, the only place both locks are
    /// taken.
    async fn acquire_pair<'a>(
        tag: Option<&'a Arc<RwLock<TableState>>>,
        metric: &'a Arc<RwLock<TableState>>,
    ) -> (
        Option<RwLockWriteGuard<'a, TableState>>,
        RwLockWriteGuard<'a, TableState>,
    ) {
        let tag_guard = match tag {
            Some(state) => Some(state.write().await),
            None => None,
        };
        let metric_guard = metric.write().await;
        (tag_guard, metric_guard)
    }

    /// Read-lock check of both tables. `Some(unusable)` means every
    /// required column is present (the unusable ones are type conflicts to
    /// drop); `None` means the slow path must run.
    async fn fast_path(
        &self,
        source: &TableSource,
        metric_table: &str,
        tag_table: Option<&str>,
    ) -> Option<Vec<Column>> {
        let mut unusable = Vec::new();

        if let Some(tag_table) = tag_table {
            let state = self.table(tag_table).await;
            let guard = state.read().await;
            let (missing, bad) = split_missing(&guard, &source.tag_table_columns());
            if !missing.is_empty() {
                return None;
            }
            unusable.extend(bad);
        }

        let state = self.table(metric_table).await;
        let guard = state.read().await;
        let (missing, bad) = split_missing(&guard, &source.metric_table_columns());
        if !missing.is_empty() {
            return None;
        }
        unusable.extend(bad);
        Some(unusable)
    }

    /// The reconciliation algorithm proper, run under the table's write
    /// lock.
    async fn ensure_locked(
        &self,
        db: &mut dyn Db,
        state: &mut TableState,
        required: &[Column],
        kind: TableKind,
        measurement: &str,
    ) -> Result<EnsureOutcome> {
        let mut required: Vec<Column> = required.to_vec();
        sort_canonical(&mut required);

        let mut outcome = EnsureOutcome::default();

        // identifier validation: never truncate, never render into DDL
        if !Column::identifier_valid(&state.name) {
            warn!(table = %state.name, "table name over the identifier byte limit");
            outcome.invalid = required;
            return Ok(outcome);
        }
        let (valid, invalid): (Vec<Column>, Vec<Column>) = required
            .into_iter()
            .partition(|c| Column::identifier_valid(&c.name));
        for column in &invalid {
            warn!(
                table = %state.name,
                column = %column.name,
                "column name over the identifier byte limit, excluded"
            );
        }
        outcome.invalid = invalid;
        let required = valid;

        // second ring: re-check under the write lock; a concurrent caller
        // may have resolved everything already
        let (missing, unusable) = split_missing(state, &required);
        if missing.is_empty() {
            self.log_unusable(state, &unusable);
            outcome.missing = unusable;
            return Ok(outcome);
        }

        // the cache is stale or empty: read the catalog
        let columns = query_columns(db, &self.schema, &state.name).await?;
        state.columns = Some(columns);
        let (missing, unusable) = split_missing(state, &required);
        if missing.is_empty() {
            self.log_unusable(state, &unusable);
            outcome.missing = unusable;
            return Ok(outcome);
        }

        let table_exists = state
            .columns
            .as_ref()
            .is_some_and(|columns| !columns.is_empty());
        if self.templates_for(kind, table_exists).is_empty() {
            warn!(
                table = %state.name,
                missing = missing.len(),
                "no template configured to {} the table, dropping unmatched columns",
                if table_exists { "alter" } else { "create" }
            );
            self.log_unusable(state, &unusable);
            outcome.missing = missing;
            outcome.missing.extend(unusable);
            return Ok(outcome);
        }

        // third ring: transaction + advisory lock, re-read, render, execute
        match self.run_ddl(db, state, &required, kind, measurement).await {
            Ok(()) => {}
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                error!(
                    table = %state.name,
                    error = %err,
                    "schema change failed permanently, dropping unmatched columns"
                );
                self.log_unusable(state, &unusable);
                outcome.missing = missing;
                outcome.missing.extend(unusable);
                return Ok(outcome);
            }
        }

        // whatever is still absent after a successful pass cannot be
        // resolved by this process
        let (still_missing, unusable) = split_missing(state, &required);
        self.log_unusable(state, &unusable);
        for column in &still_missing {
            warn!(
                table = %state.name,
                column = %column.name,
                "column still missing after schema change, dropping"
            );
        }
        outcome.missing = still_missing;
        outcome.missing.extend(unusable);
        Ok(outcome)
    }

    /// Transaction body: advisory lock, third catalog read, template
    /// execution, tag-role comments, cache refresh.
    async fn run_ddl(
        &self,
        db: &mut dyn Db,
        state: &mut TableState,
        required: &[Column],
        kind: TableKind,
        measurement: &str,
    ) -> Result<()> {
        let mut tx = db.begin().await?;

        tx.exec(
            "SELECT pg_advisory_xact_lock($1)",
            &[SqlValue::I64(SCHEMA_ADVISORY_LOCK_KEY)],
        )
        .await?;

        // a writer in another process may have raced us here
        let columns = query_columns(tx.as_mut(), &self.schema, &state.name).await?;
        let table_exists = !columns.is_empty();
        state.columns = Some(columns);

        let missing = state_missing(state, required);
        if missing.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        let templates = self.templates_for(kind, table_exists);
        if templates.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }

        let ctx = self.render_context(state, measurement, &missing);
        for template in templates {
            let sql = template.render(&ctx)?;
            debug!(table = %state.name, sql = %sql, "executing schema change");
            tx.exec(&sql, &[]).await?;
        }

        // persist the role marker for every new tag column
        for column in missing.iter().filter(|c| c.role == ColumnRole::Tag) {
            let sql = format!(
                "COMMENT ON COLUMN {}.{} IS {}",
                full_table_ident(&self.schema, &state.name),
                quote_ident(&column.name),
                quote_literal(TAG_COLUMN_COMMENT),
            );
            tx.exec(&sql, &[]).await?;
        }

        let columns = query_columns(tx.as_mut(), &self.schema, &state.name).await?;
        state.columns = Some(columns);
        tx.commit().await?;
        info!(table = %state.name, added = missing.len(), "schema updated");
        Ok(())
    }

    fn templates_for(&self, kind: TableKind, table_exists: bool) -> &[Template] {
        match (kind, table_exists) {
            (TableKind::Metric, false) => &self.create_templates,
            (TableKind::Metric, true) => &self.add_column_templates,
            (TableKind::Tag, false) => &self.tag_table_create_templates,
            (TableKind::Tag, true) => &self.tag_table_add_column_templates,
        }
    }

    fn render_context(
        &self,
        state: &TableState,
        measurement: &str,
        missing: &[Column],
    ) -> RenderContext {
        let mut all: Vec<Column> = state
            .columns
            .as_ref()
            .map(|columns| columns.values().cloned().collect())
            .unwrap_or_default();
        all.extend(missing.iter().cloned());
        sort_canonical(&mut all);

        let mut ctx = RenderContext::new();
        ctx.set_str("schema", quote_ident(&self.schema));
        ctx.set_str("table", full_table_ident(&self.schema, &state.name));
        ctx.set_str(
            "metric_table",
            full_table_ident(&self.schema, measurement),
        );
        ctx.set_str(
            "tag_table",
            full_table_ident(&self.schema, &self.tag_table_name(measurement)),
        );
        ctx.set_list("columns", missing.iter().map(column_def).collect());
        ctx.set_list("all_columns", all.iter().map(column_def).collect());
        ctx
    }

    fn apply_outcome(
        &self,
        source: &mut TableSource,
        state: &TableState,
        outcome: &EnsureOutcome,
    ) -> Result<()> {
        for column in outcome.invalid.iter().chain(outcome.missing.iter()) {
            self.fail_column(source, state.name(), column)?;
        }
        Ok(())
    }

    fn fail_column(
        &self,
        source: &mut TableSource,
        table: &str,
        column: &Column,
    ) -> Result<()> {
        match column.role {
            // without time or tag_id no row of this sub-batch can be
            // written at all
            ColumnRole::Time | ColumnRole::TagId => UnresolvableColumnSnafu {
                table: table.to_string(),
                column: column.name.clone(),
            }
            .fail(),
            _ => source.drop_column(column),
        }
    }

    fn log_unusable(&self, state: &TableState, unusable: &[Column]) {
        for column in unusable {
            let existing = state
                .columns
                .as_ref()
                .and_then(|columns| columns.get(&column.name))
                .map(|c| c.data_type);
            error!(
                table = %state.name,
                column = %column.name,
                required = ?column.data_type,
                existing = ?existing,
                "existing column type cannot hold the required type (permanent)"
            );
        }
    }

}

/// `required − state`, split into (absent, present-but-incompatible).
fn split_missing(state: &TableState, required: &[Column]) -> (Vec<Column>, Vec<Column>) {
    let Some(columns) = &state.columns else {
        return (required.to_vec(), Vec::new());
    };
    let mut missing = Vec::new();
    let mut unusable = Vec::new();
    for column in required {
        match columns.get(&column.name) {
            None => missing.push(column.clone()),
            Some(existing) if existing.data_type.can_contain(column.data_type) => {}
            Some(_) => unusable.push(column.clone()),
        }
    }
    (missing, unusable)
}

fn state_missing(state: &TableState, required: &[Column]) -> Vec<Column> {
    split_missing(state, required).0
}

async fn query_columns<C>(conn: &mut C, schema: &str, table: &str) -> Result<HashMap<String, Column>>
where
    C: DbConn + ?Sized,
{
    let rows = conn
        .query(
            REFRESH_COLUMNS_SQL,
            &[
                SqlValue::Text(schema.to_string()),
                SqlValue::Text(table.to_string()),
            ],
        )
        .await?;
    Ok(columns_from_rows(&rows))
}

fn columns_from_rows(rows: &[DbRow]) -> HashMap<String, Column> {
    let mut columns = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(column) = column_from_catalog(row) {
            columns.insert(column.name.clone(), column);
        }
    }
    columns
}

/// Rebuild a `Column` from a catalog row. Role inference: the fixed names
/// win, then the persisted comment marker, then Field.
fn column_from_catalog(row: &DbRow) -> Option<Column> {
    let name = row.get_str("column_name")?.to_string();
    let data_type = PgDataType::from_catalog(row.get_str("data_type").unwrap_or(""));
    let comment = row.get_str("column_comment");
    let role = if name == TIME_COLUMN_NAME {
        ColumnRole::Time
    } else if name == TAG_ID_COLUMN_NAME {
        ColumnRole::TagId
    } else if comment.is_some_and(|c| c.contains(TAG_COLUMN_COMMENT)) {
        ColumnRole::Tag
    } else {
        ColumnRole::Field
    };
    Some(Column::new(name, data_type, role))
}
