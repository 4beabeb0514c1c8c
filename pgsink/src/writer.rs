//! Write-cycle orchestration: group metrics by measurement, reconcile the
//! target tables, resolve tag ids, bulk insert. One connection writes
//! sub-batches sequentially and propagates transient errors for the caller
//! to retry; with a pool, sub-batches fan out to worker tasks that retry
//! transient failures themselves with capped exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use models::Metric;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::SinkConfig;
use crate::db::postgres::PgDb;
use crate::db::{Db, RowSource};
use crate::error::{Error, Result, TagTableSnafu};
use crate::layout::ColumnLayout;
use crate::sqltemplate::full_table_ident;
use crate::table_manager::TableManager;
use crate::table_source::TableSource;
use crate::tags_cache::TagsCache;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub struct PgSink {
    config: Arc<SinkConfig>,
    layout: ColumnLayout,
    manager: Arc<TableManager>,
    tags: Arc<TagsCache>,
    db: Box<dyn Db>,
    workers: Option<Workers>,
    cancel: CancellationToken,
}

struct Workers {
    tx: mpsc::Sender<TableSource>,
    handles: Vec<JoinHandle<()>>,
}

impl PgSink {
    /// Connect to the configured database and, with `pool_size` above one,
    /// start the writer workers.
    pub async fn connect(config: SinkConfig) -> Result<Self> {
        config.validate()?;
        let db = PgDb::connect(&config.connection).await?;
        let mut sink = Self::build(config, Box::new(db))?;
        if sink.config.pool_size > 1 {
            sink.spawn_workers().await?;
        }
        Ok(sink)
    }

    /// Build a sink over any database implementation. No workers are
    /// started; writes run sequentially on the given handle.
    pub fn with_db(config: SinkConfig, db: Box<dyn Db>) -> Result<Self> {
        Self::build(config, db)
    }

    fn build(config: SinkConfig, db: Box<dyn Db>) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let manager = Arc::new(TableManager::new(&config));
        let tags = Arc::new(TagsCache::new(
            config.schema.clone(),
            layout,
            config.tag_cache_size,
        ));
        Ok(Self {
            config: Arc::new(config),
            layout,
            manager,
            tags,
            db,
            workers: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn manager(&self) -> &Arc<TableManager> {
        &self.manager
    }

    /// Write a batch. Sub-batches (one per measurement) either all go
    /// through, get dropped individually on permanent errors, or the whole
    /// call fails with a transient error for the caller to retry.
    pub async fn write(&mut self, metrics: Vec<Metric>) -> Result<()> {
        let cached_tag_sets = self.tags.usage().await;
        debug!(
            cached_tag_sets,
            metrics = metrics.len(),
            "starting write cycle"
        );
        let sources = self.partition(metrics);
        match &self.workers {
            Some(workers) => {
                for source in sources {
                    tokio::select! {
                        result = workers.tx.send(source) => {
                            if result.is_err() {
                                return Err(Error::Internal {
                                    reason: "writer workers are gone".to_string(),
                                });
                            }
                        }
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
                Ok(())
            }
            None => self.write_sequential(sources).await,
        }
    }

    /// Round-trip health probe on the primary connection.
    pub async fn healthy(&mut self) -> bool {
        self.db.is_alive().await
    }

    /// Drain the workers (bounded) and release the connections.
    pub async fn close(mut self) -> Result<()> {
        if let Some(workers) = self.workers.take() {
            drop(workers.tx);
            let drain = async {
                for handle in workers.handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
                warn!("shutdown timeout expired while draining writers; some metrics may be lost");
            }
        }
        self.cancel.cancel();
        Ok(())
    }

    fn partition(&self, metrics: Vec<Metric>) -> Vec<TableSource> {
        let mut sources: HashMap<String, TableSource> = HashMap::new();
        for metric in metrics {
            sources
                .entry(metric.measurement().to_string())
                .or_insert_with(|| TableSource::new(metric.measurement(), self.layout))
                .add_metric(metric);
        }
        sources.into_values().collect()
    }

    async fn write_sequential(&mut self, sources: Vec<TableSource>) -> Result<()> {
        let single = sources.len() == 1;
        for mut source in sources {
            let result = write_measure(
                self.db.as_mut(),
                &self.manager,
                &self.tags,
                &self.config,
                &mut source,
            )
            .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    error!(
                        table = source.name(),
                        error = %err,
                        "write error (permanent, dropping sub-batch)"
                    );
                    if single {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn spawn_workers(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<TableSource>(self.config.pool_size);
        let rx = Arc::new(Mutex::new(rx));
        let max_backoff = Duration::from_millis(self.config.retry_max_backoff_ms);

        let mut handles = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            let mut db: Box<dyn Db> = Box::new(PgDb::connect(&self.config.connection).await?);
            let manager = Arc::clone(&self.manager);
            let tags = Arc::clone(&self.tags);
            let config = Arc::clone(&self.config);
            let cancel = self.cancel.clone();
            let rx = Arc::clone(&rx);

            handles.push(tokio::spawn(async move {
                loop {
                    let source = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            source = rx.recv() => source,
                        }
                    };
                    let Some(mut source) = source else { break };
                    write_with_retry(
                        db.as_mut(),
                        &manager,
                        &tags,
                        &config,
                        &mut source,
                        max_backoff,
                        &cancel,
                    )
                    .await;
                }
            }));
        }

        self.workers = Some(Workers { tx, handles });
        Ok(())
    }
}

/// Write one measurement's sub-batch: reconcile, resolve tags, insert.
async fn write_measure(
    db: &mut dyn Db,
    manager: &TableManager,
    tags: &TagsCache,
    config: &SinkConfig,
    source: &mut TableSource,
) -> Result<()> {
    if source.is_empty() {
        return Ok(());
    }

    manager.match_source(db, source).await?;

    if source.layout().uses_tag_table() {
        resolve_tags(db, manager, tags, config, source).await?;
    }

    let table = full_table_ident(&config.schema, source.name());
    let columns = source.metric_table_columns();
    let written = db.bulk_insert(&table, &columns, source).await?;
    debug!(table = source.name(), rows = written, "sub-batch written");
    Ok(())
}

/// Resolve an id for every distinct live tag set. Transient failures abort
/// the sub-batch for retry; permanent failures exclude just the affected
/// metrics, or fail the sub-batch under `foreign_tag_constraint`.
async fn resolve_tags(
    db: &mut dyn Db,
    manager: &TableManager,
    tags: &TagsCache,
    config: &SinkConfig,
    source: &mut TableSource,
) -> Result<()> {
    let tag_table = manager.tag_table_name(source.name());
    let tag_columns = manager.cached_columns(&tag_table).await;

    for (key, metric) in source.distinct_tag_sets() {
        match tags.tag_id(db, &tag_table, &tag_columns, &metric).await {
            Ok(id) => source.set_tag_id(key, id),
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                if config.foreign_tag_constraint {
                    return TagTableSnafu {
                        table: tag_table.clone(),
                        reason: err.to_string(),
                    }
                    .fail();
                }
                // tags do not change over time; once the operator fixes the
                // tag table, later batches will fill the gap
                warn!(
                    table = %tag_table,
                    error = %err,
                    "tag set not resolvable, excluding its metrics from the batch"
                );
                source.drop_tag_set(key);
            }
        }
    }
    Ok(())
}

async fn write_with_retry(
    db: &mut dyn Db,
    manager: &TableManager,
    tags: &TagsCache,
    config: &SinkConfig,
    source: &mut TableSource,
    max_backoff: Duration,
    cancel: &CancellationToken,
) {
    let mut backoff = Duration::ZERO;
    loop {
        match write_measure(db, manager, tags, config, source).await {
            Ok(()) => return,
            Err(err) if !err.is_transient() => {
                error!(
                    table = source.name(),
                    error = %err,
                    "write error (permanent, dropping sub-batch)"
                );
                return;
            }
            Err(err) => {
                warn!(
                    table = source.name(),
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "write error (transient, will retry)"
                );
                source.reset();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff = if backoff.is_zero() {
                    Duration::from_millis(250)
                } else {
                    (backoff * 2).min(max_backoff)
                };
            }
        }
    }
}
