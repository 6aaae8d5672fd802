//! Pipeline supervisor
//!
//! Start order: table DDL on every sink (two-table mode only), then the
//! provider, the fetcher pool and the writer. Stop order follows channel
//! closure; the runner only waits for the three stages and collects their
//! reports.

use super::fetcher::{FetcherPool, FetcherSettings, FetcherStats};
use super::provider::{Provider, ProviderSettings, ProviderStats};
use super::writer::{Writer, WriterSettings, WriterStats};
use crate::error::{DroverError, Result};
use crate::http::HttpExecutor;
use crate::query::{Mode, QueryBuilder};
use crate::request::{BodyMutator, Target};
use crate::traits::{Record, Sink, Source, Subject};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Settings for all three stages
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    /// Run label stored on every record
    pub tag: String,
    pub provider: ProviderSettings,
    pub fetcher: FetcherSettings,
    pub writer: WriterSettings,
}

/// Summary of a finished run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub provider: ProviderStats,
    pub fetcher: FetcherStats,
    pub writer: WriterStats,
}

/// Wires the stages together for one subject
pub struct Runner<S: Subject> {
    source: Arc<dyn Source<S::Params>>,
    sinks: Vec<Arc<dyn Sink<S::Record>>>,
    query: Box<dyn QueryBuilder<S::Params>>,
    mutator: BodyMutator,
    target: Arc<Target>,
    executor: Arc<HttpExecutor>,
    settings: PipelineSettings,
}

impl<S: Subject> Runner<S> {
    pub fn new(
        source: Arc<dyn Source<S::Params>>,
        sinks: Vec<Arc<dyn Sink<S::Record>>>,
        query: Box<dyn QueryBuilder<S::Params>>,
        target: Arc<Target>,
        executor: Arc<HttpExecutor>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            sinks,
            query,
            mutator: BodyMutator::noop(),
            target,
            executor,
            settings,
        }
    }

    /// Inject a body template into every row that accepts one
    pub fn with_body_mutator(mut self, mutator: BodyMutator) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn mode(&self) -> Mode {
        self.query.mode()
    }

    /// Run `CREATE TABLE` on every sink when the record type supplies DDL
    pub async fn init_tables(&self) -> Result<()> {
        for sink in &self.sinks {
            let Some(ddl) = <S::Record as Record>::create_table_ddl(sink.table()) else {
                continue;
            };
            sink.init_table(&ddl).await.map_err(|e| {
                error!(
                    sink = sink.name(),
                    table = sink.table(),
                    "Table initialisation failed: {}",
                    e
                );
                DroverError::from(e)
            })?;
        }
        Ok(())
    }

    /// Run the pipeline to completion.
    ///
    /// In two-table mode this returns once the source is drained and every
    /// record has been flushed. In continuous mode it returns only after
    /// `cancel` fires. A provider failure is returned after the downstream
    /// stages have drained.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        let mode = self.mode();
        info!(
            mode = %mode,
            tag = %self.settings.tag,
            sinks = self.sinks.len(),
            "Pipeline starting"
        );

        if mode == Mode::TwoTable {
            self.init_tables().await?;
        }

        let provider = Provider::new(
            self.source,
            self.query,
            self.mutator,
            self.target,
            self.settings.provider,
        );
        let (requests, provider_handle) = provider.spawn(cancel.clone());

        let pool = FetcherPool::<S>::new(
            self.executor,
            self.settings.fetcher,
            self.settings.tag.as_str(),
        );
        let (results, fetcher_handle) = pool.spawn(requests, cancel.clone());

        let writer = Writer::new(self.sinks, self.settings.writer);
        let writer_handle = writer.spawn(results, cancel.clone());

        let (provider_out, fetcher_out, writer_out) =
            tokio::join!(provider_handle, fetcher_handle, writer_handle);

        let fetcher = fetcher_out.map_err(|e| DroverError::stage("fetcher", e.to_string()))?;
        let writer = writer_out.map_err(|e| DroverError::stage("writer", e.to_string()))?;
        let provider = provider_out.map_err(|e| DroverError::stage("provider", e.to_string()))??;

        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            requests = provider.requests,
            records = fetcher.records,
            written = writer.write.records_written,
            dropped = writer.dropped + fetcher.dropped,
            cancelled = cancel.is_cancelled(),
            "Pipeline finished"
        );

        Ok(RunReport {
            provider,
            fetcher,
            writer,
        })
    }
}
