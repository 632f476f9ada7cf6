//! Ingestion pipeline orchestration: parse, collapse, then emit a script or deliver to a sink.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cnae_adapters::{parse, ParseOutcome, ParserConfig, TextSource};
use cnae_core::{
    batch, collapse_duplicates, IngestError, Record, DEFAULT_DELIVERY_BATCH_SIZE,
    DEFAULT_SQL_CHUNK_SIZE,
};
use cnae_storage::{RecordSink, ScriptArtifact, ScriptStore, SqlEmitter, TargetTable};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cnae-sync";

/// States a batch and its records move through inside [`UpsertDriver::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    BatchSent,
    BatchOk,
    BatchFailed,
    PerRecordRetry,
    RecordOk,
    RecordFailed,
    Completed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::BatchSent => "BATCH_SENT",
            DeliveryState::BatchOk => "BATCH_OK",
            DeliveryState::BatchFailed => "BATCH_FAILED",
            DeliveryState::PerRecordRetry => "PER_RECORD_RETRY",
            DeliveryState::RecordOk => "RECORD_OK",
            DeliveryState::RecordFailed => "RECORD_FAILED",
            DeliveryState::Completed => "COMPLETED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub records: usize,
    /// `BATCH_OK`, or `PER_RECORD_RETRY` when the batch call failed and records were resent one by one.
    pub state: DeliveryState,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<DeliveryFailure>,
    pub batches: Vec<BatchOutcome>,
    pub batches_failed: usize,
}

/// Sends records to a sink batch by batch; a failed batch is retried once per record.
#[derive(Debug, Clone)]
pub struct UpsertDriver {
    batch_size: usize,
    conflict_key: String,
}

impl UpsertDriver {
    pub fn new(batch_size: usize) -> Result<Self, IngestError> {
        if batch_size == 0 {
            return Err(IngestError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            batch_size,
            conflict_key: TargetTable::default().key_column,
        })
    }

    pub fn with_conflict_key(mut self, conflict_key: impl Into<String>) -> Self {
        self.conflict_key = conflict_key.into();
        self
    }

    /// Delivers every batch in order. Per-batch and per-record failures land in the
    /// report; only a failed probe before the first batch is returned as an error.
    pub async fn deliver(
        &self,
        records: &[Record],
        sink: &dyn RecordSink,
    ) -> Result<DeliveryReport, IngestError> {
        sink.probe()
            .await
            .map_err(|e| IngestError::SinkUnreachable(format!("{}: {e}", sink.name())))?;

        let mut report = DeliveryReport::default();
        for current in batch(records, self.batch_size)? {
            let span = info_span!("deliver_batch", batch = current.index, records = current.len());
            let outcome = self
                .deliver_batch(current.index, current.records, sink, &mut report)
                .instrument(span)
                .await;
            report.batches.push(outcome);
        }

        info!(
            state = %DeliveryState::Completed,
            sink = sink.name(),
            succeeded = report.succeeded,
            failed = report.failed,
            batches = report.batches.len(),
            "delivery completed"
        );
        Ok(report)
    }

    async fn deliver_batch(
        &self,
        index: usize,
        records: &[Record],
        sink: &dyn RecordSink,
        report: &mut DeliveryReport,
    ) -> BatchOutcome {
        debug!(state = %DeliveryState::Pending, "batch queued");
        debug!(state = %DeliveryState::BatchSent, "sending batch");
        match sink.upsert(records, &self.conflict_key).await {
            Ok(()) => {
                let state = DeliveryState::BatchOk;
                report.succeeded += records.len();
                info!(%state, "batch upserted");
                BatchOutcome {
                    index,
                    records: records.len(),
                    state,
                    failed: 0,
                }
            }
            Err(err) => {
                let batch_error = IngestError::BatchDelivery {
                    batch: index,
                    message: err.to_string(),
                };
                warn!(state = %DeliveryState::BatchFailed, error = %batch_error, "retrying records individually");
                report.batches_failed += 1;

                let state = DeliveryState::PerRecordRetry;
                let mut failed = 0usize;
                for record in records {
                    match sink
                        .upsert(std::slice::from_ref(record), &self.conflict_key)
                        .await
                    {
                        Ok(()) => {
                            debug!(code = %record.code, state = %DeliveryState::RecordOk, "record upserted");
                            report.succeeded += 1;
                        }
                        Err(err) => {
                            let record_error = IngestError::RecordDelivery {
                                code: record.code.clone(),
                                message: err.to_string(),
                            };
                            error!(code = %record.code, state = %DeliveryState::RecordFailed, error = %record_error, "record upsert failed");
                            failed += 1;
                            report.failed += 1;
                            report.failures.push(DeliveryFailure {
                                code: record.code.clone(),
                                error: err.to_string(),
                            });
                        }
                    }
                }
                BatchOutcome {
                    index,
                    records: records.len(),
                    state,
                    failed,
                }
            }
        }
    }
}

/// Delivers with the default conflict key.
pub async fn deliver(
    records: &[Record],
    sink: &dyn RecordSink,
    batch_size: usize,
) -> Result<DeliveryReport, IngestError> {
    UpsertDriver::new(batch_size)?.deliver(records, sink).await
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub parser: ParserConfig,
    pub table: TargetTable,
    pub batch_size: usize,
    pub chunk_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            table: TargetTable::default(),
            batch_size: DEFAULT_DELIVERY_BATCH_SIZE,
            chunk_size: DEFAULT_SQL_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Check,
    Emit,
    Deliver,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub parsed: usize,
    pub skipped: usize,
    pub headers: usize,
    pub duplicates: usize,
    pub artifact: Option<ScriptArtifact>,
    pub delivery: Option<DeliveryReport>,
    pub table_count: Option<u64>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.delivery.as_ref().map_or(0, |d| d.succeeded)
    }

    pub fn failed(&self) -> usize {
        self.delivery.as_ref().map_or(0, |d| d.failed)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={} source={} parsed={} skipped={} duplicates={}",
            self.run_id, self.source, self.parsed, self.skipped, self.duplicates
        )?;
        if let Some(artifact) = &self.artifact {
            write!(
                f,
                " script={} records={} bytes={} sha256={}",
                artifact.path.display(),
                artifact.stats.records,
                artifact.stats.bytes,
                artifact.sha256
            )?;
        }
        if self.delivery.is_some() {
            write!(f, " succeeded={} failed={}", self.succeeded(), self.failed())?;
        }
        if let Some(count) = self.table_count {
            write!(f, " table_rows={count}")?;
        }
        Ok(())
    }
}

struct Loaded {
    source: String,
    outcome: ParseOutcome,
    duplicates: usize,
}

pub struct IngestPipeline {
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(options: IngestOptions) -> Result<Self, IngestError> {
        options.table.validate()?;
        if options.batch_size == 0 || options.chunk_size == 0 {
            return Err(IngestError::Configuration(
                "batch and chunk sizes must be at least 1".to_string(),
            ));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    fn load(&self, source: &dyn TextSource) -> Result<Loaded> {
        let text = source
            .read_text()
            .with_context(|| format!("loading {}", source.describe()))?;
        let mut outcome = parse(&text, &self.options.parser);
        info!(
            source = %source.describe(),
            records = outcome.records.len(),
            skipped = outcome.skipped.len(),
            headers = outcome.headers,
            "parsed input"
        );
        if outcome.records.is_empty() {
            return Err(IngestError::EmptyInput.into());
        }

        let (records, duplicates) = collapse_duplicates(std::mem::take(&mut outcome.records));
        if duplicates > 0 {
            warn!(duplicates, "collapsed duplicate codes, later lines win");
        }
        outcome.records = records;
        Ok(Loaded {
            source: source.describe(),
            outcome,
            duplicates,
        })
    }

    fn summary(&self, mode: RunMode, started_at: DateTime<Utc>, loaded: &Loaded) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            mode,
            source: loaded.source.clone(),
            started_at,
            finished_at: Utc::now(),
            parsed: loaded.outcome.records.len() + loaded.duplicates,
            skipped: loaded.outcome.skipped.len(),
            headers: loaded.outcome.headers,
            duplicates: loaded.duplicates,
            artifact: None,
            delivery: None,
            table_count: None,
        }
    }

    /// Parses and validates without touching any store.
    pub fn check(&self, source: &dyn TextSource) -> Result<(RunSummary, ParseOutcome)> {
        let started_at = Utc::now();
        let loaded = self.load(source)?;
        let summary = self.summary(RunMode::Check, started_at, &loaded);
        Ok((summary, loaded.outcome))
    }

    pub async fn emit_script(&self, source: &dyn TextSource, output: &Path) -> Result<RunSummary> {
        if output.as_os_str().is_empty() {
            return Err(IngestError::Configuration("output path is required".to_string()).into());
        }
        let started_at = Utc::now();
        let loaded = self.load(source)?;

        let emitter = SqlEmitter::new(self.options.table.clone(), self.options.chunk_size)?;
        let artifact = ScriptStore::new(emitter)
            .write(output, &loaded.outcome.records)
            .await?;

        let mut summary = self.summary(RunMode::Emit, started_at, &loaded);
        summary.artifact = Some(artifact);
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    pub async fn deliver(&self, source: &dyn TextSource, sink: &dyn RecordSink) -> Result<RunSummary> {
        let started_at = Utc::now();
        let loaded = self.load(source)?;

        let driver = UpsertDriver::new(self.options.batch_size)?
            .with_conflict_key(self.options.table.key_column.clone());
        let report = driver.deliver(&loaded.outcome.records, sink).await?;

        let table_count = match sink.count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "could not verify table row count");
                None
            }
        };

        let mut summary = self.summary(RunMode::Deliver, started_at, &loaded);
        summary.delivery = Some(report);
        summary.table_count = table_count;
        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

/// Writes `<reports_dir>/<run_id>.json`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(format!("{}.json", summary.run_id));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
