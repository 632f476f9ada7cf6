use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cnae_adapters::{source_for_input, ParserConfig};
use cnae_core::{ValidationMode, DEFAULT_DELIVERY_BATCH_SIZE, DEFAULT_SQL_CHUNK_SIZE};
use cnae_storage::{
    PostgresConfig, PostgresSink, PostgrestSink, RecordSink, SinkConfig, TargetTable,
};
use cnae_sync::{write_run_report, IngestOptions, IngestPipeline, RunSummary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cnae-ingest")]
#[command(about = "Load CNAE classifications into a keyed store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render an idempotent SQL upsert script.
    Emit {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, short, default_value = "cnae_classifications_upsert.sql")]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SQL_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Upsert records into a live store in batches.
    Deliver {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, default_value_t = DEFAULT_DELIVERY_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long, value_enum, default_value_t = SinkKind::Postgrest)]
        sink: SinkKind,
    },
    /// Parse and validate only.
    Check {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Input file, `-` for stdin. Defaults to the bundled dataset.
    #[arg(long, short)]
    input: Option<PathBuf>,
    #[arg(long, default_value = "lenient")]
    mode: ValidationMode,
    /// Target table, optionally schema-qualified.
    #[arg(long)]
    table: Option<String>,
    /// YAML file mapping the table and column names.
    #[arg(long)]
    table_config: Option<PathBuf>,
    /// Directory receiving `<run_id>.json`.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkKind {
    Postgrest,
    Postgres,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CNAE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_table(common: &CommonArgs) -> Result<TargetTable> {
    let mut table = match &common.table_config {
        Some(path) => TargetTable::from_yaml_file(path)?,
        None => TargetTable::default(),
    };
    if let Ok(name) = std::env::var("CNAE_TABLE") {
        if !name.trim().is_empty() {
            table = table.with_table(name.trim());
        }
    }
    if let Some(name) = &common.table {
        table = table.with_table(name.clone());
    }
    table.validate()?;
    Ok(table)
}

fn pipeline(common: &CommonArgs, batch_size: usize, chunk_size: usize) -> Result<IngestPipeline> {
    let options = IngestOptions {
        parser: ParserConfig::with_mode(common.mode),
        table: resolve_table(common)?,
        batch_size,
        chunk_size,
    };
    Ok(IngestPipeline::new(options)?)
}

async fn finish(summary: &RunSummary, report_dir: Option<&Path>) -> Result<()> {
    println!("{summary}");
    if let Some(delivery) = &summary.delivery {
        for failure in &delivery.failures {
            println!("failed: {} ({})", failure.code, failure.error);
        }
    }
    if let Some(dir) = report_dir {
        let path = write_run_report(dir, summary).await?;
        info!(report = %path.display(), "run report written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("loading .env");
        }
    }
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Emit {
            common,
            output,
            chunk_size,
        } => {
            let pipeline = pipeline(&common, DEFAULT_DELIVERY_BATCH_SIZE, chunk_size)?;
            let source = source_for_input(common.input.as_deref());
            let summary = pipeline.emit_script(source.as_ref(), &output).await?;
            finish(&summary, common.report_dir.as_deref()).await?;
        }
        Commands::Deliver {
            common,
            batch_size,
            sink,
        } => {
            let pipeline = pipeline(&common, batch_size, DEFAULT_SQL_CHUNK_SIZE)?;
            let table = pipeline.options().table.clone();
            let sink: Box<dyn RecordSink> = match sink {
                SinkKind::Postgrest => Box::new(PostgrestSink::new(SinkConfig::from_env(table)?)?),
                SinkKind::Postgres => {
                    Box::new(PostgresSink::connect(PostgresConfig::from_env(table)?).await?)
                }
            };
            let source = source_for_input(common.input.as_deref());
            let summary = pipeline.deliver(source.as_ref(), sink.as_ref()).await?;
            if summary.failed() > 0 {
                warn!(failed = summary.failed(), "some records were not delivered");
            }
            finish(&summary, common.report_dir.as_deref()).await?;
        }
        Commands::Check { common } => {
            let pipeline = pipeline(&common, DEFAULT_DELIVERY_BATCH_SIZE, DEFAULT_SQL_CHUNK_SIZE)?;
            let source = source_for_input(common.input.as_deref());
            let (summary, outcome) = pipeline.check(source.as_ref())?;
            for skipped in &outcome.skipped {
                println!("skipped {}: {}", skipped.to_error(), skipped.content);
            }
            finish(&summary, common.report_dir.as_deref()).await?;
        }
    }

    Ok(())
}
