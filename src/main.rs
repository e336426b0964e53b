use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use spanvault_core::config::CompressionCodec;
use spanvault_core::span::{Span, TraceId};
use spanvault_core::storage::{SpanConsumer, SpanStore};
use spanvault_storage::{EngineBuilder, StorageEngine};
use tokio::io::AsyncBufReadExt;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, ValueEnum)]
enum Codec {
    /// No compression of log segments.
    None,
    /// LZ4 compression of log segments (default).
    #[default]
    Lz4,
}

impl From<Codec> for CompressionCodec {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::None => CompressionCodec::None,
            Codec::Lz4 => CompressionCodec::Lz4,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "spanvault",
    about = "Log-backed distributed trace storage",
    version
)]
struct Cli {
    /// Directory for the span log and aggregated state.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// How long traces and dependency buckets are kept, in hours.
    #[arg(long, default_value = "168")]
    retention_hours: u64,

    /// Compression codec for the span log.
    #[arg(long, value_enum, default_value = "lz4")]
    compression: Codec,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read spans as JSON Lines from stdin (one span object per line) and
    /// store them. Exits on EOF or Ctrl-C after draining aggregation.
    Ingest,
    /// Print all spans of one trace, by 32-char hex trace ID.
    Trace { trace_id: String },
    /// List every service that has reported spans.
    Services,
    /// List the operations of one service.
    Operations { service: String },
    /// Print the service dependency graph over a lookback window.
    Dependencies {
        /// Window ending now, in hours.
        #[arg(long, default_value = "24")]
        lookback_hours: u64,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spanvault")
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingest
// ─────────────────────────────────────────────────────────────────────────────

const INGEST_BATCH: usize = 512;

/// Reads JSONL spans from stdin and feeds them to the engine in batches.
/// Lines that do not parse are counted and skipped; validation rejections
/// are reported by the consumer per span.
async fn run_ingest(engine: &StorageEngine) -> anyhow::Result<()> {
    let consumer = engine.span_consumer();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut batch: Vec<Span> = Vec::with_capacity(INGEST_BATCH);
    let (mut accepted, mut rejected, mut unparsable) = (0usize, 0usize, 0usize);
    let mut done = false;

    while !done {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut ctrl_c => {
                eprintln!("spanvault: interrupted, draining");
                None
            }
        };

        match line {
            Some(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Span>(&line) {
                    Ok(span) => batch.push(span),
                    Err(e) => {
                        unparsable += 1;
                        tracing::warn!(error = %e, "skipping unparsable line");
                    }
                }
            }
            None => done = true,
        }

        if batch.len() >= INGEST_BATCH || (done && !batch.is_empty()) {
            let report = consumer.accept(std::mem::take(&mut batch))?;
            accepted += report.accepted;
            rejected += report.rejected.len();
            for (index, reason) in &report.rejected {
                tracing::warn!(index, %reason, "span rejected");
            }
        }
    }

    eprintln!(
        "spanvault: accepted {accepted} spans ({rejected} rejected, {unparsable} unparsable)"
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spanvault=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let engine = EngineBuilder::new(data_dir.join("log"), data_dir.join("state"))
        .compression(cli.compression.clone().into())
        .retention(Duration::from_secs(cli.retention_hours * 3600))
        .build()?;

    // Aggregation catches up with anything left in the log by a previous
    // run before queries are answered.
    engine.wait_until_idle(Duration::from_secs(10)).await;
    let store = engine.span_store();

    match &cli.command {
        Command::Ingest => {
            run_ingest(&engine).await?;
            engine.wait_until_idle(Duration::from_secs(30)).await;
            let malformed = engine.malformed_records();
            if malformed > 0 {
                tracing::warn!(malformed, "records skipped during aggregation");
            }
        }
        Command::Trace { trace_id } => {
            let trace_id: TraceId = trace_id.parse()?;
            let spans = store.trace(&trace_id)?;
            if spans.is_empty() {
                eprintln!("spanvault: no such trace");
            } else {
                println!("{}", serde_json::to_string_pretty(&spans)?);
            }
        }
        Command::Services => {
            for service in store.service_names()? {
                println!("{service}");
            }
        }
        Command::Operations { service } => {
            for operation in store.operation_names(service)? {
                println!("{operation}");
            }
        }
        Command::Dependencies { lookback_hours } => {
            let now = unix_micros();
            let min = now.saturating_sub(lookback_hours * 3_600_000_000);
            let links = store.dependencies(min, now)?;
            println!("{}", serde_json::to_string_pretty(&links)?);
        }
    }

    engine.close(Duration::from_secs(5)).await;
    Ok(())
}
