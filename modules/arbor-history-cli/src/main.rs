use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arbor_events::{Category, Kind, PartitionId, ReadOptions};
use arbor_history::{Direction, Filter, HistoryConfig, HistoryService, Signal, Span};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor-history", about = "Inspect and feed the Arbor event history")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List known partitions with their metadata
    Partitions,
    /// Show metadata for one partition
    Info { partition: PartitionId },
    /// Read one partition in sequence order
    Read {
        partition: PartitionId,
        #[arg(long)]
        from_seq: Option<i64>,
        #[arg(long)]
        to_seq: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Filter the global partition; FILTER is a JSON filter object
    Query {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Merge partitions into one chronology over a time span
    Timeline {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
        #[arg(long = "partition")]
        partitions: Vec<PartitionId>,
        #[arg(long = "category")]
        categories: Vec<String>,
        #[arg(long = "kind")]
        kinds: Vec<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        correlation: Option<String>,
    },
    /// Follow causation links from one event
    Chain {
        event_id: String,
        /// Walk descendants instead of ancestors
        #[arg(long)]
        forward: bool,
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Record signals from a JSON-lines file
    Ingest { file: PathBuf },
    /// Aggregate counts over the whole history
    Stats {
        #[arg(long)]
        filter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("arbor=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = HistoryConfig::from_env().context("Failed to load history config")?;
    let history = HistoryService::start(config)
        .await
        .context("Failed to start history service")?;

    let outcome = run(&history, cli.command).await;
    history.shutdown().await;
    outcome
}

async fn run(history: &HistoryService, command: Command) -> Result<()> {
    match command {
        Command::Partitions => {
            let infos = history
                .list_partitions()
                .iter()
                .map(|p| history.partition_info(p))
                .collect::<Result<Vec<_>, _>>()?;
            print(&infos)
        }
        Command::Info { partition } => print(&history.partition_info(&partition)?),
        Command::Read {
            partition,
            from_seq,
            to_seq,
            limit,
        } => {
            let options = ReadOptions {
                from_sequence: from_seq,
                to_sequence: to_seq,
                limit,
            };
            print(&history.read(&partition, options).await?)
        }
        Command::Query { filter } => {
            let filter = parse_filter(filter.as_deref())?;
            print(&history.query(&filter).await?)
        }
        Command::Timeline {
            from,
            to,
            partitions,
            categories,
            kinds,
            agent,
            correlation,
        } => {
            let span = Span {
                from,
                to,
                partitions,
                categories: categories.iter().map(|c| Category::parse(c)).collect(),
                kinds: kinds.iter().map(|k| Kind::parse(k)).collect(),
                agent_id: agent,
                correlation_id: correlation,
            };
            print(&history.span_query(&span).await?)
        }
        Command::Chain {
            event_id,
            forward,
            depth,
        } => {
            let direction = if forward {
                Direction::Forward
            } else {
                Direction::Backward
            };
            print(&history.causal_chain(&event_id, direction, depth).await?)
        }
        Command::Ingest { file } => ingest(history, &file).await,
        Command::Stats { filter } => {
            let filter = parse_filter(filter.as_deref())?;
            print(&json!({
                "partitions": history.list_partitions().len(),
                "by_category": history.count_by_category(&filter).await?,
                "by_type": history.type_distribution(&filter).await?,
                "errors": history.error_count(&filter).await?,
                "decode_failures": history.decode_failures(),
            }))
        }
    }
}

async fn ingest(history: &HistoryService, path: &Path) -> Result<()> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut recorded = 0usize;
    let mut skipped = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let signal: Signal = match serde_json::from_str(&line) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed signal");
                skipped += 1;
                continue;
            }
        };
        history
            .record_signal(&signal)
            .await
            .with_context(|| format!("Failed to record signal on line {line_no}"))?;
        recorded += 1;
    }

    info!(recorded, skipped, file = %path.display(), "Ingest complete");
    print(&json!({ "recorded": recorded, "skipped": skipped }))
}

fn parse_filter(raw: Option<&str>) -> Result<Filter> {
    match raw {
        None => Ok(Filter::new()),
        Some(raw) => serde_json::from_str(raw).context("Invalid filter JSON"),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
