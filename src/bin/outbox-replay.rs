//! # Outbox Replay Tool
//!
//! Periodic replay of dual-write outbox items against the migration target.
//! Reads an NDJSON spool of pending items, drops expired ones, replays the
//! rest (bounded by `--max-items`, paced by `--sleep-ms`), and rewrites the
//! spool with whatever remains.
//!
//! Exit code 0 means a clean pass: no replayable items remain. Anything else
//! exits nonzero so a scheduler can alert on persistent failures.
//!
//! The target adapter here is the in-process stand-in; deployments link
//! their real target adapter and keep the same spool format and exit
//! contract.

use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use cutover_core::config::CutoverConfig;
use cutover_core::metrics::MigrationMetrics;
use cutover_core::retrieval::{MemoryBackend, Outbox, OutboxItem};

#[derive(Parser)]
#[command(name = "outbox-replay")]
#[command(about = "Replay retrieval dual-write outbox items against the target")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// NDJSON spool file holding pending outbox items
    #[arg(long, default_value = "outbox.ndjson")]
    spool: PathBuf,

    /// Count replayable items without issuing any target writes
    #[arg(long, conflicts_with = "apply")]
    dry_run: bool,

    /// Replay items and rewrite the spool
    #[arg(long, conflicts_with = "dry_run")]
    apply: bool,

    /// Maximum items to replay in this pass
    #[arg(long, default_value_t = 100)]
    max_items: usize,

    /// Delay between items, bounding blast radius on the target
    #[arg(long, default_value_t = 0)]
    sleep_ms: u64,
}

fn load_spool(path: &PathBuf) -> anyhow::Result<Vec<OutboxItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut items = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        items.push(serde_json::from_str(line)?);
    }
    Ok(items)
}

fn write_spool(path: &PathBuf, items: &[OutboxItem]) -> anyhow::Result<()> {
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = CutoverConfig::from_env()?;
    let metrics = MigrationMetrics::new();
    let outbox = Outbox::new(
        config.retrieval.outbox_max_items,
        config.retrieval.outbox_ttl(),
        Arc::clone(&metrics),
    );

    let items = load_spool(&cli.spool)?;
    info!(
        spool = %cli.spool.display(),
        pending = items.len(),
        "Loaded outbox spool"
    );
    for item in items {
        outbox.enqueue(item);
    }

    if cli.dry_run || !cli.apply {
        let report = outbox.dry_run();
        println!(
            "dry-run: replayable={} expired={}",
            report.remaining, report.dropped
        );
        return Ok(i32::from(report.remaining > 0));
    }

    let target = MemoryBackend::new(config.retrieval.target_backend.clone());
    let report = outbox
        .replay(&target, cli.max_items, Duration::from_millis(cli.sleep_ms))
        .await;

    write_spool(&cli.spool, &outbox.snapshot())?;

    info!(
        replayed = report.replayed,
        failed = report.failed,
        dropped = report.dropped,
        remaining = report.remaining,
        "Replay pass finished"
    );
    println!(
        "replayed={} failed={} dropped={} remaining={}",
        report.replayed, report.failed, report.dropped, report.remaining
    );

    Ok(i32::from(!report.is_clean()))
}

#[tokio::main]
async fn main() {
    cutover_core::logging::init_structured_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!(error = %err, "Replay pass aborted");
            eprintln!("error: {err}");
            process::exit(2);
        }
    }
}
