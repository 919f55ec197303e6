//! # Retrieval Rollback Tool
//!
//! One-command rollback of the retrieval migration. Flips the dual-write and
//! shadow-read flags off in the deployment flags file, points serving back at
//! the primary backend, and appends an audit record to an NDJSON journal so
//! the sequence of flips is reconstructible after the incident.
//!
//! Rollback is flag-level only. Outbox items already queued stay queued and
//! drain later through `outbox-replay` once the target is healthy again.

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "retrieval-rollback")]
#[command(about = "Disable retrieval dual-write and shadow reads, restore primary serving")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// KEY=VALUE flags file read by the serving deployment
    #[arg(long, default_value = "cutover.flags")]
    flags: PathBuf,

    /// NDJSON journal receiving one audit record per applied rollback
    #[arg(long, default_value = "rollback.journal.ndjson")]
    journal: PathBuf,

    /// Primary backend to restore as the serving backend
    #[arg(long, default_value = "faiss")]
    primary: String,

    /// Operator identity recorded in the journal
    #[arg(long)]
    operator: String,

    /// Why the rollback is happening; lands verbatim in the journal
    #[arg(long)]
    reason: String,

    /// Show the resulting flags without writing anything
    #[arg(long, conflicts_with = "apply")]
    dry_run: bool,

    /// Write the flags file and append the journal record
    #[arg(long, conflicts_with = "dry_run")]
    apply: bool,
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    operator: &'a str,
    timestamp: String,
    before: BTreeMap<String, String>,
    after: BTreeMap<String, String>,
    reason: &'a str,
}

fn load_flags(path: &PathBuf) -> anyhow::Result<BTreeMap<String, String>> {
    let mut flags = BTreeMap::new();
    if !path.exists() {
        return Ok(flags);
    }
    for line in std::fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            flags.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(flags)
}

fn write_flags(path: &PathBuf, flags: &BTreeMap<String, String>) -> anyhow::Result<()> {
    let mut out = String::new();
    for (key, value) in flags {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn rolled_back(before: &BTreeMap<String, String>, primary: &str) -> BTreeMap<String, String> {
    let mut after = before.clone();
    after.insert("CUTOVER_DUAL_WRITE".to_string(), "false".to_string());
    after.insert("CUTOVER_SHADOW_READ".to_string(), "false".to_string());
    after.insert("CUTOVER_SERVING_BACKEND".to_string(), primary.to_string());
    after
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let before = load_flags(&cli.flags)?;
    let after = rolled_back(&before, &cli.primary);

    if before == after {
        println!("flags already rolled back, nothing to do");
        return Ok(0);
    }

    if cli.dry_run || !cli.apply {
        println!("would write {}:", cli.flags.display());
        for (key, value) in &after {
            let marker = if before.get(key) == Some(value) { " " } else { "*" };
            println!("{marker} {key}={value}");
        }
        return Ok(0);
    }

    write_flags(&cli.flags, &after)?;

    let record = JournalRecord {
        operator: &cli.operator,
        timestamp: Utc::now().to_rfc3339(),
        before,
        after,
        reason: &cli.reason,
    };
    let mut journal = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.journal)?;
    writeln!(journal, "{}", serde_json::to_string(&record)?)?;

    info!(
        operator = %cli.operator,
        flags = %cli.flags.display(),
        primary = %cli.primary,
        "Retrieval migration rolled back"
    );
    println!(
        "rolled back: dual_write=off shadow_read=off serving={}",
        cli.primary
    );
    Ok(0)
}

fn main() {
    cutover_core::logging::init_structured_logging();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!(error = %err, "Rollback aborted, flags untouched");
            eprintln!("error: {err}");
            process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_back_flags_force_migration_off() {
        let mut before = BTreeMap::new();
        before.insert("CUTOVER_DUAL_WRITE".to_string(), "true".to_string());
        before.insert("CUTOVER_SHADOW_READ".to_string(), "true".to_string());
        before.insert("CUTOVER_SERVING_BACKEND".to_string(), "weaviate".to_string());
        before.insert("UNRELATED".to_string(), "kept".to_string());

        let after = rolled_back(&before, "faiss");
        assert_eq!(after["CUTOVER_DUAL_WRITE"], "false");
        assert_eq!(after["CUTOVER_SHADOW_READ"], "false");
        assert_eq!(after["CUTOVER_SERVING_BACKEND"], "faiss");
        assert_eq!(after["UNRELATED"], "kept");
    }

    #[test]
    fn flags_file_round_trips_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.flags");
        std::fs::write(
            &path,
            "# managed by deploy\nCUTOVER_DUAL_WRITE=true\n\nCUTOVER_SHADOW_READ = true\n",
        )
        .unwrap();

        let flags = load_flags(&path).unwrap();
        assert_eq!(flags["CUTOVER_DUAL_WRITE"], "true");
        assert_eq!(flags["CUTOVER_SHADOW_READ"], "true");

        let after = rolled_back(&flags, "faiss");
        write_flags(&path, &after).unwrap();
        let reloaded = load_flags(&path).unwrap();
        assert_eq!(reloaded, after);
    }

    #[test]
    fn missing_flags_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let flags = load_flags(&dir.path().join("absent.flags")).unwrap();
        assert!(flags.is_empty());
    }

    #[test]
    fn journal_record_serializes_expected_shape() {
        let record = JournalRecord {
            operator: "alice",
            timestamp: "2026-08-23T00:00:00+00:00".to_string(),
            before: BTreeMap::new(),
            after: rolled_back(&BTreeMap::new(), "faiss"),
            reason: "target p99 regression",
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operator"], "alice");
        assert_eq!(json["reason"], "target p99 regression");
        assert_eq!(json["after"]["CUTOVER_DUAL_WRITE"], "false");
    }
}
