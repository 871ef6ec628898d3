use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use crate::config::{self, AppConfig};
use crate::sync::cache::AttachmentCache;
use crate::sync::log::{ActivityLog, SyncEvent};
use crate::sync::orchestrator::{Orchestrator, PairSummary, RunConfig, RunSummary};
use crate::tracker::{self, Tracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Sync(SyncArgs),
    /// Print recent activity-log events, optionally for one source issue.
    History { source_key: Option<String>, limit: usize },
}

const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Command-line overrides for one pass. Unset values fall back to the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncArgs {
    pub config_path: Option<PathBuf>,
    pub dry_run: bool,
    pub only_issue_key: Option<String>,
    pub source_issue_types: Vec<String>,
    pub create_issue_type: Option<String>,
    pub updated_within: Option<String>,
    pub concurrency: Option<usize>,
}

impl SyncArgs {
    pub fn run_config(&self, config: &AppConfig) -> RunConfig {
        let source_issue_types = if self.source_issue_types.is_empty() {
            config.sync_issue_types.clone()
        } else {
            self.source_issue_types.clone()
        };
        RunConfig {
            dry_run: self.dry_run,
            only_issue_key: self.only_issue_key.clone(),
            source_issue_types,
            create_issue_type: self.create_issue_type.clone(),
            updated_within: self.updated_within.clone(),
            concurrency: self.concurrency.unwrap_or(config.run.concurrency),
        }
    }
}

/// Parse arguments (without the program name).
///
/// Supported forms:
///   jira-sync
///   jira-sync --dry-run --only SRC-12
///   jira-sync --config ./sync.toml --source-type Bug --source-type Task
///   jira-sync --history --only SRC-12 --limit 20
pub fn parse_args(args: &[String]) -> Result<Command> {
    let mut parsed = SyncArgs::default();
    let mut history = false;
    let mut limit = None;
    let mut i = 0;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => return Ok(Command::Help),
            "-n" | "--dry-run" => parsed.dry_run = true,
            "-c" | "--config" => parsed.config_path = Some(PathBuf::from(value_for(args, &mut i, flag)?)),
            "--history" => history = true,
            "--limit" => {
                let raw = value_for(args, &mut i, flag)?;
                let n: usize = raw
                    .parse()
                    .with_context(|| format!("--limit expects a number, got `{raw}`"))?;
                limit = Some(n);
            }
            "--only" => parsed.only_issue_key = Some(value_for(args, &mut i, flag)?),
            "--source-type" => parsed.source_issue_types.push(value_for(args, &mut i, flag)?),
            "--create-type" => parsed.create_issue_type = Some(value_for(args, &mut i, flag)?),
            "--updated-within" => parsed.updated_within = Some(value_for(args, &mut i, flag)?),
            "--concurrency" => {
                let raw = value_for(args, &mut i, flag)?;
                let n: usize = raw
                    .parse()
                    .with_context(|| format!("--concurrency expects a number, got `{raw}`"))?;
                if n == 0 {
                    bail!("--concurrency must be at least 1");
                }
                parsed.concurrency = Some(n);
            }
            other => bail!("Unknown argument `{other}`. Run `jira-sync --help` for usage."),
        }
        i += 1;
    }

    if history {
        return Ok(Command::History {
            source_key: parsed.only_issue_key,
            limit: limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        });
    }
    if limit.is_some() {
        bail!("--limit only applies to --history");
    }
    Ok(Command::Sync(parsed))
}

fn value_for(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    match args.get(*i) {
        Some(value) if !value.starts_with("--") => Ok(value.clone()),
        _ => bail!("Missing value for {flag}"),
    }
}

/// Load everything, run one pass and print the per-pair summary.
pub async fn handle_sync(args: SyncArgs) -> Result<RunSummary> {
    let config_path = args.config_path.clone().unwrap_or_else(config::default_config_path);
    let config = config::load_config(&config_path)?;
    let rules = config::load_mapping_rules(&config.mapping_path(&config_path))?;
    let run = args.run_config(&config);

    let (source, target) = tracker::create_trackers(&config)?;
    for client in [&source, &target] {
        let user = client
            .check_connection()
            .await
            .with_context(|| format!("Cannot connect to {}", client.name()))?;
        tracing::info!(tracker = client.name(), %user, "connected");
    }

    let mut orchestrator = Orchestrator::new(&source, &target, &rules, run).with_activity_log(ActivityLog::new());
    if let Some(dir) = &config.run.attachment_cache_dir {
        orchestrator = orchestrator.with_cache(AttachmentCache::new(dir.clone()));
    }
    let summary = orchestrator.run().await.context("Sync aborted")?;
    print_summary(&summary);
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("Dry run: nothing was written.\n");
    }
    for pair in &summary.pairs {
        println!("{}", pair_line(pair));
        for (field, err) in &pair.fields_failed {
            println!("  field {field} failed: {err}");
        }
        for (name, err) in &pair.attachments_failed {
            println!("  attachment {name} failed: {err}");
        }
    }
    println!(
        "\n{} pairs, {} created, {} fields written{}",
        summary.pairs.len(),
        summary.created(),
        summary.fields_updated(),
        if summary.has_failures() { ", with failures" } else { "" }
    );
}

fn pair_line(pair: &PairSummary) -> String {
    let target = pair.target_key.as_deref().unwrap_or("(new)");
    if let Some(err) = &pair.error {
        return format!("{} -> {target}: skipped ({err})", pair.source_key);
    }
    format!(
        "{} -> {target}{}: {} updated, {} unchanged, {} failed; attachments {} transferred, {} failed{}",
        pair.source_key,
        if pair.created { " (created)" } else { "" },
        pair.fields_updated.len(),
        pair.fields_unchanged.len(),
        pair.fields_failed.len(),
        pair.attachments_transferred.len(),
        pair.attachments_failed.len(),
        if pair.prefix_fallbacks > 0 {
            format!("; {} prefix fallbacks", pair.prefix_fallbacks)
        } else {
            String::new()
        }
    )
}

/// Print the newest `limit` activity events, oldest first.
pub fn handle_history(log: &ActivityLog, source_key: Option<&str>, limit: usize) {
    let events = log.read(source_key, Some(limit));
    if events.is_empty() {
        println!("No sync activity recorded.");
        return;
    }
    for event in &events {
        println!("{}", event_line(event));
    }
}

fn event_line(event: &SyncEvent) -> String {
    let mut line = format!("{} {:<18} {}", event.timestamp, event.event, event.source_key);
    if let Some(target) = &event.target_key {
        line.push_str(&format!(" -> {target}"));
    }
    if let Some(field) = &event.field {
        line.push_str(&format!(" [{field}]"));
    }
    if let Some(message) = &event.message {
        line.push_str(&format!(": {message}"));
    }
    line
}

pub fn print_help() {
    println!("jira-sync: reconcile issues between two Jira projects\n");
    println!("USAGE:");
    println!("  jira-sync [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <path>        Config file (default ~/.jira-sync/config.toml)");
    println!("  -n, --dry-run              Plan and report without writing anything");
    println!("      --only <KEY>           Sync a single source issue");
    println!("      --source-type <TYPE>   Source issue type to include (repeatable)");
    println!("      --create-type <TYPE>   Issue type for newly created target issues");
    println!("      --updated-within <X>   Only source issues updated within X, e.g. 1d or 4h");
    println!("      --concurrency <N>      Issue pairs processed at once");
    println!("      --history              Show the sync activity log instead of syncing");
    println!("      --limit <N>            Events shown by --history (default 200)");
    println!("  -h, --help                 Show this help");
    println!();
    println!("Set RUST_LOG=debug for request-level logging.");
}
