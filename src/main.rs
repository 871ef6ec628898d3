mod cli;
mod config;
mod error;
mod logging;
mod model;
mod sync;
mod tracker;
mod util;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = logging::init() {
        eprintln!("warning: logging disabled: {err}");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match cli::parse_args(&args)? {
        cli::Command::Help => cli::print_help(),
        cli::Command::History { source_key, limit } => {
            cli::handle_history(&sync::log::ActivityLog::new(), source_key.as_deref(), limit)
        }
        cli::Command::Sync(sync_args) => {
            let summary = cli::handle_sync(sync_args).await?;
            if summary.has_failures() {
                tracing::warn!("some fields or attachments were not synced, see the summary above");
            }
        }
    }

    Ok(())
}
