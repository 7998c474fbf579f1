//! strata - cache backend composition and workspace coordination
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{Cli, Commands};
use strata::config::{keys, ConfigManager, ConfigSource};
use strata::error::{BootStatus, StrataResult};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.boot_status().code())
        }
    }
}

async fn run() -> StrataResult<BootStatus> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut options = manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; an explicit log.level wins
    if !options.is_defined(keys::LOG_LEVEL) {
        let level = match cli.verbose {
            0 => "strata=warn",
            1 => "strata=info",
            _ => "strata=debug",
        };
        options.set(keys::LOG_LEVEL, level);
    }

    match cli.command {
        Commands::Boot(args) => strata::cli::commands::boot(args, options).await,
        Commands::Plan(args) => {
            strata::cli::commands::plan(args, &options).await?;
            Ok(BootStatus::Ok)
        }
        Commands::Config(args) => {
            strata::cli::commands::config(args, &manager, &options).await?;
            Ok(BootStatus::Ok)
        }
    }
}
