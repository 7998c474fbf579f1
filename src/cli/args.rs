//! CLI argument definitions using clap derive

use crate::context::FsKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// strata - cache and workspace bootstrap for content-addressed filesystems
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Options file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot a filesystem's storage layer and report the outcome
    Boot(BootArgs),

    /// Validate and print the cache backend tree without touching disk
    Plan(PlanArgs),

    /// Show the effective options
    Config(ConfigArgs),
}

/// How the filesystem is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Kernel mount; the workspace becomes the working directory
    Mount,
    /// Embedded in another process
    Library,
}

impl From<KindArg> for FsKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mount => FsKind::Mount,
            KindArg::Library => FsKind::Library,
        }
    }
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Arguments for the boot command
#[derive(Parser, Debug)]
pub struct BootArgs {
    /// Filesystem name
    pub name: String,

    /// Consumer kind
    #[arg(short, long, default_value = "library")]
    pub kind: KindArg,

    /// Wait for the workspace lock instead of failing
    #[arg(short, long)]
    pub wait: bool,

    /// Stable identifiers below this number are reserved
    #[arg(long, default_value = "0")]
    pub inode_floor: u64,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Filesystem name
    pub name: String,

    /// Cache instance to plan (defaults to cache.primary)
    #[arg(short, long)]
    pub instance: Option<String>,

    /// Consumer kind
    #[arg(short, long, default_value = "library")]
    pub kind: KindArg,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show options as flat key=value pairs
    Show,

    /// Show options file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_boot() {
        let cli = Cli::parse_from(["strata", "boot", "repo", "--kind", "mount", "--wait"]);
        match cli.command {
            Commands::Boot(args) => {
                assert_eq!(args.name, "repo");
                assert_eq!(FsKind::from(args.kind), FsKind::Mount);
                assert!(args.wait);
                assert_eq!(args.inode_floor, 0);
                assert_eq!(args.format, OutputFormat::Text);
            }
            _ => panic!("expected Boot command"),
        }
    }

    #[test]
    fn cli_parses_plan_defaults() {
        let cli = Cli::parse_from(["strata", "plan", "repo"]);
        match cli.command {
            Commands::Plan(args) => {
                assert!(args.instance.is_none());
                assert_eq!(args.kind, KindArg::Library);
            }
            _ => panic!("expected Plan command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["strata", "-vv", "--config", "/etc/strata.toml", "config"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/strata.toml")));
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { action: None })));
    }

    #[test]
    fn cli_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["strata", "boot", "repo", "--kind", "fuse3"]).is_err());
    }
}
