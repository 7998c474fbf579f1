//! Boot command - bring up the storage layer and report

use crate::boot::{FileSystem, FileSystemInfo};
use crate::cli::args::{BootArgs, OutputFormat};
use crate::config::Options;
use crate::error::{BootStatus, StrataResult};
use console::style;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Execute the boot command; the boot status becomes the exit code
pub async fn execute(args: BootArgs, options: Options) -> StrataResult<BootStatus> {
    let mut info = FileSystemInfo::new(&args.name, args.kind.into(), Arc::new(options));
    info.wait_workspace = args.wait;
    info.reserved_inode_floor = args.inode_floor;

    let fs = FileSystem::create(info).await;
    let report = BootReport::from(&fs);
    match args.format {
        OutputFormat::Text => print_text(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(fs.boot_status())
}

#[derive(Debug, Serialize)]
struct BootReport {
    name: String,
    kind: String,
    status: String,
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<String>,
    previous_crash: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    counters: BTreeMap<String, i64>,
}

impl From<&FileSystem> for BootReport {
    fn from(fs: &FileSystem) -> Self {
        let status = fs.boot_status();
        Self {
            name: fs.name().to_string(),
            kind: fs.context().kind.to_string(),
            status: status.to_string(),
            code: status.code(),
            error: (!fs.is_ok()).then(|| fs.boot_error().to_string()),
            workspace: fs.workspace().map(|ws| ws.path().display().to_string()),
            cache: fs.root().map(|root| root.describe()),
            previous_crash: fs.found_previous_crash(),
            instance_id: fs.identity().map(|id| id.id.to_string()),
            counters: fs
                .statistics()
                .snapshot()
                .into_iter()
                .map(|(name, value, _)| (name, value))
                .collect(),
        }
    }
}

fn print_text(report: &BootReport) {
    if let Some(error) = &report.error {
        eprintln!(
            "{} {} ({}): {}",
            style("Boot failed:").red().bold(),
            report.name,
            report.status,
            error
        );
        return;
    }

    println!("{} {} ({})", style("Booted").green().bold(), report.name, report.kind);
    if let Some(workspace) = &report.workspace {
        println!("  {:<12} {}", style("workspace").dim(), workspace);
    }
    if let Some(cache) = &report.cache {
        println!("  {:<12} {}", style("cache").dim(), cache);
    }
    if let Some(id) = &report.instance_id {
        println!("  {:<12} {}", style("instance").dim(), id);
    }
    if report.previous_crash {
        println!(
            "  {}",
            style("previous instance did not shut down cleanly").yellow()
        );
    }
}
