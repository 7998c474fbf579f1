//! Plan command - validate cache configuration without side effects

use crate::cache::memory::physical_memory;
use crate::cli::args::PlanArgs;
use crate::config::Options;
use crate::context::MountContext;
use crate::error::StrataResult;
use crate::quota::format_bytes;
use crate::resolve::{primary_instance, BackendSpec, Planner};
use console::style;

/// Execute the plan command
pub async fn execute(args: PlanArgs, options: &Options) -> StrataResult<()> {
    let ctx = MountContext::from_options(&args.name, args.kind.into(), options);
    let instance = args
        .instance
        .unwrap_or_else(|| primary_instance(options));

    let spec = Planner::new(options, &ctx, physical_memory()).plan(&instance)?;
    let mut lines = Vec::new();
    render(&spec, 0, &mut lines);
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn render(spec: &BackendSpec, depth: usize, out: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    let head = format!("{}{} {}", indent, style(spec.kind()).cyan(), spec.instance());
    match spec {
        BackendSpec::Disk { settings, .. } => {
            let quota = if settings.is_managed() {
                format_bytes(settings.quota_limit)
            } else {
                "unmanaged".to_string()
            };
            let mut flags = Vec::new();
            if settings.shared {
                flags.push("shared");
            }
            if settings.alien {
                flags.push("alien");
            }
            if settings.avoid_rename {
                flags.push("server-mode");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(","))
            };
            out.push(format!("{} {} quota={}{}", head, settings.path.display(), quota, flags));
        }
        BackendSpec::Memory { settings, .. } => {
            out.push(format!(
                "{} size={} nfiles={} malloc={}",
                head,
                format_bytes(settings.budget),
                settings.nfiles,
                settings.strategy
            ));
        }
        BackendSpec::External { settings, .. } => {
            out.push(format!("{} {} nfiles={}", head, settings.locator, settings.nfiles));
        }
        BackendSpec::Tiered { upper, lower, .. } => {
            out.push(head);
            render(upper, depth + 1, out);
            render(lower, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FsKind;

    #[test]
    fn renders_tiered_tree() {
        console::set_colors_enabled(false);
        let options = Options::new()
            .with("cache_instance.t.type", "tiered")
            .with("cache_instance.t.upper", "mem")
            .with("cache_instance.t.lower", "default")
            .with("cache_instance.mem.type", "ram")
            .with("cache_instance.mem.size", "256")
            .with("cache.dir", "/srv/cache");
        let ctx = MountContext::new("repo", FsKind::Library);
        let spec = Planner::new(&options, &ctx, 8 << 30).plan("t").unwrap();

        let mut lines = Vec::new();
        render(&spec, 0, &mut lines);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "tiered t");
        assert!(lines[1].starts_with("  ram mem size=256"));
        assert_eq!(lines[2], "  disk default /srv/cache quota=unmanaged");
    }
}
