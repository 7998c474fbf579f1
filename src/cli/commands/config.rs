//! Config command - show the effective options

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{ConfigManager, Options};
use crate::error::StrataResult;

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, options: &Options) -> StrataResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => {
            if !options.is_empty() {
                println!("{}", options.dump());
            }
        }
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
    }
    Ok(())
}
