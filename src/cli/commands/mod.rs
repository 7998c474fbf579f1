//! CLI command implementations

pub mod boot;
pub mod config;
pub mod plan;

pub use boot::execute as boot;
pub use config::execute as config;
pub use plan::execute as plan;
