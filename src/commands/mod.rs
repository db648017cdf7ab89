pub mod check;
pub mod plan;
pub mod run;
pub mod serve;

use anyhow::Result;
use std::path::Path;

use postrelay::config::Config;

// Re-export command functions for convenience
pub use check::check_config;
pub use plan::plan;
pub use run::run;

/// Config from `path` when given, otherwise from the environment
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}
