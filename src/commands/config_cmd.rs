//! Config command handlers - managing configuration.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;

/// Handle `confidant config generate`.
pub fn handle_config_generate(path: Option<PathBuf>, overwrite: bool) -> Result<()> {
    let config_path = Config::generate_config_file(path, overwrite)?;
    println!("Config file generated at: {}", config_path.display());
    Ok(())
}

/// Handle `confidant config` / `confidant config show`.
pub fn handle_config_show(config: &Config, explicit: Option<&Path>) -> Result<()> {
    let source = explicit
        .map(Path::to_path_buf)
        .or_else(Config::find_existing_config);
    match source {
        Some(path) => println!("// loaded from {}", path.display()),
        None => println!("// no config file found, showing defaults"),
    }
    print!("{}", config.to_kdl());
    Ok(())
}

/// Handle `confidant config get <key>`.
pub fn handle_config_get(config: &Config, key: &str) -> Result<()> {
    println!("{}", config.get(key)?);
    Ok(())
}
