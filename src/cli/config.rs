//! `chatgate config` - show the effective configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};

use chatgate::config::Config;

pub(crate) fn cmd_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    let rendered = serde_json::to_string_pretty(&config.redacted())?;
    println!("{rendered}");
    Ok(())
}
