// TOML config files. Keys are the long option names:
//
//     model = "models/airliner.json"
//     window-size = [150]
//     confidence = 90
//     bbox = [-84.44, 33.62, -84.42, 33.64]

use crate::args::RunArgs;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn load_config_file(path: &Path) -> Result<RunArgs> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Loads `paths` in order; values from later files replace earlier ones.
pub fn load_config_files(paths: &[PathBuf]) -> Result<RunArgs> {
    paths.iter().try_fold(RunArgs::default(), |merged, path| {
        Ok::<_, anyhow::Error>(load_config_file(path)?.merge(merged))
    })
}

/// Command line and environment values win over every config file.
pub fn resolve(cli: RunArgs) -> Result<RunArgs> {
    let files = load_config_files(&cli.config)?;
    Ok(cli.merge(files))
}
