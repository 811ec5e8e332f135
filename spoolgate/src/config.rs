use std::path::{Path, PathBuf};

use crate::controller::Spoolgate;

pub const CONFIG_ENV: &str = "SPOOLGATE_CONFIG";

fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from("./spoolgate.config.ron"),
        PathBuf::from("/etc/spoolgate/spoolgate.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. an explicit path, e.g. from the command line
/// 2. `SPOOLGATE_CONFIG` environment variable
/// 3. ./spoolgate.config.ron (current working directory)
/// 4. /etc/spoolgate/spoolgate.config.ron (system-wide config)
///
/// # Errors
/// Fails when an explicitly named file does not exist, or when none of the
/// default locations hold a file.
pub fn find_config_file(
    explicit: Option<&Path>,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = default_paths();
    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and deserialize a config file.
///
/// # Errors
/// Fails if the file cannot be read or is not a valid `Spoolgate` document.
pub fn load(path: &Path) -> anyhow::Result<Spoolgate> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
    })?;

    ron::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
}
