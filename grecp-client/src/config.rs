use anyhow::{Context, Result};
use directories::ProjectDirs;
use grecp_core::config::ClientConfig;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "grecp-client.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("org", "grecp", "grecp-client")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display())),
        _ => Ok(()),
    }
}

/// Load and validate the config; a missing file yields the defaults
pub fn load(path: &Path) -> Result<ClientConfig> {
    let cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse TOML: {}", path.display()))?
    } else {
        ClientConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

/// Write `cfg` as TOML, refusing to replace an existing file unless `overwrite`
pub fn save(path: &Path, cfg: &ClientConfig, overwrite: bool) -> Result<()> {
    if !overwrite && path.exists() {
        anyhow::bail!(
            "{} already exists (pass --force to replace it)",
            path.display()
        );
    }
    cfg.validate().context("refusing to write an invalid config")?;

    let raw = toml::to_string_pretty(cfg).context("failed to encode config as TOML")?;
    ensure_parent_dir(path)?;
    fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
}
