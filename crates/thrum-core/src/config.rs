//! Configuration resolution (SPEC_FULL.md §10.4).
//!
//! Precedence, highest first: CLI overrides > environment variables
//! (spec.md §6.7) > repo-local `.thrum.toml` > global
//! `~/.config/thrum/config.toml` > built-in defaults. Each layer only
//! supplies the fields it knows about; unset fields fall through to the
//! next layer rather than requiring every layer to be complete.

use crate::error::{Result, ThrumError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_sync_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrumConfig {
    pub name: Option<String>,
    pub role: Option<String>,
    pub module: Option<String>,
    pub ws_port: Option<u16>,
    pub local_only: Option<bool>,
    pub sync_interval_secs: Option<u64>,
}

impl ThrumConfig {
    /// Returns the effective sync interval, falling back to the spec's
    /// default of 60s if no layer set one.
    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_interval_secs.unwrap_or_else(default_sync_interval))
    }

    fn merge_lower_priority(mut self, lower: ThrumConfig) -> Self {
        self.name = self.name.or(lower.name);
        self.role = self.role.or(lower.role);
        self.module = self.module.or(lower.module);
        self.ws_port = self.ws_port.or(lower.ws_port);
        self.local_only = self.local_only.or(lower.local_only);
        self.sync_interval_secs = self.sync_interval_secs.or(lower.sync_interval_secs);
        self
    }
}

/// CLI-supplied overrides, the highest-priority layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub module: Option<String>,
    pub ws_port: Option<u16>,
    pub local_only: Option<bool>,
    pub sync_interval_secs: Option<u64>,
}

impl From<ConfigOverrides> for ThrumConfig {
    fn from(o: ConfigOverrides) -> Self {
        ThrumConfig {
            name: o.name,
            role: o.role,
            module: o.module,
            ws_port: o.ws_port,
            local_only: o.local_only,
            sync_interval_secs: o.sync_interval_secs,
        }
    }
}

fn env_layer() -> ThrumConfig {
    ThrumConfig {
        name: std::env::var("THRUM_NAME").ok().filter(|s| !s.is_empty()),
        role: std::env::var("THRUM_ROLE").ok().filter(|s| !s.is_empty()),
        module: std::env::var("THRUM_MODULE").ok().filter(|s| !s.is_empty()),
        ws_port: std::env::var("THRUM_WS_PORT").ok().and_then(|s| s.parse().ok()),
        local_only: std::env::var("THRUM_LOCAL").ok().map(|s| {
            let s = s.trim().to_lowercase();
            s == "1" || s == "true" || s == "yes"
        }),
        sync_interval_secs: std::env::var("THRUM_SYNC_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok()),
    }
}

fn read_toml_layer(path: &Path) -> Result<ThrumConfig> {
    if !path.is_file() {
        return Ok(ThrumConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| ThrumError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| {
        ThrumError::InvalidParams(format!("invalid config file {}: {e}", path.display()))
    })
}

/// Resolves the effective configuration for a daemon run rooted at
/// `repo_dir`, with `home_dir` as the user's home directory.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    repo_dir: &Path,
    home_dir: &Path,
) -> Result<ThrumConfig> {
    let cli: ThrumConfig = overrides.clone().into();
    let env = env_layer();

    let repo_local_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| repo_dir.join(".thrum.toml"));
    let repo_local = read_toml_layer(&repo_local_path)?;

    let global_path = home_dir.join(".config/thrum/config.toml");
    let global = read_toml_layer(&global_path)?;

    Ok(cli
        .merge_lower_priority(env)
        .merge_lower_priority(repo_local)
        .merge_lower_priority(global))
}
