//! Identity file (spec.md §6.3/§9): a per-worktree descriptor written to
//! `<identities-dir>/<agent-name>.json`.
//!
//! Readers accept v1, v2, and v3 on disk (missing fields default to empty);
//! writers always emit v3. Migration happens lazily, the first time a v1/v2
//! file is re-saved — never as an up-front startup pass.

use crate::error::{Result, ThrumError};
use crate::model::agent::AgentKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CURRENT_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAgent {
    pub kind: AgentKind,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityFile {
    pub version: u32,
    #[serde(default)]
    pub repo_id: String,
    pub agent: IdentityAgent,
    #[serde(default)]
    pub worktree: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub session_id: String,
    pub updated_at: String,
}

impl IdentityFile {
    pub fn new(agent: IdentityAgent, repo_id: String, worktree: String) -> Self {
        IdentityFile {
            version: CURRENT_VERSION,
            repo_id,
            agent,
            worktree,
            branch: String::new(),
            intent: String::new(),
            session_id: String::new(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Loads an identity file, accepting any of versions 1-3. Fields absent
    /// from older versions default via serde's `#[serde(default)]`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let parsed: IdentityFile = serde_json::from_str(&content)?;
        if parsed.version == 0 || parsed.version > CURRENT_VERSION {
            return Err(ThrumError::InvalidParams(format!(
                "unsupported identity file version {} in {}",
                parsed.version,
                path.display()
            )));
        }
        Ok(parsed)
    }

    /// Writes this identity out, always at [`CURRENT_VERSION`] regardless of
    /// what version it was loaded as (first-touch migration, spec.md §9).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut migrated = self.clone();
        migrated.version = CURRENT_VERSION;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&migrated)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn v1_file_loads_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("impl.json");
        std::fs::write(
            &path,
            r#"{"version":1,"agent":{"kind":"agent","name":"impl"},"updated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let identity = IdentityFile::load(&path).unwrap();
        assert_eq!(identity.version, 1);
        assert_eq!(identity.agent.name, "impl");
        assert_eq!(identity.agent.role, "");
        assert_eq!(identity.session_id, "");
    }

    #[test]
    fn save_always_writes_current_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("impl.json");
        std::fs::write(
            &path,
            r#"{"version":2,"agent":{"kind":"agent","name":"impl"},"updated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let mut identity = IdentityFile::load(&path).unwrap();
        identity.intent = "fixing bug".into();
        identity.save(&path).unwrap();

        let reloaded = IdentityFile::load(&path).unwrap();
        assert_eq!(reloaded.version, CURRENT_VERSION);
        assert_eq!(reloaded.intent, "fixing bug");
    }

    #[test]
    fn rejects_unknown_future_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("impl.json");
        std::fs::write(
            &path,
            r#"{"version":99,"agent":{"kind":"agent","name":"impl"},"updated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(IdentityFile::load(&path).is_err());
    }
}
