//! Canonical directory resolution for thrum.
//!
//! Two distinct notions of "home" are resolved here:
//!
//! - The **user home directory**, used to locate the global config file
//!   (`~/.config/thrum/config.toml`, see [`crate::config`]).
//! - The **thrum directory** (`<thrum-dir>`), the root of the per-repository
//!   on-disk layout from spec.md §3.4. It lives inside the repository's Git
//!   common directory, on the sync worktree; feature worktrees only contain
//!   a `redirect` file pointing at it (spec.md §6.4).
//!
//! # Precedence (user home)
//!
//! 1. `THRUM_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default

use crate::error::{Result, ThrumError};
use std::path::{Path, PathBuf};

/// Returns the user home directory for thrum operations.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("THRUM_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().ok_or_else(|| ThrumError::Io("could not determine home directory".into()))
}

/// Name of the directory holding the sync worktree and runtime files,
/// relative to the Git common directory.
const THRUM_DIR_NAME: &str = "thrum";

const REDIRECT_FILE: &str = "redirect";

/// Locates `<thrum-dir>` for the repository containing `start`, following a
/// single redirect hop if `start`'s own thrum directory only contains a
/// `redirect` file (spec.md §6.4: "read and follow once; redirect chains are
/// rejected").
pub fn resolve_thrum_dir(git_common_dir: &Path) -> Result<PathBuf> {
    let candidate = git_common_dir.join(THRUM_DIR_NAME);
    let redirect_path = candidate.join(REDIRECT_FILE);

    if !redirect_path.is_file() {
        return Ok(candidate);
    }

    let target = std::fs::read_to_string(&redirect_path)
        .map_err(|e| ThrumError::Io(format!("reading redirect file: {e}")))?;
    let target = PathBuf::from(target.trim());

    if target.join(REDIRECT_FILE).is_file() {
        return Err(ThrumError::Io(format!(
            "redirect chains are not allowed: {} itself redirects",
            target.display()
        )));
    }

    Ok(target)
}

/// Writes (or overwrites) a redirect file at `from` pointing to `to`.
///
/// Used by feature-worktree bootstrap: a worktree other than the one
/// holding the sync checkout gets a one-line pointer instead of its own
/// copy of the on-disk layout.
pub fn write_redirect(from_thrum_dir: &Path, to_thrum_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(from_thrum_dir)?;
    let abs = to_thrum_dir
        .canonicalize()
        .unwrap_or_else(|_| to_thrum_dir.to_path_buf());
    std::fs::write(from_thrum_dir.join(REDIRECT_FILE), abs.to_string_lossy().as_bytes())?;
    Ok(())
}
