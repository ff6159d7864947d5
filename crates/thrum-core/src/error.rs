//! The error taxonomy shared by every component (spec.md §7).
//!
//! Every fallible call into the engine returns a [`ThrumError`]. Each variant
//! maps to one `kind` string surfaced to RPC clients in `error.data.kind`,
//! plus a `Display` impl that names the affected identifier and gives an
//! actionable hint, per spec.md's "user-visible behavior" rule.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ThrumError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("not initialized: no thrum directory found (run setup in this repository first)")]
    NotInitialized,

    #[error("daemon already running for this repository (pid file: {0})")]
    AlreadyRunning(PathBuf),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("unknown recipient(s): {0:?}")]
    UnknownRecipient(Vec<String>),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("sync conflict: {0}")]
    SyncConflict(String),

    #[error("remote operation requested while in local-only mode")]
    LocalOnly,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ThrumError {
    /// The snake_case `kind` string sent over the wire in `error.data.kind`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ThrumError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ThrumError::InvalidParams(_) => ErrorKind::InvalidParams,
            ThrumError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            ThrumError::NotInitialized => ErrorKind::NotInitialized,
            ThrumError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ThrumError::NotFound { .. } => ErrorKind::NotFound,
            ThrumError::UnknownRecipient(_) => ErrorKind::UnknownRecipient,
            ThrumError::NameConflict(_) => ErrorKind::NameConflict,
            ThrumError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ThrumError::Timeout(_) => ErrorKind::Timeout,
            ThrumError::Io(_) => ErrorKind::Io,
            ThrumError::Git(_) => ErrorKind::Git,
            ThrumError::Db(_) => ErrorKind::Db,
            ThrumError::SyncConflict(_) => ErrorKind::SyncConflict,
            ThrumError::LocalOnly => ErrorKind::LocalOnly,
            ThrumError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The JSON-RPC 2.0 numeric code for this error.
    ///
    /// Standard codes (`-32600`..`-32603`) are used where they apply;
    /// everything else is an application-defined code in `-32000..-32099`.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ThrumError::InvalidRequest(_) => -32600,
            ThrumError::MethodNotFound(_) => -32601,
            ThrumError::InvalidParams(_) => -32602,
            ThrumError::Internal(_) => -32603,
            _ => -32000,
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        ThrumError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// The authoritative set of error kinds from spec.md §7, as a wire-stable
/// enum. `Display` yields the exact snake_case string placed in
/// `error.data.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidParams,
    MethodNotFound,
    NotInitialized,
    AlreadyRunning,
    NotFound,
    UnknownRecipient,
    NameConflict,
    PermissionDenied,
    Timeout,
    Io,
    Git,
    Db,
    SyncConflict,
    LocalOnly,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "internal".to_string());
        f.write_str(&s)
    }
}

impl From<std::io::Error> for ThrumError {
    fn from(e: std::io::Error) -> Self {
        ThrumError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ThrumError {
    fn from(e: serde_json::Error) -> Self {
        ThrumError::InvalidParams(e.to_string())
    }
}

impl From<rusqlite::Error> for ThrumError {
    fn from(e: rusqlite::Error) -> Self {
        ThrumError::Db(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ThrumError>;
