//! Maps [`ThrumError`] onto the wire error shape (spec.md §6.5/§7):
//! `{code, message, data:{kind, detail?}}`.

use serde::Serialize;
use serde_json::{json, Value};
use thrum_core::error::ThrumError;

#[derive(Debug, Serialize)]
pub struct RpcErrorData {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    pub data: RpcErrorData,
}

pub fn to_rpc_error(err: &ThrumError) -> RpcErrorBody {
    let detail = match err {
        ThrumError::UnknownRecipient(names) => Some(json!(names)),
        ThrumError::NotFound { id, .. } => Some(json!(id)),
        ThrumError::AlreadyRunning(path) => Some(json!(path.display().to_string())),
        _ => None,
    };

    RpcErrorBody {
        code: err.rpc_code(),
        message: err.to_string(),
        data: RpcErrorData {
            kind: err.kind().to_string(),
            detail,
        },
    }
}

pub fn invalid_request(message: impl Into<String>) -> RpcErrorBody {
    to_rpc_error(&ThrumError::InvalidRequest(message.into()))
}

pub fn method_not_found(method: &str) -> RpcErrorBody {
    to_rpc_error(&ThrumError::MethodNotFound(method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_recipient_carries_names_as_detail() {
        let err = ThrumError::UnknownRecipient(vec!["ghost".into()]);
        let body = to_rpc_error(&err);
        assert_eq!(body.data.kind, "unknown_recipient");
        assert_eq!(body.data.detail, Some(json!(["ghost"])));
    }

    #[test]
    fn method_not_found_uses_standard_code() {
        let body = method_not_found("bogus.method");
        assert_eq!(body.code, -32601);
    }
}
