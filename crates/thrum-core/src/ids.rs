//! ULID-based identifiers (spec.md §3.1/§3.2) and the derived, stable
//! `repo_id`.

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Generates a new prefixed id, e.g. `evt_01HZY...`.
fn new_prefixed(prefix: &str) -> String {
    format!("{prefix}{}", Ulid::new())
}

pub fn new_event_id() -> String {
    new_prefixed("evt_")
}

pub fn new_message_id() -> String {
    new_prefixed("msg_")
}

pub fn new_session_id() -> String {
    new_prefixed("ses_")
}

pub fn new_subscription_id() -> String {
    new_prefixed("sub_")
}

/// Derives the stable `repo_id` from a Git origin URL: `"r_" +
/// base32(sha256(normalized_origin_url))[:12]` (spec.md §3.1).
///
/// `normalized` must already have been passed through
/// [`crate::repo::normalize_origin_url`]; this function does not normalize.
pub fn derive_repo_id(normalized_origin_url: &str) -> String {
    let digest = Sha256::digest(normalized_origin_url.as_bytes());
    let encoded = BASE32_NOPAD.encode(&digest).to_lowercase();
    format!("r_{}", &encoded[..12])
}
