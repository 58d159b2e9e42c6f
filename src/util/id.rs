//! Naming for per-identity clones: synthetic client names and bundle identifiers.

use crate::hasher::{fnv1a64, format_fingerprint};

/// Stable synthetic client name for `username`'s copy of `client`:
/// `<client>-<16 hex FNV-1a of the username>`.
pub fn synthetic_client_name(client: &str, username: &str) -> String {
    format!("{}-{}", client, format_fingerprint(fnv1a64(username.as_bytes())))
}

/// Reduce `s` to characters valid in a reverse-DNS bundle identifier
/// component (`A-Z a-z 0-9 -`); anything else becomes `-`.
pub fn sanitize_identifier_component(s: &str) -> String {
    let out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "user".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

/// Bundle identifier for one identity: `<base id>.<sanitized username>`.
pub fn identity_bundle_id(base_id: &str, username: &str) -> String {
    format!("{}.{}", base_id, sanitize_identifier_component(username))
}

/// Usernames become directory names; reject anything that could escape the data root.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty()
        || username == "."
        || username == ".."
        || username.contains('/')
        || username.contains('\\')
        || username.contains('\0')
    {
        return Err(format!("invalid username '{username}'"));
    }
    Ok(())
}
