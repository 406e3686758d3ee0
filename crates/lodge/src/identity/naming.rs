//! Account name derivation.

use sha2::{Digest, Sha256};

use crate::accounts::MAX_ACCOUNT_NAME_LEN;

/// Hex characters of the identity hash appended to truncated names.
const HASH_LEN: usize = 6;

/// Derive the preferred account name for `external_id`.
///
/// The local part of an email-like identity is lowercased and reduced to
/// `[a-z0-9_]`, then prefixed. Names that would exceed the username limit are
/// truncated and tagged with a short hash of the full identity, so two
/// identities sharing a long common prefix still get different names.
pub fn derive_account_name(prefix: &str, external_id: &str) -> String {
    let body = normalize(local_part(external_id));

    if prefix.len() + body.len() <= MAX_ACCOUNT_NAME_LEN {
        return format!("{prefix}{body}");
    }

    let hash = identity_hash(external_id);
    let keep = MAX_ACCOUNT_NAME_LEN.saturating_sub(prefix.len() + 1 + HASH_LEN);
    let truncated = body[..keep.min(body.len())].trim_end_matches('_');

    let mut name = if truncated.is_empty() {
        format!("{prefix}{hash}")
    } else {
        format!("{prefix}{truncated}_{hash}")
    };
    name.truncate(MAX_ACCOUNT_NAME_LEN);
    name
}

/// `base` with a numeric suffix, shortened to stay within the length limit.
pub fn with_suffix(base: &str, n: u32) -> String {
    let suffix = format!("_{n}");
    let keep = MAX_ACCOUNT_NAME_LEN.saturating_sub(suffix.len());
    let head = if base.len() > keep {
        base[..keep].trim_end_matches('_')
    } else {
        base
    };
    format!("{head}{suffix}")
}

/// Text before the last `@`, or the whole identity.
fn local_part(external_id: &str) -> &str {
    let trimmed = external_id.trim();
    match trimmed.rsplit_once('@') {
        Some((local, _)) if !local.is_empty() => local,
        _ => trimmed,
    }
}

fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "user".to_string()
    } else {
        trimmed.to_string()
    }
}

fn identity_hash(external_id: &str) -> String {
    let digest = Sha256::digest(external_id.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}
