//! Deterministic app naming.
//!
//! Names take the form `{prefix}-{project-slug}-{hash8}` where `hash8` is the
//! first 8 hex characters of `sha256(user:project[:salt])`. Without a salt
//! the same inputs always produce the same name, so a re-run reuses the
//! existing sandbox. A [`timestamp_salt`] makes every call unique.

use chrono::Utc;
use sha2::{Digest, Sha256};

const HASH_LEN: usize = 8;

/// Lowercase, map everything outside `[a-z0-9]` to `-`, collapse runs of `-`
/// and cap at `max_len` without leaving a trailing dash.
pub fn slugify(input: &str, max_len: usize) -> String {
    let slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

fn short_hash(user_id: &str, project_key: &str, salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(project_key.as_bytes());
    if let Some(salt) = salt {
        hasher.update(b":");
        hasher.update(salt.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Derive a provider-safe app name, at most `max_len` characters long and
/// matching `^[a-z0-9-]+$`.
///
/// The project slug is shortened first; the hash is only cut when even
/// `{prefix}-{hash}` does not fit.
pub fn derive_app_name(
    prefix: &str,
    max_len: usize,
    user_id: &str,
    project_key: &str,
    salt: Option<&str>,
) -> String {
    let max_len = max_len.max(1);
    let hash = short_hash(user_id, project_key, salt);
    let prefix = slugify(prefix, max_len);

    let mut head = prefix.clone();
    // Room left for the slug once prefix, hash and both separators are placed.
    let fixed = prefix.len() + HASH_LEN + if prefix.is_empty() { 1 } else { 2 };
    if max_len > fixed {
        let slug = slugify(project_key, max_len - fixed);
        if !slug.is_empty() {
            if !head.is_empty() {
                head.push('-');
            }
            head.push_str(&slug);
        }
    }

    let name = if head.is_empty() {
        hash
    } else {
        format!("{}-{}", head, hash)
    };

    if name.len() <= max_len {
        return name;
    }
    // Too tight for the full form: keep as much of the hash as fits.
    let hash_only = &name[name.len() - HASH_LEN..];
    let candidate = format!("{}-{}", prefix, hash_only);
    if !prefix.is_empty() && candidate.len() <= max_len {
        candidate
    } else {
        hash_only[..HASH_LEN.min(max_len)].to_string()
    }
}

/// Wall-clock salt for one-off names.
pub fn timestamp_salt() -> String {
    Utc::now().format("%Y%m%d%H%M%S%9f").to_string()
}

/// Project key used for naming: `owner/repo`, plus the branch when it is not
/// the default.
pub fn project_key(owner: &str, repo: &str, branch: Option<&str>) -> String {
    match branch {
        Some(b) if !b.is_empty() => format!("{}/{}@{}", owner, repo, b),
        _ => format!("{}/{}", owner, repo),
    }
}
