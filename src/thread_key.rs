//! Thread identifiers.
//!
//! A [`ThreadKey`] addresses a thread's directory on disk and its slot in the
//! engine cache. The only way to obtain one is through [`ThreadKey::parse`]
//! (validated caller input) or [`ThreadKey::from_url`] (derived from a
//! normalized source URL), so every path or cache lookup downstream works on
//! an identifier that passed [`is_valid_thread_key`].

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Upper bound on key length, in bytes.
pub const MAX_THREAD_KEY_LEN: usize = 128;

/// Length of the slug part of a derived key.
const SLUG_MAX_LEN: usize = 64;

/// Hex digits of the URL digest appended to a derived key.
const DIGEST_LEN: usize = 12;

/// Allow-list check: non-empty, at most [`MAX_THREAD_KEY_LEN`] bytes, only
/// ASCII alphanumerics, `-` and `_`.
///
/// Pure; performs no I/O. Since `.` and `/` are outside the allow-list,
/// traversal tokens such as `..` or `a/b` are rejected as well.
pub fn is_valid_thread_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_THREAD_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A validated thread identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadKey(String);

impl ThreadKey {
    /// Validate caller-supplied input.
    pub fn parse(raw: &str) -> Result<Self> {
        if is_valid_thread_key(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidThreadKey)
        }
    }

    /// Derive the key for a normalized thread URL.
    ///
    /// The key is a readable slug of host and path followed by a short digest
    /// of the full URL, so the same URL always maps to the same thread.
    pub fn from_url(normalized_url: &str) -> Result<Self> {
        let url = Url::parse(normalized_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", normalized_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", normalized_url)))?;

        let mut slug = String::with_capacity(SLUG_MAX_LEN);
        let mut last_dash = true;
        for c in host.chars().chain(url.path().chars()) {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
            if slug.len() >= SLUG_MAX_LEN {
                break;
            }
        }
        let slug = slug.trim_matches('-');

        let digest = format!("{:x}", Sha256::digest(normalized_url.as_bytes()));
        let key = format!("{}_{}", slug, &digest[..DIGEST_LEN]);
        Self::parse(&key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ThreadKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for ThreadKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a thread URL before ingestion.
///
/// Adds `https://` when no scheme is given, lowercases the host, drops the
/// fragment, pagination (`page`) and `utm_*` tracking parameters, and trims a
/// trailing slash from the path. Only `http` and `https` are accepted.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("empty URL".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let mut url =
        Url::parse(&candidate).map_err(|e| Error::InvalidUrl(format!("{}: {}", trimmed, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidUrl(format!(
                "{}: unsupported scheme '{}'",
                trimmed, other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidUrl(format!("{}: missing host", trimmed)));
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page" && !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut normalized = url.to_string();
    // `Url` always renders a root path as "/"; drop it for bare hosts.
    if url.path() == "/" && url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}
