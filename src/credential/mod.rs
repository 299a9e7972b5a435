//! Session credentials and the pool that rotates them
//!
//! A credential is one logged-in session against the upstream. The pool hands
//! out the least-used healthy credential, takes it out of rotation when the
//! upstream bans it, and keeps the SQLite store (source of truth) and a fast
//! cache in step.
//!
//! # Components
//!
//! - `Credential`: the persisted session record and its eligibility rules
//! - `CredentialCache`: the hot-path read store, with `MemoryCache` as the in-process backend
//! - `CredentialPool`: acquire / report / sync / admin operations

mod cache;
mod pool;

pub use cache::{CacheError, CacheResult, CredentialCache, MemoryCache};
pub use pool::{CredentialPool, PoolError, PoolStatus, SyncReport};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Session cookie names mapped to their values, in a stable order
pub type CredentialFields = BTreeMap<String, String>;

/// One session identity against the upstream
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub id: String,
    pub fields: CredentialFields,
    pub is_available: bool,
    pub is_permanently_banned: bool,
    pub temp_ban_until: Option<DateTime<Utc>>,
    pub expire_time: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

impl Credential {
    /// Creates a fresh, available credential
    pub fn new(
        id: impl Into<String>,
        fields: CredentialFields,
        expire_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            fields,
            is_available: true,
            is_permanently_banned: false,
            temp_ban_until: None,
            expire_time,
            usage_count: 0,
        }
    }

    /// True while a temporary ban is still running at `now`
    pub fn is_temp_banned(&self, now: DateTime<Utc>) -> bool {
        self.temp_ban_until.map_or(false, |until| until > now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.map_or(false, |expire| expire <= now)
    }

    /// Whether `acquire` may hand this credential out at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_available
            && !self.is_permanently_banned
            && !self.is_temp_banned(now)
            && !self.is_expired(now)
    }

    pub fn cookie_header(&self) -> String {
        cookie_header(&self.fields)
    }
}

/// A credential checked out of the pool for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: String,
    pub fields: CredentialFields,
}

impl Lease {
    pub fn cookie_header(&self) -> String {
        cookie_header(&self.fields)
    }
}

/// Parses a browser `Cookie` header value (`a=1; b=2`) into fields
///
/// Pairs without `=` or with an empty name are skipped. A later duplicate
/// name overwrites an earlier one.
pub fn parse_cookie_string(raw: &str) -> CredentialFields {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Renders fields as a `Cookie` header value
pub fn cookie_header(fields: &CredentialFields) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}
