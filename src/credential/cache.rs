//! Fast credential cache
//!
//! The cache holds the currently available credentials and a shared usage
//! counter per credential. It is advisory: everything in it can be rebuilt
//! from the durable store, and the pool keeps working while it is down.

use crate::credential::Credential;
use crate::lock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Errors raised by a cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Credential cache unavailable: {0}")]
    Unavailable(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Backend for the pool's hot read path
pub trait CredentialCache: Send + Sync {
    /// Replaces the set of available credentials
    ///
    /// Usage counters are kept.
    fn replace_available(&self, credentials: &[Credential]) -> CacheResult<()>;

    /// Returns every cached available credential
    fn available(&self) -> CacheResult<Vec<Credential>>;

    /// Adds or refreshes one available credential
    fn insert(&self, credential: &Credential) -> CacheResult<()>;

    /// Drops a credential from the available set
    fn remove(&self, id: &str) -> CacheResult<()>;

    /// IDs currently in the available set
    fn ids(&self) -> CacheResult<Vec<String>>;

    /// Bumps the shared usage counter, returning the new value
    fn increment_usage(&self, id: &str) -> CacheResult<u64>;

    /// Snapshot of all usage counters
    fn usage_all(&self) -> CacheResult<HashMap<String, u64>>;

    /// Forgets the usage counter of a deleted credential
    fn forget_usage(&self, id: &str) -> CacheResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    available: BTreeMap<String, Credential>,
    usage: HashMap<String, u64>,
}

/// In-process cache backend
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`CacheError::Unavailable`] until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> CacheResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache is offline".to_string()));
        }
        Ok(())
    }
}

impl CredentialCache for MemoryCache {
    fn replace_available(&self, credentials: &[Credential]) -> CacheResult<()> {
        self.check_online()?;
        let mut state = lock(&self.state);
        state.available = credentials
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();
        Ok(())
    }

    fn available(&self) -> CacheResult<Vec<Credential>> {
        self.check_online()?;
        Ok(lock(&self.state).available.values().cloned().collect())
    }

    fn insert(&self, credential: &Credential) -> CacheResult<()> {
        self.check_online()?;
        lock(&self.state)
            .available
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> CacheResult<()> {
        self.check_online()?;
        lock(&self.state).available.remove(id);
        Ok(())
    }

    fn ids(&self) -> CacheResult<Vec<String>> {
        self.check_online()?;
        Ok(lock(&self.state).available.keys().cloned().collect())
    }

    fn increment_usage(&self, id: &str) -> CacheResult<u64> {
        self.check_online()?;
        let mut state = lock(&self.state);
        let count = state.usage.entry(id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn usage_all(&self) -> CacheResult<HashMap<String, u64>> {
        self.check_online()?;
        Ok(lock(&self.state).usage.clone())
    }

    fn forget_usage(&self, id: &str) -> CacheResult<()> {
        self.check_online()?;
        lock(&self.state).usage.remove(id);
        Ok(())
    }
}
