//! Credential Pool Manager
//!
//! The pool is the only component that mutates credential state. All of its
//! operations run under one lock, write the durable store first and then
//! mirror the change into the cache. Usage is counted both locally and in the
//! cache; selection uses the larger of the two so a restarted process does not
//! under-count.

use crate::config::PoolConfig;
use crate::credential::{Credential, CredentialCache, CredentialFields, Lease};
use crate::lock;
use crate::storage::{DailyUsage, Storage, StorageError};
use crate::SharedStorage;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned by the credential pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// No credential can be handed out right now
    #[error("All credentials are currently rate-limited or banned")]
    Exhausted,

    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Pool-wide counts for admin status summaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub temp_banned: usize,
    pub perm_banned: usize,
    pub expired: usize,
}

/// Outcome of one store/cache reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub available: usize,
    /// Temporary bans whose cooldown had ended
    pub released: usize,
    /// Cache entries that were no longer available in the store
    pub evicted: usize,
    pub cache_ok: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    local_usage: HashMap<String, u64>,
    last_cooldown_check: Option<Instant>,
    exhausted: bool,
}

/// Concurrency-safe pool of rotating session credentials
pub struct CredentialPool {
    storage: SharedStorage,
    cache: Arc<dyn CredentialCache>,
    cooldown: chrono::Duration,
    cooldown_check_interval: Duration,
    state: Mutex<PoolState>,
    available_tx: watch::Sender<bool>,
}

impl CredentialPool {
    /// Creates a pool over the given store and cache
    ///
    /// The pool starts out unsynced; call [`CredentialPool::sync`] before the
    /// first `acquire` to populate the cache.
    pub fn new(
        storage: SharedStorage,
        cache: Arc<dyn CredentialCache>,
        config: &PoolConfig,
    ) -> Self {
        let (available_tx, _) = watch::channel(false);
        Self {
            storage,
            cache,
            cooldown: chrono::Duration::seconds(config.cooldown_secs as i64),
            cooldown_check_interval: config.cooldown_check_interval(),
            state: Mutex::new(PoolState::default()),
            available_tx,
        }
    }

    /// Checks out the least-used eligible credential
    ///
    /// Ties are broken at random. Returns [`PoolError::Exhausted`] when no
    /// credential is eligible even after releasing ended cooldowns.
    pub fn acquire(&self) -> Result<Lease, PoolError> {
        self.acquire_at(Utc::now())
    }

    pub(crate) fn acquire_at(&self, now: DateTime<Utc>) -> Result<Lease, PoolError> {
        let mut state = lock(&self.state);

        if self.cooldown_check_due(&state) {
            self.release_cooldowns(&mut state, now)?;
        }

        let mut candidates = self.candidates(now)?;
        if candidates.is_empty() {
            // Looks exhausted: rebuild from the store before giving up
            self.sync_locked(&mut state, now)?;
            candidates = self.candidates(now)?;
        }

        if candidates.is_empty() {
            if !state.exhausted {
                warn!("Credential pool exhausted: no credential is currently available");
            }
            state.exhausted = true;
            self.available_tx.send_replace(false);
            return Err(PoolError::Exhausted);
        }

        let cache_usage = match self.cache.usage_all() {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!("Falling back to local usage counts: {}", e);
                None
            }
        };

        let scored: Vec<(u64, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let local = state.local_usage.get(&c.id).copied().unwrap_or(0);
                let cached = cache_usage
                    .as_ref()
                    .and_then(|u| u.get(&c.id).copied())
                    .unwrap_or(0);
                (local.max(cached), idx)
            })
            .collect();

        let least = scored.iter().map(|(usage, _)| *usage).min().unwrap_or(0);
        let ties: Vec<usize> = scored
            .iter()
            .filter(|(usage, _)| *usage == least)
            .map(|(_, idx)| *idx)
            .collect();
        let chosen = candidates.swap_remove(ties[fastrand::usize(..ties.len())]);

        state.local_usage.insert(chosen.id.clone(), least + 1);
        if let Err(e) = self.cache.increment_usage(&chosen.id) {
            debug!("Cache usage increment failed for {}: {}", chosen.id, e);
        }

        debug!("Acquired credential {} (usage {})", chosen.id, least + 1);
        Ok(Lease {
            id: chosen.id,
            fields: chosen.fields,
        })
    }

    /// Reports the upstream's verdict on a credential
    ///
    /// `valid = true` clears a temporary ban (never a permanent one).
    /// `valid = false` bans it, permanently or for the configured cooldown.
    pub fn report(&self, id: &str, valid: bool, permanent: bool) -> Result<(), PoolError> {
        self.report_at(id, valid, permanent, Utc::now())
    }

    pub(crate) fn report_at(
        &self,
        id: &str,
        valid: bool,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        if valid {
            self.clear_temporary_ban(id, now).map(|_| ())
        } else if permanent {
            self.ban(id, None, now)
        } else {
            self.ban(id, Some(now + self.cooldown), now)
        }
    }

    /// Reconciles the cache with the durable store
    ///
    /// Releases ended cooldowns, merges usage counts (persisting the maximum),
    /// and replaces the cached available set with the store's. Idempotent.
    pub fn sync(&self) -> Result<SyncReport, PoolError> {
        let mut state = lock(&self.state);
        self.sync_locked(&mut state, Utc::now())
    }

    /// Waits until a credential is available or `timeout` elapses
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.available_tx.subscribe();

        loop {
            if self.has_available() {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }

            // Cooldowns end silently, so re-check at least once a second
            let step = (deadline - now).min(Duration::from_secs(1));
            let _ = tokio::time::timeout(step, rx.changed()).await;
        }
    }

    /// Whether `acquire` would currently succeed
    pub fn has_available(&self) -> bool {
        let now = Utc::now();
        let mut state = lock(&self.state);

        let check = || -> Result<bool, PoolError> {
            Ok(!self.candidates(now)?.is_empty())
        };

        match check() {
            Ok(true) => true,
            Ok(false) => match self.release_cooldowns(&mut state, now) {
                Ok(released) => released > 0,
                Err(e) => {
                    warn!("Cooldown check failed: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("Availability check failed: {}", e);
                false
            }
        }
    }

    /// Runs [`CredentialPool::sync`] every `interval` until `shutdown` fires
    pub fn spawn_sync_loop(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup sync is the caller's job
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match pool.sync() {
                        Ok(report) => debug!(
                            "Credential sync: {}/{} available, {} released, {} evicted",
                            report.available, report.total, report.released, report.evicted
                        ),
                        Err(e) => warn!("Credential sync failed: {}", e),
                    },
                }
            }

            debug!("Credential sync loop stopped");
        })
    }

    // ===== Administration =====

    /// Adds a credential, or refreshes the fields and expiry of an existing one
    pub fn add(
        &self,
        id: &str,
        fields: CredentialFields,
        expire_days: Option<u32>,
    ) -> Result<Credential, PoolError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(PoolError::InvalidCredential(
                "credential id cannot be empty".to_string(),
            ));
        }
        if fields.is_empty() {
            return Err(PoolError::InvalidCredential(format!(
                "credential {} has no session fields",
                id
            )));
        }

        let now = Utc::now();
        let expire_time = expire_days.map(|days| now + chrono::Duration::days(i64::from(days)));

        let mut state = lock(&self.state);
        let stored = {
            let mut store = lock(&self.storage);
            store.upsert_credential(&Credential::new(id, fields, expire_time))?;
            store
                .get_credential(id)?
                .ok_or_else(|| PoolError::UnknownCredential(id.to_string()))?
        };

        if stored.is_eligible(now) {
            self.cache_insert(&stored);
            self.mark_available(&mut state);
        }

        info!("Credential {} added", id);
        Ok(stored)
    }

    pub fn ban_permanent(&self, id: &str) -> Result<(), PoolError> {
        self.ban(id, None, Utc::now())
    }

    pub fn ban_temporary(&self, id: &str, duration: Duration) -> Result<(), PoolError> {
        let now = Utc::now();
        let duration = chrono::Duration::milliseconds(duration.as_millis() as i64);
        self.ban(id, Some(now + duration), now)
    }

    /// Lifts a temporary ban
    ///
    /// Returns `false` without changing anything if the credential is
    /// permanently banned; use [`CredentialPool::force_unban`] for that.
    pub fn unban(&self, id: &str) -> Result<bool, PoolError> {
        self.clear_temporary_ban(id, Utc::now())
    }

    /// Lifts any ban, permanent ones included
    pub fn force_unban(&self, id: &str) -> Result<(), PoolError> {
        let now = Utc::now();
        let mut state = lock(&self.state);

        let restored = {
            let mut store = lock(&self.storage);
            if !store.update_credential_state(id, true, false, None)? {
                return Err(PoolError::UnknownCredential(id.to_string()));
            }
            store.get_credential(id)?
        };

        if let Some(credential) = restored.filter(|c| c.is_eligible(now)) {
            self.cache_insert(&credential);
            self.mark_available(&mut state);
        }

        info!("Credential {} force-unbanned", id);
        Ok(())
    }

    /// Deletes a credential, returning `false` if it did not exist
    pub fn delete(&self, id: &str) -> Result<bool, PoolError> {
        let now = Utc::now();
        let mut state = lock(&self.state);

        let deleted = lock(&self.storage).delete_credential(id)?;
        self.cache_remove(id);
        if let Err(e) = self.cache.forget_usage(id) {
            debug!("Cache usage cleanup failed for {}: {}", id, e);
        }
        state.local_usage.remove(id);
        self.refresh_signal(now)?;

        if deleted {
            info!("Credential {} deleted", id);
        }
        Ok(deleted)
    }

    /// Deletes every expired credential, returning the removed IDs
    pub fn cleanup_expired(&self) -> Result<Vec<String>, PoolError> {
        let now = Utc::now();
        let mut state = lock(&self.state);

        let removed = lock(&self.storage).delete_expired_credentials(now)?;
        for id in &removed {
            self.cache_remove(id);
            state.local_usage.remove(id);
        }
        self.refresh_signal(now)?;

        if !removed.is_empty() {
            info!("Removed {} expired credential(s)", removed.len());
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<Credential>, PoolError> {
        Ok(lock(&self.storage).list_credentials()?)
    }

    pub fn status(&self) -> Result<PoolStatus, PoolError> {
        let now = Utc::now();
        let credentials = lock(&self.storage).list_credentials()?;

        let mut status = PoolStatus {
            total: credentials.len(),
            ..PoolStatus::default()
        };
        for credential in &credentials {
            if credential.is_permanently_banned {
                status.perm_banned += 1;
            } else if credential.is_temp_banned(now) {
                status.temp_banned += 1;
            }
            if credential.is_expired(now) {
                status.expired += 1;
            }
            if credential.is_eligible(now) {
                status.available += 1;
            }
        }

        Ok(status)
    }

    /// Usage per credential, most used first
    pub fn usage_stats(&self) -> Result<Vec<(String, u64)>, PoolError> {
        let state = lock(&self.state);
        let credentials = lock(&self.storage).list_credentials()?;
        let cache_usage = self.cache.usage_all().unwrap_or_default();

        let mut stats: Vec<(String, u64)> = credentials
            .into_iter()
            .map(|c| {
                let usage = c
                    .usage_count
                    .max(state.local_usage.get(&c.id).copied().unwrap_or(0))
                    .max(cache_usage.get(&c.id).copied().unwrap_or(0));
                (c.id, usage)
            })
            .collect();

        stats.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(stats)
    }

    /// Requests per credential and day between `from` and `to` inclusive
    ///
    /// Counts reach the store on every sync, so requests made since the last
    /// one are not included yet.
    pub fn usage_between(
        &self,
        id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsage>, PoolError> {
        Ok(lock(&self.storage).daily_usage(id, from, to)?)
    }

    // ===== Internals =====

    fn ban(
        &self,
        id: &str,
        temp_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let _state = lock(&self.state);

        {
            let mut store = lock(&self.storage);
            let current = store
                .get_credential(id)?
                .ok_or_else(|| PoolError::UnknownCredential(id.to_string()))?;

            // A cooldown never replaces a permanent ban
            if current.is_permanently_banned && temp_until.is_some() {
                drop(store);
                self.cache_remove(id);
                debug!("Credential {} is permanently banned; ignoring cooldown", id);
                return Ok(());
            }

            let permanent = temp_until.is_none();
            if !store.update_credential_state(id, false, permanent, temp_until)? {
                return Err(PoolError::UnknownCredential(id.to_string()));
            }
        }
        self.cache_remove(id);

        match temp_until {
            None => warn!("Credential {} permanently banned", id),
            Some(until) => warn!("Credential {} temporarily banned until {}", id, until),
        }

        self.refresh_signal(now)
    }

    fn clear_temporary_ban(&self, id: &str, now: DateTime<Utc>) -> Result<bool, PoolError> {
        let mut state = lock(&self.state);

        let credential = lock(&self.storage)
            .get_credential(id)?
            .ok_or_else(|| PoolError::UnknownCredential(id.to_string()))?;

        if credential.is_permanently_banned {
            debug!("Credential {} is permanently banned; not unbanning", id);
            return Ok(false);
        }

        if !credential.is_available || credential.temp_ban_until.is_some() {
            lock(&self.storage).update_credential_state(id, true, false, None)?;
            info!("Credential {} back in rotation", id);
        }

        let restored = Credential {
            is_available: true,
            temp_ban_until: None,
            ..credential
        };
        if restored.is_eligible(now) {
            self.cache_insert(&restored);
            self.mark_available(&mut state);
        }

        Ok(true)
    }

    fn cooldown_check_due(&self, state: &PoolState) -> bool {
        state
            .last_cooldown_check
            .map_or(true, |at| at.elapsed() >= self.cooldown_check_interval)
    }

    /// Returns credentials whose cooldown ended to rotation
    fn release_cooldowns(
        &self,
        state: &mut PoolState,
        now: DateTime<Utc>,
    ) -> Result<usize, PoolError> {
        state.last_cooldown_check = Some(Instant::now());

        let released = {
            let mut store = lock(&self.storage);
            let ids = store.release_expired_bans(now)?;
            let mut released = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(credential) = store.get_credential(id)? {
                    released.push(credential);
                }
            }
            released
        };

        let mut eligible = 0;
        for credential in &released {
            info!("Credential {} cooldown ended", credential.id);
            if credential.is_eligible(now) {
                self.cache_insert(credential);
                eligible += 1;
            }
        }

        if eligible > 0 {
            self.mark_available(state);
        }
        Ok(eligible)
    }

    fn sync_locked(
        &self,
        state: &mut PoolState,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, PoolError> {
        state.last_cooldown_check = Some(Instant::now());

        let cache_usage = match self.cache.usage_all() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Credential cache unavailable during sync: {}", e);
                HashMap::new()
            }
        };

        let today = now.with_timezone(&Local).date_naive();
        let (released, credentials) = {
            let mut store = lock(&self.storage);
            let released = store.release_expired_bans(now)?;
            let credentials = store.list_credentials()?;

            for credential in &credentials {
                let merged = credential
                    .usage_count
                    .max(state.local_usage.get(&credential.id).copied().unwrap_or(0))
                    .max(cache_usage.get(&credential.id).copied().unwrap_or(0));
                state.local_usage.insert(credential.id.clone(), merged);
                if merged > credential.usage_count {
                    store.record_credential_usage(&credential.id, merged)?;
                    // Requests since the last sync are booked on the day of this one
                    store.add_daily_usage(
                        &credential.id,
                        today,
                        merged - credential.usage_count,
                    )?;
                }
            }

            (released, credentials)
        };

        let known: HashSet<&str> = credentials.iter().map(|c| c.id.as_str()).collect();
        state.local_usage.retain(|id, _| known.contains(id.as_str()));

        let available: Vec<Credential> = credentials
            .iter()
            .filter(|c| c.is_eligible(now))
            .cloned()
            .collect();
        let available_ids: HashSet<&str> = available.iter().map(|c| c.id.as_str()).collect();

        let (cache_ok, evicted) = match self.cache.ids() {
            Ok(cached) => {
                let evicted = cached
                    .iter()
                    .filter(|id| !available_ids.contains(id.as_str()))
                    .count();
                match self.cache.replace_available(&available) {
                    Ok(()) => (true, evicted),
                    Err(e) => {
                        warn!("Failed to repopulate credential cache: {}", e);
                        (false, 0)
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read credential cache: {}", e);
                (false, 0)
            }
        };

        if evicted > 0 {
            info!("Evicted {} stale credential(s) from the cache", evicted);
        }

        if available.is_empty() {
            self.available_tx.send_replace(false);
        } else {
            self.mark_available(state);
        }

        Ok(SyncReport {
            total: credentials.len(),
            available: available.len(),
            released: released.len(),
            evicted,
            cache_ok,
        })
    }

    /// Eligible credentials, from the cache or the store if the cache is down
    fn candidates(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, PoolError> {
        let credentials = match self.cache.available() {
            Ok(cached) => cached,
            Err(e) => {
                debug!("Reading credentials from the store: {}", e);
                lock(&self.storage).list_credentials()?
            }
        };

        Ok(credentials
            .into_iter()
            .filter(|c| c.is_eligible(now))
            .collect())
    }

    fn mark_available(&self, state: &mut PoolState) {
        if state.exhausted {
            info!("Credential pool has available credentials again");
            state.exhausted = false;
        }
        self.available_tx.send_replace(true);
    }

    fn refresh_signal(&self, now: DateTime<Utc>) -> Result<(), PoolError> {
        let available = !self.candidates(now)?.is_empty();
        self.available_tx.send_replace(available);
        Ok(())
    }

    fn cache_insert(&self, credential: &Credential) {
        if let Err(e) = self.cache.insert(credential) {
            debug!("Cache insert failed for {}: {}", credential.id, e);
        }
    }

    fn cache_remove(&self, id: &str) {
        if let Err(e) = self.cache.remove(id) {
            debug!("Cache remove failed for {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{parse_cookie_string, MemoryCache};
    use crate::storage::SqliteStorage;

    fn pool_with(ids: &[&str], cooldown_secs: u64) -> (Arc<CredentialPool>, Arc<MemoryCache>) {
        let storage: SharedStorage =
            Arc::new(Mutex::new(SqliteStorage::new_in_memory().unwrap()));
        let cache = Arc::new(MemoryCache::new());
        let config = PoolConfig {
            cooldown_secs,
            ..PoolConfig::default()
        };
        let pool = Arc::new(CredentialPool::new(storage, cache.clone(), &config));
        for id in ids {
            pool.add(id, parse_cookie_string(&format!("BDUSS={}", id)), None)
                .unwrap();
        }
        pool.sync().unwrap();
        (pool, cache)
    }

    #[test]
    fn test_least_used_rotation() {
        let (pool, _) = pool_with(&["a", "b"], 60);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.cookie_header(), format!("BDUSS={}", first.id));
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let (pool, _) = pool_with(&[], 60);
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));
    }

    #[test]
    fn test_permanent_ban_is_never_acquired() {
        let (pool, _) = pool_with(&["a", "b"], 60);
        pool.report("a", false, true).unwrap();

        for _ in 0..10 {
            assert_eq!(pool.acquire().unwrap().id, "b");
        }

        // A healthy report must not lift a permanent ban
        pool.report("a", true, false).unwrap();
        pool.sync().unwrap();
        for _ in 0..10 {
            assert_eq!(pool.acquire().unwrap().id, "b");
        }
        assert!(!pool.unban("a").unwrap());
    }

    #[test]
    fn test_cooldown_never_downgrades_permanent_ban() {
        let (pool, _) = pool_with(&["a", "b"], 60);

        // Two workers holding the same lease see different rejections
        pool.report("a", false, true).unwrap();
        pool.report("a", false, false).unwrap();
        pool.ban_temporary("a", Duration::from_secs(1)).unwrap();

        let status = pool.status().unwrap();
        assert_eq!(status.perm_banned, 1);
        assert_eq!(status.temp_banned, 0);

        let stored = &pool.list().unwrap()[0];
        assert!(stored.is_permanently_banned);
        assert!(stored.temp_ban_until.is_none());

        // Long after any cooldown would have ended, it is still out of rotation
        let later = Utc::now() + chrono::Duration::hours(1);
        for _ in 0..5 {
            assert_eq!(pool.acquire_at(later).unwrap().id, "b");
        }
    }

    #[test]
    fn test_temporary_ban_lasts_exactly_the_cooldown() {
        let (pool, _) = pool_with(&["a"], 60);
        let banned_at = Utc::now();
        pool.report_at("a", false, false, banned_at).unwrap();

        let just_before = banned_at + chrono::Duration::seconds(59);
        assert!(matches!(
            pool.acquire_at(just_before),
            Err(PoolError::Exhausted)
        ));

        let at_deadline = banned_at + chrono::Duration::seconds(60);
        assert_eq!(pool.acquire_at(at_deadline).unwrap().id, "a");
    }

    #[test]
    fn test_valid_report_clears_temporary_ban() {
        let (pool, _) = pool_with(&["a"], 1800);
        pool.report("a", false, false).unwrap();
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));

        pool.report("a", true, false).unwrap();
        assert_eq!(pool.acquire().unwrap().id, "a");
    }

    #[test]
    fn test_report_unknown_credential() {
        let (pool, _) = pool_with(&["a"], 60);
        assert!(matches!(
            pool.report("ghost", false, false),
            Err(PoolError::UnknownCredential(_))
        ));
    }

    #[test]
    fn test_acquire_survives_cache_outage() {
        let (pool, cache) = pool_with(&["a", "b"], 60);
        cache.set_offline(true);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_sync_evicts_stale_cache_entries() {
        let (pool, cache) = pool_with(&["a"], 60);
        cache
            .insert(&Credential::new("ghost", parse_cookie_string("x=1"), None))
            .unwrap();

        let report = pool.sync().unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.available, 1);
        assert!(report.cache_ok);
        assert_eq!(cache.ids().unwrap(), vec!["a".to_string()]);

        // Running it again changes nothing
        let again = pool.sync().unwrap();
        assert_eq!(again.evicted, 0);
        assert_eq!(again.available, 1);
    }

    #[test]
    fn test_sync_persists_usage() {
        let (pool, _) = pool_with(&["a"], 60);
        for _ in 0..3 {
            pool.acquire().unwrap();
        }
        pool.sync().unwrap();

        let stored = pool.list().unwrap();
        assert_eq!(stored[0].usage_count, 3);
        assert_eq!(pool.usage_stats().unwrap(), vec![("a".to_string(), 3)]);
    }

    #[test]
    fn test_sync_books_usage_per_day() {
        let (pool, _) = pool_with(&["a", "b"], 60);
        for _ in 0..4 {
            pool.acquire().unwrap();
        }
        pool.sync().unwrap();
        pool.acquire().unwrap();
        pool.sync().unwrap();

        // Nothing new since the last sync, so nothing is booked twice
        pool.sync().unwrap();

        let today = Local::now().date_naive();
        let usage = pool.usage_between(None, today, today).unwrap();
        assert_eq!(usage.iter().map(|u| u.count).sum::<u64>(), 5);
        assert!(usage.iter().all(|u| u.usage_date == today));

        let a = pool.usage_between(Some("a"), today, today).unwrap();
        let stored_a = pool.list().unwrap()[0].usage_count;
        assert_eq!(a.iter().map(|u| u.count).sum::<u64>(), stored_a);

        let yesterday = today - chrono::Duration::days(1);
        assert!(pool.usage_between(None, yesterday, yesterday).unwrap().is_empty());
    }

    #[test]
    fn test_status_counts() {
        let (pool, _) = pool_with(&["a", "b", "c", "d"], 60);
        pool.ban_permanent("a").unwrap();
        pool.ban_temporary("b", Duration::from_secs(600)).unwrap();

        let status = pool.status().unwrap();
        assert_eq!(
            status,
            PoolStatus {
                total: 4,
                available: 2,
                temp_banned: 1,
                perm_banned: 1,
                expired: 0,
            }
        );
    }

    #[test]
    fn test_force_unban_clears_permanent_ban() {
        let (pool, _) = pool_with(&["a"], 60);
        pool.ban_permanent("a").unwrap();
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));

        pool.force_unban("a").unwrap();
        assert_eq!(pool.acquire().unwrap().id, "a");
    }

    #[test]
    fn test_readd_keeps_usage_and_ban() {
        let (pool, _) = pool_with(&["a"], 60);
        pool.acquire().unwrap();
        pool.sync().unwrap();
        pool.ban_permanent("a").unwrap();

        let stored = pool.add("a", parse_cookie_string("BDUSS=new"), Some(30)).unwrap();
        assert!(stored.is_permanently_banned);
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.fields["BDUSS"], "new");
        assert!(stored.expire_time.is_some());
    }

    #[test]
    fn test_delete_and_add_validation() {
        let (pool, _) = pool_with(&["a"], 60);
        assert!(pool.delete("a").unwrap());
        assert!(!pool.delete("a").unwrap());
        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));

        assert!(matches!(
            pool.add(" ", parse_cookie_string("x=1"), None),
            Err(PoolError::InvalidCredential(_))
        ));
        assert!(matches!(
            pool.add("b", CredentialFields::new(), None),
            Err(PoolError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_available_wakes_on_unban() {
        let (pool, _) = pool_with(&["a"], 1800);
        pool.ban_permanent("a").unwrap();
        assert!(!pool.has_available());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_for_available(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.force_unban("a").unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_available_times_out() {
        let (pool, _) = pool_with(&["a"], 1800);
        pool.ban_permanent("a").unwrap();

        let started = std::time::Instant::now();
        assert!(!pool.wait_for_available(Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_sync_loop_stops_on_shutdown() {
        let (pool, _) = pool_with(&["a"], 60);
        let shutdown = CancellationToken::new();
        let handle = pool.spawn_sync_loop(Duration::from_millis(20), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
