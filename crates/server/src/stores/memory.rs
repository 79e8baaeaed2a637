//! Process-local TTL store used while the remote store is unreachable.
//!
//! Entries expire lazily on read and through a periodic sweep. The store is
//! never shared between instances, so lockouts recorded here only apply to
//! the process that recorded them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::kv::KvBackend;

#[derive(Clone, Debug)]
struct StoreEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A TTL too large to represent as an instant never expires.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-memory key/value store emulating Redis expiry and counter semantics.
pub struct TtlStore {
    entries: Arc<DashMap<String, StoreEntry>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl TtlStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background sweep. Calling it again replaces the running sweep.
    pub fn start_sweep(&self, interval: Duration) {
        let cancel = CancellationToken::new();
        let entries = Arc::clone(&self.entries);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweep(&entries, Instant::now());
                        if removed > 0 {
                            tracing::debug!(removed, remaining = entries.len(), "swept expired entries");
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.lock_sweeper().replace(Sweeper { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        sweep(&self.entries, Instant::now())
    }

    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| deadline(now, ttl));
        self.entries.insert(
            key.to_string(),
            StoreEntry {
                value: value.into(),
                expires_at,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.remove_if_expired(key, now);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Increment a counter.
    ///
    /// Absent or expired keys start at 1 with no expiry. A value that is not
    /// an integer is reset to 1 rather than rejected. The expiry of a live
    /// key is left untouched.
    pub fn incr(&self, key: &str) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoreEntry {
                value: "0".into(),
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.value = "0".into();
            entry.expires_at = None;
        }

        let next = match entry.value.parse::<i64>() {
            Ok(current) => current.saturating_add(1),
            Err(_) => {
                tracing::debug!(key = %key, "non-numeric counter reset to 1");
                1
            }
        };
        entry.value = next.to_string();
        next
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = deadline(now, ttl);
                true
            }
            Some(entry) => {
                drop(entry);
                self.remove_if_expired(key, now);
                false
            }
            None => false,
        }
    }

    /// Remaining lifetime in whole seconds, rounded up: -2 if missing, -1 if
    /// the key never expires.
    pub fn ttl(&self, key: &str) -> i64 {
        let now = Instant::now();
        let expires_at = match self.entries.get(key) {
            Some(entry) => entry.expires_at,
            None => return -2,
        };
        match expires_at {
            None => -1,
            Some(at) if at <= now => {
                self.remove_if_expired(key, now);
                -2
            }
            Some(at) => {
                let remaining = at - now;
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                secs as i64
            }
        }
    }

    pub fn del(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the sweep and drop every entry.
    pub fn destroy(&self) {
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }
        self.clear();
    }

    pub fn is_sweeping(&self) -> bool {
        self.lock_sweeper()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    fn remove_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<Sweeper>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TtlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TtlStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.cancel.cancel();
        }
    }
}

fn sweep(entries: &DashMap<String, StoreEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(entries.len())
}

#[async_trait]
impl KvBackend for TtlStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(TtlStore::get(self, key))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        TtlStore::set(self, key, value, ttl_secs.map(Duration::from_secs));
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(TtlStore::incr(self, key))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        Ok(TtlStore::expire(self, key, Duration::from_secs(ttl_secs)))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(TtlStore::del(self, key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(TtlStore::exists(self, key))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        Ok(TtlStore::ttl(self, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn value_visible_until_expiry() {
        let store = TtlStore::new();
        store.set("k", "v", Some(Duration::from_secs(10)));

        advance(Duration::from_millis(9_999)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));

        advance(Duration::from_millis(2)).await;
        assert_eq!(store.get("k"), None);
        assert!(!store.exists("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_read_deletes_entry() {
        let store = TtlStore::new();
        store.set("k", "v", Some(Duration::from_secs(1)));

        advance(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
        assert!(!store.exists("k"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn value_without_ttl_never_expires() {
        let store = TtlStore::new();
        store.set("k", "v", None);

        advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert_eq!(store.ttl("k"), -1);
    }

    #[tokio::test]
    async fn incr_initializes_absent_key() {
        let store = TtlStore::new();

        assert_eq!(store.incr("counter"), 1);
        assert_eq!(store.incr("counter"), 2);
        assert_eq!(store.get("counter").as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn incr_on_expired_key_restarts_at_one() {
        let store = TtlStore::new();
        store.set("counter", "4", Some(Duration::from_secs(5)));

        advance(Duration::from_secs(6)).await;

        assert_eq!(store.incr("counter"), 1);
        assert_eq!(store.ttl("counter"), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_preserves_existing_ttl() {
        let store = TtlStore::new();
        store.incr("counter");
        assert!(store.expire("counter", Duration::from_secs(60)));

        advance(Duration::from_secs(20)).await;
        assert_eq!(store.incr("counter"), 2);
        assert_eq!(store.ttl("counter"), 40);

        advance(Duration::from_secs(41)).await;
        assert_eq!(store.get("counter"), None);
    }

    #[tokio::test]
    async fn incr_resets_non_numeric_value() {
        let store = TtlStore::new();
        store.set("counter", "not-a-number", None);

        assert_eq!(store.incr("counter"), 1);
    }

    #[tokio::test]
    async fn del_reports_presence() {
        let store = TtlStore::new();
        store.set("k", "v", None);

        assert!(store.del("k"));
        assert!(!store.del("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_rounds_up_and_reports_missing() {
        let store = TtlStore::new();
        store.set("k", "v", Some(Duration::from_secs(30)));

        advance(Duration::from_millis(500)).await;
        assert_eq!(store.ttl("k"), 30);
        assert_eq!(store.ttl("missing"), -2);
    }

    #[tokio::test]
    async fn expire_on_missing_key_returns_false() {
        let store = TtlStore::new();

        assert!(!store.expire("missing", Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_entries_nobody_reads() {
        let store = TtlStore::new();
        store.set("short", "v", Some(Duration::from_secs(5)));
        store.set("long", "v", Some(Duration::from_secs(500)));
        store.start_sweep(Duration::from_secs(60));
        assert!(store.is_sweeping());

        // Sleeping lets the paused clock auto-advance past the sweep tick.
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.len(), 1);
        assert!(store.exists("long"));
        store.destroy();
    }

    #[tokio::test]
    async fn destroy_stops_sweep_and_clears() {
        let store = TtlStore::new();
        store.set("k", "v", None);
        store.start_sweep(Duration::from_secs(60));

        store.destroy();
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        assert!(!store.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let store = TtlStore::new();
        store.set("short", "v", Some(Duration::from_secs(5)));
        store.set("long", "v", Some(Duration::from_secs(500)));
        store.set("forever", "v", None);

        advance(Duration::from_secs(6)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let store = TtlStore::new();
        store.set("k", "v", Some(Duration::from_secs(u64::MAX)));
        store.set("c", "1", Some(Duration::from_secs(60)));

        assert!(store.expire("c", Duration::MAX));

        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert_eq!(store.ttl("k"), -1);
        assert_eq!(store.ttl("c"), -1);
    }

    #[tokio::test]
    async fn huge_ttl_through_backend_trait() {
        let store = TtlStore::new();
        let backend: &dyn KvBackend = &store;

        backend.set("k", "v", Some(u64::MAX)).await.unwrap();
        assert_eq!(backend.incr("c").await.unwrap(), 1);
        assert!(backend.expire("c", u64::MAX).await.unwrap());

        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(backend.ttl("c").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn backend_trait_matches_inherent_behavior() {
        let store = TtlStore::new();
        let backend: &dyn KvBackend = &store;

        backend.set("k", "1", Some(30)).await.unwrap();
        assert_eq!(backend.incr("k").await.unwrap(), 2);
        assert!(backend.exists("k").await.unwrap());
        assert_eq!(backend.ttl("k").await.unwrap(), 30);
        assert!(backend.del("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
