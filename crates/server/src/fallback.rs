//! Degraded-mode coordination.
//!
//! [`FallbackCoordinator`] is the single source of truth for whether the
//! remote store is treated as unavailable. Activation starts a probe loop
//! that pings Redis every `probe_interval`; the first successful ping ends
//! degraded mode. The loop stops as soon as degraded mode ends, whichever
//! path ended it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::observer::{Observers, Subscription};
use crate::redact::redact_credentials;
use crate::stores::StoreProbe;

/// Snapshot of the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FallbackState {
    pub active: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
}

struct Inner {
    active: bool,
    last_changed_at: Option<DateTime<Utc>>,
    probe: Option<CancellationToken>,
}

pub struct FallbackCoordinator {
    me: Weak<FallbackCoordinator>,
    probe: Arc<dyn StoreProbe>,
    probe_interval: Duration,
    inner: Mutex<Inner>,
    // Serializes transitions so notifications follow call order.
    transition: Mutex<()>,
    activated: Observers<()>,
    deactivated: Observers<()>,
}

impl FallbackCoordinator {
    pub fn new(probe: Arc<dyn StoreProbe>, probe_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            probe,
            probe_interval,
            inner: Mutex::new(Inner {
                active: false,
                last_changed_at: None,
                probe: None,
            }),
            transition: Mutex::new(()),
            activated: Observers::new(),
            deactivated: Observers::new(),
        })
    }

    pub fn is_in_fallback_mode(&self) -> bool {
        lock(&self.inner).active
    }

    pub fn state(&self) -> FallbackState {
        let inner = lock(&self.inner);
        FallbackState {
            active: inner.active,
            last_changed_at: inner.last_changed_at,
        }
    }

    /// Enter degraded mode. Returns false if it was already active.
    ///
    /// Callbacks run on the calling thread and must not call back into
    /// `activate_fallback` or `deactivate_fallback`.
    pub fn activate_fallback(&self) -> bool {
        let _transition = lock(&self.transition);
        {
            let mut inner = lock(&self.inner);
            if inner.active {
                return false;
            }
            inner.active = true;
            inner.last_changed_at = Some(Utc::now());
            inner.probe = self.spawn_probe();
        }

        tracing::warn!("remote store unavailable, switched to in-memory fallback");
        self.activated.notify(&());
        true
    }

    /// Leave degraded mode. Returns false if it was not active.
    pub fn deactivate_fallback(&self) -> bool {
        let _transition = lock(&self.transition);
        {
            let mut inner = lock(&self.inner);
            if !inner.active {
                return false;
            }
            inner.active = false;
            inner.last_changed_at = Some(Utc::now());
            if let Some(probe) = inner.probe.take() {
                probe.cancel();
            }
        }

        tracing::info!("remote store available again, left in-memory fallback");
        self.deactivated.notify(&());
        true
    }

    pub fn on_fallback_activated<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.activated.subscribe(move |_: &()| callback())
    }

    pub fn on_fallback_deactivated<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.deactivated.subscribe(move |_: &()| callback())
    }

    /// True while the reconnection probe loop is running.
    pub fn is_probing(&self) -> bool {
        lock(&self.inner)
            .probe
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Stop the probe loop without changing the mode.
    pub fn shutdown(&self) {
        if let Some(probe) = lock(&self.inner).probe.take() {
            probe.cancel();
        }
    }

    fn spawn_probe(&self) -> Option<CancellationToken> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime available, reconnection probe not started");
            return None;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let coordinator = self.me.clone();
        let probe = Arc::clone(&self.probe);
        let interval = self.probe_interval;

        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    result = probe.ping() => result,
                };

                match result {
                    Ok(()) => {
                        tracing::info!("reconnection probe succeeded");
                        if let Some(coordinator) = coordinator.upgrade() {
                            coordinator.deactivate_fallback();
                        }
                        break;
                    }
                    Err(e) => {
                        let message = format!("{:#}", e);
                        tracing::debug!(
                            error = %redact_credentials(&message),
                            "reconnection probe failed"
                        );
                    }
                }
            }
        });

        Some(token)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FlakyProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));
        let (activations, on_activate) = counter();
        let _sub = coordinator.on_fallback_activated(on_activate);

        assert!(coordinator.activate_fallback());
        assert!(!coordinator.activate_fallback());

        assert!(coordinator.is_in_fallback_mode());
        assert_eq!(activations.load(Ordering::SeqCst), 1);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn deactivation_without_activation_is_noop() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));
        let (deactivations, on_deactivate) = counter();
        let _sub = coordinator.on_fallback_deactivated(on_deactivate);

        assert!(!coordinator.deactivate_fallback());

        assert_eq!(deactivations.load(Ordering::SeqCst), 0);
        assert!(coordinator.state().last_changed_at.is_none());
    }

    #[tokio::test]
    async fn transitions_record_timestamp() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));

        coordinator.activate_fallback();
        let state = coordinator.state();

        assert!(state.active);
        assert!(state.last_changed_at.is_some());
        coordinator.deactivate_fallback();
        assert!(!coordinator.state().active);
    }

    #[tokio::test]
    async fn notifications_follow_call_order() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = log.clone();
        let _a = coordinator.on_fallback_activated(move || sink.lock().unwrap().push("activated"));
        let sink = log.clone();
        let _d = coordinator.on_fallback_deactivated(move || sink.lock().unwrap().push("deactivated"));

        coordinator.activate_fallback();
        coordinator.activate_fallback();
        coordinator.deactivate_fallback();
        coordinator.deactivate_fallback();
        coordinator.activate_fallback();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["activated", "deactivated", "activated"]
        );
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));
        let (activations, on_activate) = counter();

        let _bad = coordinator.on_fallback_activated(|| panic!("subscriber failure"));
        let _good = coordinator.on_fallback_activated(on_activate);

        coordinator.activate_fallback();

        assert_eq!(activations.load(Ordering::SeqCst), 1);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn unsubscribed_callback_is_not_called() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));
        let (activations, on_activate) = counter();

        coordinator.on_fallback_activated(on_activate).unsubscribe();
        coordinator.activate_fallback();

        assert_eq!(activations.load(Ordering::SeqCst), 0);
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_ends_fallback() {
        let probe = Arc::new(FlakyProbe::down());
        let coordinator = FallbackCoordinator::new(probe.clone(), Duration::from_secs(30));
        let (deactivations, on_deactivate) = counter();
        let _sub = coordinator.on_fallback_deactivated(on_deactivate);

        coordinator.activate_fallback();
        assert!(coordinator.is_probing());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(coordinator.is_in_fallback_mode());
        assert_eq!(probe.pings(), 1);

        probe.set_healthy(true);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!coordinator.is_in_fallback_mode());
        assert!(!coordinator.is_probing());
        assert_eq!(deactivations.load(Ordering::SeqCst), 1);
        assert_eq!(probe.pings(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_stops_when_deactivated_elsewhere() {
        let probe = Arc::new(FlakyProbe::down());
        let coordinator = FallbackCoordinator::new(probe.clone(), Duration::from_secs(30));

        coordinator.activate_fallback();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(probe.pings(), 1);

        coordinator.deactivate_fallback();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(probe.pings(), 1);
        assert!(!coordinator.is_probing());
    }

    #[test]
    fn activation_outside_runtime_skips_probe() {
        let coordinator = FallbackCoordinator::new(Arc::new(FlakyProbe::down()), Duration::from_secs(30));

        assert!(coordinator.activate_fallback());
        assert!(!coordinator.is_probing());
    }
}
