//! Live availability broadcast.
//!
//! A single-writer register telling consumers whether live data is flowing
//! and why. While a replay has locked the register, only replay-tagged
//! reasons may change it; this stops the supervisor from flipping state
//! under an active playback.

use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Reason prefix that marks replay-origin state changes.
const REPLAY_REASON_PREFIX: &str = "replay";

/// Immutable view of the availability register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub is_live: bool,
    pub reason: String,
    pub replay_locked: bool,
}

type Listener = Arc<dyn Fn(&AvailabilitySnapshot) + Send + Sync>;

struct Inner {
    is_live: bool,
    reason: String,
    replay_locked: bool,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// Fan-out tracker for live/idle/replay transitions.
pub struct LiveAvailability {
    inner: Arc<Mutex<Inner>>,
}

impl Default for LiveAvailability {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveAvailability {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                is_live: false,
                reason: "init".to_string(),
                replay_locked: false,
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        AvailabilitySnapshot {
            is_live: inner.is_live,
            reason: inner.reason.clone(),
            replay_locked: inner.replay_locked,
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_live
    }

    /// Update the register. Returns `false` when the change was blocked by
    /// an active replay lock.
    pub fn set_state(&self, is_live: bool, reason: &str) -> bool {
        let is_replay_reason = reason.starts_with(REPLAY_REASON_PREFIX);
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.replay_locked && !is_replay_reason {
                debug!(
                    blocked_state = if is_live { "live" } else { "idle" },
                    reason, "availability change blocked while replay active"
                );
                return false;
            }
            if reason == "replay" {
                inner.replay_locked = true;
            } else if is_replay_reason {
                inner.replay_locked = false;
            }
            if inner.is_live == is_live && inner.reason == reason {
                return true;
            }
            inner.is_live = is_live;
            inner.reason = reason.to_string();
            info!(
                state = if is_live { "LIVE" } else { "IDLE" },
                reason, "live timing availability changed"
            );
            let snapshot = AvailabilitySnapshot {
                is_live: inner.is_live,
                reason: inner.reason.clone(),
                replay_locked: inner.replay_locked,
            };
            let listeners: Vec<Listener> =
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (snapshot, listeners)
        };
        // Listeners run outside the lock so they may call back in.
        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    /// Register a listener. The listener fires immediately with the current
    /// snapshot and is removed when the returned guard drops.
    pub fn add_listener<F>(&self, listener: F) -> AvailabilityListenerGuard
    where
        F: Fn(&AvailabilitySnapshot) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.listeners.push((id, Arc::clone(&listener)));
            let snapshot = AvailabilitySnapshot {
                is_live: inner.is_live,
                reason: inner.reason.clone(),
                replay_locked: inner.replay_locked,
            };
            (id, snapshot)
        };
        listener(&snapshot);
        AvailabilityListenerGuard { inner: Arc::downgrade(&self.inner), id }
    }
}

/// Removes its listener on drop.
pub struct AvailabilityListenerGuard {
    inner: Weak<Mutex<Inner>>,
    id: u64,
}

impl Drop for AvailabilityListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn replay_lock_blocks_non_replay_reasons() {
        let tracker = LiveAvailability::new();
        assert!(tracker.set_state(true, "replay"));
        assert!(tracker.snapshot().replay_locked);

        // Supervisor tries to flip state mid-replay.
        assert!(!tracker.set_state(false, "disconnect-window-expired"));
        assert!(tracker.is_live());

        // Replay completion unlocks and applies.
        assert!(tracker.set_state(false, "replay-completed"));
        let snap = tracker.snapshot();
        assert!(!snap.is_live);
        assert!(!snap.replay_locked);

        // Normal updates flow again.
        assert!(tracker.set_state(true, "live-Race"));
        assert!(tracker.is_live());
    }

    #[test]
    fn listener_fires_on_attach_and_updates() {
        let tracker = LiveAvailability::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let calls2 = Arc::clone(&calls);
        let seen2 = Arc::clone(&seen);
        let guard = tracker.add_listener(move |snap| {
            calls2.fetch_add(1, Ordering::SeqCst);
            seen2.lock().unwrap().push(snap.reason.clone());
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tracker.set_state(true, "live-Qualifying");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(seen.lock().unwrap().last().unwrap(), "live-Qualifying");

        drop(guard);
        tracker.set_state(false, "finished-Qualifying");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_state_is_not_redelivered() {
        let tracker = LiveAvailability::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let _guard = tracker.add_listener(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        tracker.set_state(true, "live-Race");
        tracker.set_state(true, "live-Race");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
