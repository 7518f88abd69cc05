//! # Burn-on-Read
//!
//! Destroys message material a fixed time after it was read, or as soon as
//! the application is backgrounded.
//!
//! ## Capability Tokens
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        BURN SCHEDULING                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  schedule_message_destruction("m1", cfg)                               │
//! │      ├── token = 16 random bytes, hex                                  │
//! │      ├── timer at now + cfg.burn_timeout                               │
//! │      └── returns token ──► only the holder can cancel or force it      │
//! │                                                                         │
//! │  destroy_message("m1", token)   ─┐                                     │
//! │  timer fires                     ├──► destroyer.destroy("m1")  (once)  │
//! │  app hidden + prevent_screenshot ┘    every timer for "m1" cancelled   │
//! │                                                                         │
//! │  cancel_message_destruction("m1", token)                               │
//! │      └── only the timer bound to `token` is cancelled                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two components scheduling the same message id each get their own token
//! and timer. One of them cancelling leaves the other's burn in place; the
//! first destruction of the message wins and later triggers are no-ops.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::crypto::{constant_time_eq, random_hex};
use crate::error::{Error, Result};
use crate::lifecycle::Visibility;
use crate::scheduler::{Scheduler, TaskId};
use crate::time::Clock;

/// Bytes of randomness in a burn token
pub const BURN_TOKEN_BYTES: usize = 16;

/// How and when a message burns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurnConfig {
    /// Delay before destruction, in milliseconds
    #[serde(rename = "burnTimeout")]
    pub burn_timeout_ms: u64,
    /// Emit a [`BurnEvent`] when the message is destroyed
    pub notify_on_burn: bool,
    /// Destroy immediately when the application is backgrounded
    pub prevent_screenshot: bool,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            burn_timeout_ms: 30_000,
            notify_on_burn: true,
            prevent_screenshot: true,
        }
    }
}

/// Capability required to cancel or force a scheduled burn
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BurnToken(String);

impl BurnToken {
    fn generate() -> Result<Self> {
        Ok(Self(random_hex(BURN_TOKEN_BYTES)?))
    }

    /// Wrap a token previously handed out by the scheduler
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Hex form of the token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for BurnToken {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl Eq for BurnToken {}

impl fmt::Debug for BurnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BurnToken(..)")
    }
}

/// Why a message was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnReason {
    /// The burn timeout elapsed
    Timeout,
    /// A token holder forced destruction
    Manual,
    /// The application was backgrounded
    Backgrounded,
}

/// Notification that a message was destroyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnEvent {
    /// Destroyed message
    pub message_id: String,
    /// What triggered destruction
    pub reason: BurnReason,
    /// Time of destruction (Unix millis)
    pub destroyed_at: i64,
}

/// Removes a message's plaintext and key material from the application
///
/// Implemented by the host's storage layer. Closures of the right shape
/// implement it directly.
pub trait MessageDestroyer: Send + Sync {
    /// Erase everything held for `message_id`
    fn destroy(&self, message_id: &str) -> Result<()>;
}

impl<F> MessageDestroyer for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn destroy(&self, message_id: &str) -> Result<()> {
        self(message_id)
    }
}

struct BurnEntry {
    token: BurnToken,
    deadline: i64,
    config: BurnConfig,
    task: TaskId,
}

struct BurnInner {
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    destroyer: Arc<dyn MessageDestroyer>,
    entries: Mutex<HashMap<String, Vec<BurnEntry>>>,
    disposed: AtomicBool,
    event_tx: broadcast::Sender<BurnEvent>,
}

impl BurnInner {
    /// Destroy `message_id` if `token` is one of its live tokens
    fn destroy_with_token(&self, message_id: &str, token: &BurnToken, reason: BurnReason) -> Result<()> {
        let entries = {
            let mut registry = self.entries.lock();
            let known = registry
                .get(message_id)
                .map(|list| list.iter().any(|entry| entry.token == *token))
                .unwrap_or(false);
            if !known {
                return Err(Error::DestructionTokenMismatch(message_id.to_string()));
            }
            registry.remove(message_id).unwrap_or_default()
        };
        self.burn(message_id, entries, reason)
    }

    /// Cancel every timer for a removed message and run the destroyer once
    fn burn(&self, message_id: &str, entries: Vec<BurnEntry>, reason: BurnReason) -> Result<()> {
        let mut notify = false;
        for entry in &entries {
            self.scheduler.cancel(entry.task);
            notify |= entry.config.notify_on_burn;
        }

        self.destroyer.destroy(message_id)?;
        tracing::debug!("Message {} burned ({:?})", message_id, reason);

        if notify {
            let _ = self.event_tx.send(BurnEvent {
                message_id: message_id.to_string(),
                reason,
                destroyed_at: self.clock.now_millis(),
            });
        }
        Ok(())
    }
}

/// Schedules and performs destruction of read messages
pub struct BurnOnReadScheduler {
    inner: Arc<BurnInner>,
}

impl BurnOnReadScheduler {
    /// Create a scheduler that erases messages through `destroyer`
    pub fn new(
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        destroyer: Arc<dyn MessageDestroyer>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BurnInner {
                clock,
                scheduler,
                destroyer,
                entries: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                event_tx,
            }),
        }
    }

    /// Subscribe to destruction notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BurnEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start the burn timer for `message_id`
    ///
    /// Returns the token that authorises cancelling or forcing this burn.
    pub fn schedule_message_destruction(&self, message_id: &str, config: BurnConfig) -> Result<BurnToken> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }

        let token = BurnToken::generate()?;
        let timeout_ms = i64::try_from(config.burn_timeout_ms).unwrap_or(i64::MAX);
        let deadline = self.inner.clock.now_millis().saturating_add(timeout_ms);

        // Registering under the lock keeps a zero-delay timer from firing
        // before its entry exists, and keeps a concurrent dispose from
        // missing it.
        let mut registry = self.inner.entries.lock();
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let weak: Weak<BurnInner> = Arc::downgrade(&self.inner);
        let id = message_id.to_string();
        let timer_token = token.clone();
        let task = self.inner.scheduler.schedule_after(
            Duration::from_millis(config.burn_timeout_ms),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    match inner.destroy_with_token(&id, &timer_token, BurnReason::Timeout) {
                        Ok(()) | Err(Error::DestructionTokenMismatch(_)) => {}
                        Err(e) => tracing::warn!("Timed burn of message {} failed: {}", id, e),
                    }
                }
            }),
        );

        registry.entry(message_id.to_string()).or_default().push(BurnEntry {
            token: token.clone(),
            deadline,
            config,
            task,
        });
        tracing::debug!("Message {} scheduled to burn at {}", message_id, deadline);
        Ok(token)
    }

    /// Destroy `message_id` now
    ///
    /// Returns false if the token does not match or the message was already
    /// destroyed.
    pub fn destroy_message(&self, message_id: &str, token: &BurnToken) -> bool {
        match self.try_destroy_message(message_id, token) {
            Ok(()) => true,
            Err(Error::DestructionTokenMismatch(_)) => false,
            Err(e) => {
                tracing::warn!("Destruction of message {} failed: {}", message_id, e);
                false
            }
        }
    }

    /// Destroy `message_id` now, reporting why it could not be done
    pub fn try_destroy_message(&self, message_id: &str, token: &BurnToken) -> Result<()> {
        self.inner.destroy_with_token(message_id, token, BurnReason::Manual)
    }

    /// Cancel the burn bound to `token` without destroying the message
    ///
    /// Returns false if the timer already fired or the token is unknown.
    pub fn cancel_message_destruction(&self, message_id: &str, token: &BurnToken) -> bool {
        let mut registry = self.inner.entries.lock();
        let Some(list) = registry.get_mut(message_id) else {
            return false;
        };
        let Some(pos) = list.iter().position(|entry| entry.token == *token) else {
            return false;
        };

        let entry = list.remove(pos);
        if list.is_empty() {
            registry.remove(message_id);
        }
        self.inner.scheduler.cancel(entry.task);
        tracing::debug!("Burn of message {} cancelled", message_id);
        true
    }

    /// Force-burn screenshot-protected messages when backgrounded
    pub fn on_visibility_change(&self, visibility: Visibility) {
        if !visibility.is_hidden() {
            return;
        }

        let protected: Vec<(String, Vec<BurnEntry>)> = {
            let mut registry = self.inner.entries.lock();
            let ids: Vec<String> = registry
                .iter()
                .filter(|(_, list)| list.iter().any(|entry| entry.config.prevent_screenshot))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.remove(&id).map(|list| (id, list)))
                .collect()
        };

        if !protected.is_empty() {
            tracing::info!("Burning {} protected messages after backgrounding", protected.len());
        }
        for (message_id, entries) in protected {
            if let Err(e) = self.inner.burn(&message_id, entries, BurnReason::Backgrounded) {
                tracing::warn!("Background burn of message {} failed: {}", message_id, e);
            }
        }
    }

    /// Earliest pending deadline for `message_id` (Unix millis)
    pub fn deadline(&self, message_id: &str) -> Option<i64> {
        self.inner
            .entries
            .lock()
            .get(message_id)
            .and_then(|list| list.iter().map(|entry| entry.deadline).min())
    }

    /// Number of messages with a pending burn
    pub fn pending_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Cancel every pending burn without destroying anything
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Vec<BurnEntry>> = self.inner.entries.lock().drain().map(|(_, list)| list).collect();
        for entry in drained.iter().flatten() {
            self.inner.scheduler.cancel(entry.task);
        }
        tracing::info!("Burn scheduler disposed, {} timers cancelled", drained.iter().map(Vec::len).sum::<usize>());
    }
}

impl Drop for BurnOnReadScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    struct Harness {
        scheduler: Arc<ManualScheduler>,
        burned: Arc<Mutex<Vec<String>>>,
        burn: BurnOnReadScheduler,
    }

    fn harness() -> Harness {
        let scheduler = Arc::new(ManualScheduler::new());
        let burned = Arc::new(Mutex::new(Vec::new()));
        let sink = burned.clone();
        let destroyer = move |id: &str| -> Result<()> {
            sink.lock().push(id.to_string());
            Ok(())
        };
        let burn = BurnOnReadScheduler::new(scheduler.clock(), scheduler.clone(), Arc::new(destroyer));
        Harness {
            scheduler,
            burned,
            burn,
        }
    }

    fn config(timeout_ms: u64, prevent_screenshot: bool) -> BurnConfig {
        BurnConfig {
            burn_timeout_ms: timeout_ms,
            notify_on_burn: true,
            prevent_screenshot,
        }
    }

    #[test]
    fn test_token_shape() {
        let h = harness();
        let token = h.burn.schedule_message_destruction("m1", BurnConfig::default()).unwrap();
        assert_eq!(token.as_str().len(), BURN_TOKEN_BYTES * 2);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h.burn.deadline("m1"), Some(30_000));
    }

    #[test]
    fn test_timeout_destroys_once() {
        let h = harness();
        let mut events = h.burn.subscribe();
        h.burn.schedule_message_destruction("m1", config(1_000, false)).unwrap();

        h.scheduler.advance(Duration::from_millis(999));
        assert!(h.burned.lock().is_empty());
        h.scheduler.advance(Duration::from_millis(1));
        assert_eq!(*h.burned.lock(), vec!["m1".to_string()]);
        assert_eq!(h.burn.pending_count(), 0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.reason, BurnReason::Timeout);
        assert_eq!(event.destroyed_at, 1_000);
    }

    #[test]
    fn test_manual_destroy_then_timeout_is_noop() {
        let h = harness();
        let token = h.burn.schedule_message_destruction("m1", config(1_000, false)).unwrap();

        h.scheduler.advance(Duration::from_millis(500));
        assert!(h.burn.destroy_message("m1", &token));
        assert!(!h.burn.destroy_message("m1", &token));

        h.scheduler.advance(Duration::from_millis(1_000));
        assert_eq!(h.burned.lock().len(), 1);
    }

    #[test]
    fn test_wrong_token_rejected() {
        let h = harness();
        h.burn.schedule_message_destruction("m1", config(1_000, false)).unwrap();
        let forged = BurnToken::from_string("00".repeat(BURN_TOKEN_BYTES));

        assert!(!h.burn.destroy_message("m1", &forged));
        assert!(matches!(
            h.burn.try_destroy_message("m1", &forged),
            Err(Error::DestructionTokenMismatch(_))
        ));
        assert!(!h.burn.cancel_message_destruction("m1", &forged));
        assert_eq!(h.burn.pending_count(), 1);
    }

    #[test]
    fn test_cancel_keeps_message() {
        let h = harness();
        let token = h.burn.schedule_message_destruction("m1", config(1_000, false)).unwrap();
        assert!(h.burn.cancel_message_destruction("m1", &token));
        assert!(!h.burn.cancel_message_destruction("m1", &token));

        h.scheduler.advance(Duration::from_secs(5));
        assert!(h.burned.lock().is_empty());
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn test_colliding_ids_do_not_cancel_each_other() {
        let h = harness();
        let first = h.burn.schedule_message_destruction("shared", config(1_000, false)).unwrap();
        let _second = h.burn.schedule_message_destruction("shared", config(2_000, false)).unwrap();
        assert_ne!(first, _second);

        assert!(h.burn.cancel_message_destruction("shared", &first));
        assert_eq!(h.burn.deadline("shared"), Some(2_000));

        h.scheduler.advance(Duration::from_millis(1_500));
        assert!(h.burned.lock().is_empty());
        h.scheduler.advance(Duration::from_millis(500));
        assert_eq!(*h.burned.lock(), vec!["shared".to_string()]);
    }

    #[test]
    fn test_backgrounding_burns_protected_only() {
        let h = harness();
        let mut events = h.burn.subscribe();
        h.burn.schedule_message_destruction("secret", config(60_000, true)).unwrap();
        h.burn.schedule_message_destruction("casual", config(60_000, false)).unwrap();

        h.burn.on_visibility_change(Visibility::Visible);
        assert!(h.burned.lock().is_empty());

        h.burn.on_visibility_change(Visibility::Hidden);
        assert_eq!(*h.burned.lock(), vec!["secret".to_string()]);
        assert_eq!(events.try_recv().unwrap().reason, BurnReason::Backgrounded);
        assert_eq!(h.burn.pending_count(), 1);
        assert_eq!(h.scheduler.pending(), 1);
    }

    #[test]
    fn test_notify_flag_controls_events() {
        let h = harness();
        let mut events = h.burn.subscribe();
        let quiet = BurnConfig {
            notify_on_burn: false,
            ..config(10, false)
        };
        h.burn.schedule_message_destruction("m1", quiet).unwrap();
        h.scheduler.advance(Duration::from_millis(10));
        assert_eq!(h.burned.lock().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_destroyer_failure_is_reported() {
        let scheduler = Arc::new(ManualScheduler::new());
        let destroyer = |_: &str| -> Result<()> { Err(Error::Internal("storage offline".into())) };
        let burn = BurnOnReadScheduler::new(scheduler.clock(), scheduler.clone(), Arc::new(destroyer));

        let token = burn.schedule_message_destruction("m1", config(1_000, false)).unwrap();
        assert!(matches!(burn.try_destroy_message("m1", &token), Err(Error::Internal(_))));
        assert_eq!(burn.pending_count(), 0);
    }

    #[test]
    fn test_dispose_cancels_timers() {
        let h = harness();
        h.burn.schedule_message_destruction("m1", config(1_000, true)).unwrap();
        h.burn.schedule_message_destruction("m2", config(1_000, true)).unwrap();

        h.burn.dispose();
        assert_eq!(h.scheduler.pending(), 0);
        h.scheduler.advance(Duration::from_secs(5));
        assert!(h.burned.lock().is_empty());
        assert!(matches!(
            h.burn.schedule_message_destruction("m3", BurnConfig::default()),
            Err(Error::Disposed)
        ));
    }

    #[test]
    fn test_config_json() {
        let config: BurnConfig = serde_json::from_str(r#"{"burnTimeout": 5000, "preventScreenshot": false}"#).unwrap();
        assert_eq!(config.burn_timeout_ms, 5_000);
        assert!(config.notify_on_burn);
        assert!(!config.prevent_screenshot);
    }

    #[test]
    fn test_far_timeouts_never_fire() {
        let clock = Arc::new(crate::time::ManualClock::new(1_700_000_000_000));
        let scheduler = Arc::new(ManualScheduler::with_clock(clock.clone()));
        let burned = Arc::new(Mutex::new(Vec::new()));
        let sink = burned.clone();
        let destroyer = move |id: &str| -> Result<()> {
            sink.lock().push(id.to_string());
            Ok(())
        };
        let burn = BurnOnReadScheduler::new(clock, scheduler.clone(), Arc::new(destroyer));

        burn.schedule_message_destruction("forever", config(u64::MAX, false)).unwrap();
        burn.schedule_message_destruction("almost", config(i64::MAX as u64, false)).unwrap();
        assert_eq!(burn.deadline("forever"), Some(i64::MAX));
        assert_eq!(burn.deadline("almost"), Some(i64::MAX));

        scheduler.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(burned.lock().is_empty());
        assert_eq!(burn.pending_count(), 2);
    }

    #[test]
    fn test_schedule_racing_dispose_leaves_no_timers() {
        for _ in 0..20 {
            let h = harness();
            std::thread::scope(|s| {
                for worker in 0..4 {
                    let burn = &h.burn;
                    s.spawn(move || {
                        for i in 0..50 {
                            let _ = burn.schedule_message_destruction(&format!("m{}-{}", worker, i), config(1_000, false));
                        }
                    });
                }
                h.burn.dispose();
            });

            assert_eq!(h.burn.pending_count(), 0);
            assert_eq!(h.scheduler.pending(), 0);
            assert!(matches!(
                h.burn.schedule_message_destruction("late", config(1_000, false)),
                Err(Error::Disposed)
            ));
        }
    }
}
