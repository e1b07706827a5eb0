//! Optimistic, debounced boolean mutations (favourite toggles).
//!
//! A toggle flips the local value immediately and notifies subscribers. The
//! durable write happens only after the key has been quiet for the debounce
//! window, and only for the value the key settled on; rapid toggles collapse
//! into one write or none at all. A failed write restores the last committed
//! value unless the user toggled again while it was in progress.
//!
//! Per key the queue moves through [`KeyPhase::Idle`] → [`KeyPhase::Pending`]
//! (debounce running) → [`KeyPhase::Committing`] → back to idle, either
//! committed or rolled back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::store::{DurableStore, StoreError};

/// Durable namespace for committed membership flags.
pub const FAVORITES_NAMESPACE: &str = "favorites";

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    /// The local value changed, by a toggle or a rollback.
    Changed { key: String, value: bool },
    /// A value reached the durable store.
    Committed { key: String, value: bool },
    /// The write failed and the local value was restored to `value`.
    RolledBack { key: String, value: bool, error: String },
    /// The write failed, but a newer toggle is pending so nothing was restored.
    CommitFailed { key: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Idle,
    Pending,
    Committing,
}

#[derive(Debug, Default)]
struct KeyState {
    shadow: bool,
    committed: bool,
    generation: u64,
    committing: bool,
    /// A debounce fired while a write was running; settle again afterwards.
    resettle: bool,
}

struct Inner {
    store: Arc<dyn DurableStore>,
    namespace: String,
    debounce: Duration,
    runtime: Handle,
    /// Settled keys whose value is `false` are dropped.
    keys: Mutex<HashMap<String, KeyState>>,
    /// Queue-wide so a forgotten key never reuses a pending timer's generation.
    generations: AtomicU64,
    events: broadcast::Sender<MutationEvent>,
}

#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<Inner>,
}

impl MutationQueue {
    /// Create a queue whose timers run on the current tokio runtime.
    pub fn new(store: Arc<dyn DurableStore>, debounce: Duration) -> Result<Self, TryCurrentError> {
        Ok(Self::with_handle(store, debounce, Handle::try_current()?))
    }

    pub fn with_handle(store: Arc<dyn DurableStore>, debounce: Duration, runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                namespace: FAVORITES_NAMESPACE.to_string(),
                debounce,
                runtime,
                keys: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.inner.events.subscribe()
    }

    /// Current local value; unknown keys are `false`.
    pub fn value(&self, key: &str) -> bool {
        self.inner.keys.lock().get(key).map(|s| s.shadow).unwrap_or(false)
    }

    /// Keys whose local value is `true`, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .inner
            .keys
            .lock()
            .iter()
            .filter(|(_, s)| s.shadow)
            .map(|(k, _)| k.clone())
            .collect();
        members.sort();
        members
    }

    pub fn phase(&self, key: &str) -> KeyPhase {
        match self.inner.keys.lock().get(key) {
            Some(s) if s.committing => KeyPhase::Committing,
            Some(s) if s.shadow != s.committed => KeyPhase::Pending,
            _ => KeyPhase::Idle,
        }
    }

    /// Record a value known to be committed already, without writing it.
    pub fn seed(&self, key: &str, value: bool) {
        let mut keys = self.inner.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        state.shadow = value;
        state.committed = value;
    }

    /// Seed the given keys from the durable store. Returns how many had a
    /// stored value; unreadable records are logged and skipped.
    pub async fn load<I, S>(&self, keys: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut loaded = 0;
        for key in keys {
            let key = key.as_ref();
            let Some(raw) = self.inner.store.read(&self.inner.namespace, key).await? else {
                continue;
            };
            match serde_json::from_slice::<bool>(&raw) {
                Ok(value) => {
                    self.seed(key, value);
                    loaded += 1;
                }
                Err(e) => warn!(key = key, error = %e, "Skipping unreadable membership record"),
            }
        }
        debug!(loaded = loaded, "Membership flags loaded");
        Ok(loaded)
    }

    /// Flip a key locally and (re)start its debounce timer.
    ///
    /// Returns the new local value. Never blocks and never fails.
    pub fn toggle(&self, key: &str) -> bool {
        let (value, generation) = {
            let mut keys = self.inner.keys.lock();
            let state = keys.entry(key.to_string()).or_default();
            state.shadow = !state.shadow;
            state.generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            (state.shadow, state.generation)
        };
        debug!(key = key, value = value, "Toggled");
        self.inner.emit(MutationEvent::Changed {
            key: key.to_string(),
            value,
        });

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.settle(key, generation).await;
        });
        value
    }
}

impl Inner {
    fn emit(&self, event: MutationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Commit the settled value of `key` if `generation` is still the latest
    /// toggle. Settles again if another debounce expired during the write.
    async fn settle(self: Arc<Self>, key: String, mut generation: u64) {
        loop {
            let value = {
                let mut keys = self.keys.lock();
                let Some(state) = keys.get_mut(&key) else {
                    return;
                };
                if state.generation != generation {
                    return;
                }
                if state.committing {
                    state.resettle = true;
                    return;
                }
                if state.shadow == state.committed {
                    debug!(key = %key, value = state.shadow, "Toggles cancelled out, nothing to write");
                    if !state.shadow {
                        keys.remove(&key);
                    }
                    return;
                }
                state.committing = true;
                state.shadow
            };

            let result = match serde_json::to_vec(&value) {
                Ok(bytes) => self.store.write(&self.namespace, &key, bytes).await,
                Err(e) => Err(StoreError::from(e)),
            };

            let (event, resettle) = {
                let mut keys = self.keys.lock();
                let Some(state) = keys.get_mut(&key) else {
                    return;
                };
                state.committing = false;
                let resettle = std::mem::take(&mut state.resettle).then_some(state.generation);

                let event = match result {
                    Ok(()) => {
                        state.committed = value;
                        info!(key = %key, value = value, "Committed");
                        MutationEvent::Committed {
                            key: key.clone(),
                            value,
                        }
                    }
                    Err(e) if state.generation == generation => {
                        state.shadow = state.committed;
                        warn!(key = %key, restored = state.committed, error = %e, "Commit failed, rolled back");
                        MutationEvent::RolledBack {
                            key: key.clone(),
                            value: state.committed,
                            error: e.to_string(),
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Commit failed, newer toggle pending");
                        MutationEvent::CommitFailed {
                            key: key.clone(),
                            error: e.to_string(),
                        }
                    }
                };
                if resettle.is_none() && !state.shadow && !state.committed {
                    keys.remove(&key);
                }
                (event, resettle)
            };

            if let MutationEvent::RolledBack { value, .. } = &event {
                self.emit(MutationEvent::Changed {
                    key: key.clone(),
                    value: *value,
                });
            }
            self.emit(event);

            match resettle {
                Some(latest) => generation = latest,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const WINDOW: Duration = Duration::from_millis(50);

    /// Records every write; fails them all when `fail` is set.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        writes: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
        delay: Duration,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn writes(&self) -> Vec<(String, bool)> {
            self.writes
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::from_slice(v).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl DurableStore for RecordingStore {
        async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.read(namespace, key).await
        }

        async fn write(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.writes.lock().push((key.to_string(), value.clone()));
            if self.fail {
                return Err(StoreError::Backend("permission denied".into()));
            }
            self.inner.write(namespace, key, value).await
        }

        async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
            self.inner.remove(namespace, key).await
        }

        async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(namespace).await
        }
    }

    async fn settle() {
        tokio::time::sleep(WINDOW * 4).await;
    }

    fn drain(rx: &mut broadcast::Receiver<MutationEvent>) -> Vec<MutationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // -------------------------------------------------------------------------
    // Debounce
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_rapid_toggles_collapse_into_one_write() {
        let store = Arc::new(RecordingStore::default());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();

        assert!(queue.toggle("08NA011"));
        assert!(!queue.toggle("08NA011"));
        assert!(queue.toggle("08NA011"));
        assert_eq!(queue.phase("08NA011"), KeyPhase::Pending);

        settle().await;
        assert_eq!(store.writes(), vec![("08NA011".to_string(), true)]);
        assert!(queue.value("08NA011"));
        assert_eq!(queue.phase("08NA011"), KeyPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_that_cancel_out_write_nothing() {
        let store = Arc::new(RecordingStore::default());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();

        queue.toggle("08NA011");
        queue.toggle("08NA011");

        settle().await;
        assert!(store.writes().is_empty());
        assert!(!queue.value("08NA011"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_toggle_extends_the_window() {
        let store = Arc::new(RecordingStore::default());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();

        queue.toggle("k");
        tokio::time::sleep(WINDOW / 2).await;
        queue.toggle("k");
        tokio::time::sleep(WINDOW / 2).await;
        queue.toggle("k");
        // The first toggle's window has passed, but later toggles reset it.
        assert!(store.writes().is_empty());

        settle().await;
        assert_eq!(store.writes(), vec![("k".to_string(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_commit_independently() {
        let store = Arc::new(RecordingStore::default());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();

        queue.toggle("a");
        queue.toggle("b");
        queue.toggle("b");
        queue.toggle("c");

        settle().await;
        let mut writes = store.writes();
        writes.sort();
        assert_eq!(writes, vec![("a".to_string(), true), ("c".to_string(), true)]);
        assert_eq!(queue.members(), vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_false_keys_are_forgotten() {
        let store = Arc::new(RecordingStore::default());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();

        queue.toggle("cancelled");
        queue.toggle("cancelled");
        queue.toggle("removed");
        settle().await;
        assert_eq!(queue.inner.keys.lock().len(), 1);

        queue.toggle("removed");
        settle().await;
        assert!(queue.inner.keys.lock().is_empty());
        assert_eq!(
            store.writes(),
            vec![("removed".to_string(), true), ("removed".to_string(), false)]
        );

        // A forgotten key starts over cleanly.
        assert!(queue.toggle("cancelled"));
        settle().await;
        assert_eq!(queue.members(), vec!["cancelled".to_string()]);
    }

    // -------------------------------------------------------------------------
    // Rollback
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_rolls_back_and_reports_once() {
        let store = Arc::new(RecordingStore::failing());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();
        let mut events = queue.subscribe();

        assert!(queue.toggle("08NA011"));
        settle().await;

        assert!(!queue.value("08NA011"));
        assert_eq!(store.writes().len(), 1);

        let events = drain(&mut events);
        let failures: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MutationEvent::RolledBack { .. } | MutationEvent::CommitFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            MutationEvent::RolledBack { value: false, .. }
        ));
        assert_eq!(
            events.last(),
            Some(&MutationEvent::RolledBack {
                key: "08NA011".to_string(),
                value: false,
                error: "Storage backend error: permission denied".to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_restores_committed_value() {
        let store = Arc::new(RecordingStore::failing());
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();
        queue.seed("k", true);

        assert!(!queue.toggle("k"));
        settle().await;
        assert!(queue.value("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_failed_write_keeps_newer_intent() {
        let store = Arc::new(RecordingStore {
            fail: true,
            delay: WINDOW * 2,
            ..RecordingStore::default()
        });
        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();
        let mut events = queue.subscribe();

        queue.toggle("k");
        // Let the debounce fire and the slow write begin.
        tokio::time::sleep(WINDOW + WINDOW / 2).await;
        assert_eq!(queue.phase("k"), KeyPhase::Committing);
        queue.toggle("k");
        queue.toggle("k");

        tokio::time::sleep(WINDOW * 8).await;
        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, MutationEvent::CommitFailed { .. })));
        // The newer intent (true) was retried and failed again, this time rolling back.
        assert!(events
            .iter()
            .any(|e| matches!(e, MutationEvent::RolledBack { value: false, .. })));
        assert_eq!(store.writes().len(), 2);
        assert!(!queue.value("k"));
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_load_seeds_committed_values() {
        let store = Arc::new(RecordingStore::default());
        store
            .inner
            .write(FAVORITES_NAMESPACE, "a", b"true".to_vec())
            .await
            .unwrap();
        store
            .inner
            .write(FAVORITES_NAMESPACE, "b", b"not json".to_vec())
            .await
            .unwrap();

        let queue = MutationQueue::new(store.clone(), WINDOW).unwrap();
        let loaded = queue.load(["a", "b", "c"]).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(queue.value("a"));
        assert_eq!(queue.phase("a"), KeyPhase::Idle);

        // Turning it off writes `false`.
        queue.toggle("a");
        settle().await;
        assert_eq!(store.writes(), vec![("a".to_string(), false)]);
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        assert!(MutationQueue::new(store, WINDOW).is_err());
    }
}
