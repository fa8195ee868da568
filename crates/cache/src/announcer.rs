//! Announcer
//!
//! Keeps every locally held (key, infohash) pair visible in the DHT by
//! re-announcing on a bounded cadence: 20 minutes after a success, 5
//! minutes after a failure, immediately for entries never tried. One loop
//! picks entries in list order (never-attempted ones stay at the front);
//! announce tasks run under a semaphore so at most a configured number are
//! in flight, each with three attempts and a short backoff.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachecraft_core::{Cancel, Result};
use cachecraft_dht::NodeId;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::debug;

pub const SUCCESS_REANNOUNCE_PERIOD: Duration = Duration::from_secs(20 * 60);
pub const FAILURE_REANNOUNCE_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SIMULTANEOUS_ANNOUNCEMENTS: usize = 16;

const ATTEMPTS: u32 = 3;

/// The actual announce operation, typically `Dht::tracker_announce`
/// partially applied.
pub type AnnounceFn = Arc<
    dyn Fn(NodeId, Cancel) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

#[derive(Clone)]
struct Entry {
    key: String,
    infohash: NodeId,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    to_remove: bool,
}

impl Entry {
    fn attempted(&self) -> bool {
        self.last_success.is_some() || self.last_failure.is_some()
    }

    fn next_update_after(&self, now: Instant) -> Duration {
        match (self.last_success, self.last_failure) {
            (None, None) => Duration::ZERO,
            (success, failure) => {
                if success >= failure {
                    let at = success.expect("success >= failure and not both None")
                        + SUCCESS_REANNOUNCE_PERIOD;
                    at.saturating_duration_since(now)
                } else {
                    let at = failure.expect("failure > success") + FAILURE_REANNOUNCE_PERIOD;
                    at.saturating_duration_since(now)
                }
            }
        }
    }
}

struct State {
    entries: VecDeque<Entry>,
}

/// Handle to the announce loop. Cheap to clone.
#[derive(Clone)]
pub struct Announcer {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Announcer {
    /// Spawn the loop; it stops when `cancel` fires.
    pub fn start(announce: AnnounceFn, simultaneous: usize, cancel: &Cancel) -> Self {
        let announcer = Self {
            state: Arc::new(Mutex::new(State { entries: VecDeque::new() })),
            notify: Arc::new(Notify::new()),
        };
        let run = announcer.clone();
        let cancel = cancel.child();
        tokio::spawn(async move { run.run(announce, simultaneous, cancel).await });
        announcer
    }

    /// Enqueue a key. Returns false when already present (a pending
    /// removal is undone instead).
    pub fn add(&self, key: impl Into<String>, infohash: NodeId) -> bool {
        let key = key.into();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.entries.iter_mut().find(|e| e.key == key) {
            debug!(key = %key, "Adding (already exists)");
            existing.to_remove = false;
            return false;
        }
        debug!(key = %key, "Adding");
        // Never-attempted entries go in front of everything attempted, in
        // arrival order.
        let at = state
            .entries
            .iter()
            .position(|e| e.attempted())
            .unwrap_or(state.entries.len());
        state.entries.insert(
            at,
            Entry { key, infohash, last_success: None, last_failure: None, to_remove: false },
        );
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Mark a key for removal; the loop drops it instead of re-announcing.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                debug!(key, "Marking for removal");
                entry.to_remove = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn run(self, announce: AnnounceFn, simultaneous: usize, cancel: Cancel) {
        let semaphore = Arc::new(Semaphore::new(simultaneous.max(1)));
        loop {
            let Some(entry) = self.pick_entry(&cancel).await else { return };

            let permit = tokio::select! {
                _ = cancel.fired_wait() => return,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let announcer = self.clone();
            let announce = announce.clone();
            let task_cancel = cancel.child();
            tokio::spawn(async move {
                let _permit = permit;
                let mut entry = entry;
                debug!(key = %entry.key, "Announcing");
                let mut success = false;
                for attempt in 0..ATTEMPTS {
                    match announce(entry.infohash, task_cancel.clone()).await {
                        Ok(()) => {
                            success = true;
                            break;
                        }
                        Err(err) if err.is_cancelled() => return,
                        Err(err) => {
                            debug!(key = %entry.key, %err, "announce attempt failed");
                        }
                    }
                    if task_cancel
                        .sleep(Duration::from_secs(1 + attempt as u64))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let now = Instant::now();
                if success {
                    entry.last_failure = None;
                    entry.last_success = Some(now);
                } else {
                    entry.last_failure = Some(now);
                }
                debug!(key = %entry.key, success, "Announcing: done");
                if !entry.to_remove {
                    let mut state = announcer.state.lock().unwrap();
                    // A removal may have raced while we were announcing.
                    if !state.entries.iter().any(|e| e.key == entry.key) {
                        state.entries.push_back(entry);
                    }
                    drop(state);
                    announcer.notify.notify_waiters();
                }
            });
        }
    }

    /// Block until the front entry is due, dropping removals on the way.
    /// Sleeps are interrupted by inserts so a fresh key never waits behind
    /// an idle timer.
    async fn pick_entry(&self, cancel: &Cancel) -> Option<Entry> {
        loop {
            if cancel.fired() {
                return None;
            }
            let wait = {
                let mut state = self.state.lock().unwrap();
                loop {
                    match state.entries.front() {
                        None => {
                            debug!("No entries to update, waiting...");
                            break None;
                        }
                        Some(front) if front.to_remove => {
                            state.entries.pop_front();
                            continue;
                        }
                        Some(front) => {
                            let d = front.next_update_after(Instant::now());
                            if d.is_zero() {
                                return state.entries.pop_front();
                            }
                            break Some(d);
                        }
                    }
                }
            };
            match wait {
                None => {
                    tokio::select! {
                        _ = cancel.fired_wait() => return None,
                        _ = self.notify.notified() => {}
                    }
                }
                Some(d) => {
                    tokio::select! {
                        _ = cancel.fired_wait() => return None,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(d) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn announce_fn(self: &Arc<Self>, delay: Duration) -> AnnounceFn {
            let this = self.clone();
            Arc::new(move |_infohash, cancel| {
                let this = this.clone();
                Box::pin(async move {
                    this.calls.fetch_add(1, Ordering::SeqCst);
                    let now = this.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    this.max_concurrent.fetch_max(now, Ordering::SeqCst);
                    let result = cancel.sleep(delay).await;
                    this.concurrent.fetch_sub(1, Ordering::SeqCst);
                    result?;
                    if this.fail.load(Ordering::SeqCst) {
                        Err(cachecraft_core::Error::network("refused"))
                    } else {
                        Ok(())
                    }
                })
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_entry_announced_immediately() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        announcer.add("example.com", NodeId::random());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_cadence_is_twenty_minutes() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        announcer.add("example.com", NodeId::random());

        tokio::time::sleep(Duration::from_secs(19 * 60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retried_after_five_minutes() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        recorder.fail.store(true, Ordering::SeqCst);
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        announcer.add("example.com", NodeId::random());

        // First round: three attempts with backoff.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);

        // Next round no sooner than five minutes after the failure.
        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 6);
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounded_by_semaphore() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_secs(5)), 4, &cancel);
        for i in 0..20 {
            announcer.add(format!("group-{i}"), NodeId::random());
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 20);
        assert!(recorder.max_concurrent.load(Ordering::SeqCst) <= 4);
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_is_idempotent() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        assert!(announcer.add("example.com", NodeId::random()));
        assert!(!announcer.add("example.com", NodeId::random()));
        assert_eq!(announcer.len(), 1);
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_entry_is_dropped_not_reannounced() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        announcer.add("example.com", NodeId::random());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        assert!(announcer.remove("example.com"));
        tokio::time::sleep(Duration::from_secs(40 * 60)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert!(announcer.is_empty());
        cancel.fire();
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_interrupts_idle_sleep() {
        let cancel = Cancel::new();
        let recorder = Recorder::new();
        let announcer = Announcer::start(recorder.announce_fn(Duration::from_millis(10)), 16, &cancel);
        announcer.add("first", NodeId::random());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        // The loop now sleeps ~20 min for "first"; a new key must not wait.
        announcer.add("second", NodeId::random());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        cancel.fire();
    }
}
