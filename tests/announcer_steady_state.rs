//! Announcer steady state
//!
//! One hundred entries added at t=0: within 25 minutes every entry has a
//! successful announce, never more than the configured number run at once,
//! and no entry is re-announced before its 20-minute cadence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachecraft_cache::{AnnounceFn, Announcer};
use cachecraft_core::Cancel;
use cachecraft_dht::NodeId;
use tokio::time::Instant;

struct Tracker {
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    announce_times: Mutex<HashMap<NodeId, Vec<Instant>>>,
}

impl Tracker {
    fn announce_fn(self: &Arc<Self>, delay: Duration) -> AnnounceFn {
        let this = self.clone();
        Arc::new(move |infohash, cancel| {
            let this = this.clone();
            Box::pin(async move {
                let now = this.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_concurrent.fetch_max(now, Ordering::SeqCst);
                this.announce_times
                    .lock()
                    .unwrap()
                    .entry(infohash)
                    .or_default()
                    .push(Instant::now());
                let slept = cancel.sleep(delay).await;
                this.concurrent.fetch_sub(1, Ordering::SeqCst);
                slept
            })
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_hundred_entries_steady_state() {
    let cancel = Cancel::new();
    let tracker = Arc::new(Tracker {
        concurrent: AtomicUsize::new(0),
        max_concurrent: AtomicUsize::new(0),
        announce_times: Mutex::new(HashMap::new()),
    });
    // Each announce takes 2 s of (virtual) time.
    let announcer = Announcer::start(tracker.announce_fn(Duration::from_secs(2)), 16, &cancel);

    let infohashes: Vec<NodeId> = (0..100).map(|_| NodeId::random()).collect();
    for (i, infohash) in infohashes.iter().enumerate() {
        announcer.add(format!("group-{i}"), *infohash);
    }

    tokio::time::sleep(Duration::from_secs(25 * 60)).await;

    let times = tracker.announce_times.lock().unwrap();
    assert_eq!(times.len(), 100, "every entry must have been announced");
    for (infohash, attempts) in times.iter() {
        assert!(!attempts.is_empty());
        // The cadence: successive successful announces at least 20 min
        // apart.
        for pair in attempts.windows(2) {
            assert!(
                pair[1].duration_since(pair[0]) >= Duration::from_secs(20 * 60),
                "{infohash} re-announced too early"
            );
        }
    }
    assert!(
        tracker.max_concurrent.load(Ordering::SeqCst) <= 16,
        "announce concurrency exceeded the semaphore"
    );
    cancel.fire();
}

#[tokio::test(start_paused = true)]
async fn test_entries_added_later_do_not_wait_for_cadence() {
    let cancel = Cancel::new();
    let tracker = Arc::new(Tracker {
        concurrent: AtomicUsize::new(0),
        max_concurrent: AtomicUsize::new(0),
        announce_times: Mutex::new(HashMap::new()),
    });
    let announcer = Announcer::start(tracker.announce_fn(Duration::from_millis(100)), 16, &cancel);

    let first = NodeId::random();
    announcer.add("early", first);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // The loop is now parked on the early entry's 20-minute timer.
    let second = NodeId::random();
    announcer.add("late", second);
    tokio::time::sleep(Duration::from_secs(10)).await;

    let times = tracker.announce_times.lock().unwrap();
    assert_eq!(times.get(&first).map(Vec::len), Some(1));
    assert_eq!(times.get(&second).map(Vec::len), Some(1), "new entry must not wait");
    cancel.fire();
}
