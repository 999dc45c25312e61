use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-caller submission budget, consulted before any outbound call.
///
/// `check_and_increment` must be atomic: two concurrent callers on the same
/// key can never both take the last slot.
pub trait SubmissionCounter: Send + Sync {
    fn check_and_increment(&self, key: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl SubmissionCounter for Unlimited {
    fn check_and_increment(&self, _key: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowUsage {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct FixedWindowCounter {
    threshold: u32,
    window: Duration,
    usage: Mutex<HashMap<String, WindowUsage>>,
}

impl FixedWindowCounter {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window: window.max(Duration::from_millis(1)),
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check_and_increment_at(&self, key: &str, now: Instant) -> bool {
        let mut usage = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = self.window;
        // Expired windows for other callers are dead weight.
        usage.retain(|_, entry| now.saturating_duration_since(entry.started) < window);

        let entry = usage.entry(key.to_string()).or_insert(WindowUsage {
            started: now,
            count: 0,
        });
        if entry.count >= self.threshold {
            return false;
        }
        entry.count += 1;
        true
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        match self.usage.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl SubmissionCounter for FixedWindowCounter {
    fn check_and_increment(&self, key: &str) -> bool {
        self.check_and_increment_at(key, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{FixedWindowCounter, SubmissionCounter, Unlimited};

    #[test]
    fn threshold_applies_per_key_within_window() {
        let counter = FixedWindowCounter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(counter.check_and_increment_at("alice", now));
        assert!(counter.check_and_increment_at("alice", now));
        assert!(!counter.check_and_increment_at("alice", now));
        assert!(counter.check_and_increment_at("bob", now));
    }

    #[test]
    fn window_rollover_restores_budget_and_drops_stale_keys() {
        let counter = FixedWindowCounter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(counter.check_and_increment_at("alice", start));
        assert!(counter.check_and_increment_at("bob", start));
        assert!(!counter.check_and_increment_at("alice", start + Duration::from_secs(9)));

        let later = start + Duration::from_secs(11);
        assert!(counter.check_and_increment_at("alice", later));
        assert_eq!(counter.tracked_keys(), 1);
    }

    #[test]
    fn zero_threshold_denies_everything() {
        let counter = FixedWindowCounter::new(0, Duration::from_secs(1));
        assert!(!counter.check_and_increment("alice"));
    }

    #[test]
    fn concurrent_callers_never_exceed_threshold() {
        let counter = Arc::new(FixedWindowCounter::new(25, Duration::from_secs(60)));
        let granted = Arc::new(AtomicU32::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    for _ in 0..10 {
                        if counter.check_and_increment("shared") {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }
        assert_eq!(granted.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn unlimited_always_grants() {
        let counter = Unlimited;
        assert!((0..1000).all(|_| counter.check_and_increment("any")));
    }
}
