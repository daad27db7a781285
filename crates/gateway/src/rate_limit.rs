use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_TRACKED_PRINCIPALS: usize = 1024;

/// Sliding-window throttle on request submissions, keyed by principal.
/// A limit of zero disables throttling.
#[derive(Clone)]
pub struct SubmissionThrottle {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    limit: u32,
}

impl SubmissionThrottle {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(Duration::from_secs(60), limit)
    }

    pub fn allow(&self, principal: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let window = self.window;
        let events = inner.entry(principal.to_string()).or_default();
        while events.front().is_some_and(|t| now.duration_since(*t) > window) {
            events.pop_front();
        }
        if events.len() >= self.limit as usize {
            return false;
        }
        events.push_back(now);

        if inner.len() > MAX_TRACKED_PRINCIPALS {
            inner.retain(|_, events| {
                events
                    .back()
                    .is_some_and(|t| now.duration_since(*t) <= window)
            });
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_never_throttles() {
        let throttle = SubmissionThrottle::per_minute(0);
        for _ in 0..100 {
            assert!(throttle.allow("ada@example.org"));
        }
    }

    #[test]
    fn submissions_beyond_the_window_budget_are_rejected() {
        let throttle = SubmissionThrottle::per_minute(2);
        assert!(throttle.allow("ada@example.org"));
        assert!(throttle.allow("ada@example.org"));
        assert!(!throttle.allow("ada@example.org"));
        // Other principals are unaffected.
        assert!(throttle.allow("grace@example.org"));
    }

    #[test]
    fn budget_refills_after_the_window() {
        let throttle = SubmissionThrottle::new(Duration::from_millis(10), 1);
        assert!(throttle.allow("k"));
        assert!(!throttle.allow("k"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(throttle.allow("k"));
    }
}
