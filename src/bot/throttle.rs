use std::time::{Duration, Instant};

use dashmap::DashMap;

const PRUNE_THRESHOLD: usize = 1024;
const PRUNE_MAX_AGE: Duration = Duration::from_secs(60);

/// Per-user flood guard: at most one message per `min_interval`, extras
/// dropped silently. Stale entries are pruned once the map grows.
pub struct Throttle {
    last_seen: DashMap<i64, Instant>,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            min_interval,
        }
    }

    pub fn allow(&self, user_id: i64) -> bool {
        let now = Instant::now();
        let mut allowed = false;
        // The entry API keeps check-and-set atomic per key.
        self.last_seen
            .entry(user_id)
            .and_modify(|last| {
                if now.duration_since(*last) >= self.min_interval {
                    *last = now;
                    allowed = true;
                }
            })
            .or_insert_with(|| {
                allowed = true;
                now
            });

        if self.last_seen.len() > PRUNE_THRESHOLD {
            self.last_seen
                .retain(|_, last| now.duration_since(*last) < PRUNE_MAX_AGE);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes_second_is_dropped() {
        let throttle = Throttle::new(Duration::from_secs(1));
        assert!(throttle.allow(1));
        assert!(!throttle.allow(1));
    }

    #[test]
    fn users_are_throttled_independently() {
        let throttle = Throttle::new(Duration::from_secs(1));
        assert!(throttle.allow(1));
        assert!(throttle.allow(2));
        assert!(!throttle.allow(1));
    }

    #[test]
    fn allows_again_after_interval() {
        let throttle = Throttle::new(Duration::from_millis(10));
        assert!(throttle.allow(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(throttle.allow(1));
    }
}
