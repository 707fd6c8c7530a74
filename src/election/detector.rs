use log::debug;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

use crate::timeouts;

/// The leader-failure detector: one cooperative timer per replica, enabled
/// only while the replica is a voter and not the leader. Appends accepted
/// from the leader, votes granted, and pre-election backoff all snooze it.
/// Expiry is single-flight: `poll` reports it once, and the timer stays
/// quiet until the resulting election task calls `rearm`.
///
/// Deadlines are explicit wall-clock state; nothing here sleeps.
#[derive(Debug)]
pub struct FailureDetector {
    window: (Duration, Duration),
    rng: ChaCha20Rng,
    enabled: bool,
    deadline: Option<Instant>,
    expiry_in_flight: bool,
}

impl FailureDetector {
    pub fn new(seed: u64) -> Self {
        Self::with_window(
            timeouts::ELECTION_TIMEOUT_MIN,
            timeouts::ELECTION_TIMEOUT_MAX,
            seed,
        )
    }

    pub fn with_window(min: Duration, max: Duration, seed: u64) -> Self {
        assert!(max >= min);
        Self {
            window: (min, max),
            rng: ChaCha20Rng::seed_from_u64(seed),
            enabled: false,
            deadline: None,
            expiry_in_flight: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self, now: Instant) {
        if !self.enabled {
            debug!("event=failure_detector_enabled");
        }
        self.enabled = true;
        self.expiry_in_flight = false;
        self.deadline = Some(now + self.random_timeout(None));
    }

    pub fn disable(&mut self) {
        if self.enabled {
            debug!("event=failure_detector_disabled");
        }
        self.enabled = false;
        self.deadline = None;
        self.expiry_in_flight = false;
    }

    /// Pushes the deadline out by a fresh randomized timeout, at least
    /// `min_extra` when given. No-op while disabled.
    pub fn snooze(&mut self, now: Instant, min_extra: Option<Duration>) {
        if !self.enabled {
            return;
        }
        self.deadline = Some(now + self.random_timeout(min_extra));
    }

    /// True exactly once per expiry: the caller owns submitting the
    /// election task and must call [`FailureDetector::rearm`] when it
    /// completes.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.enabled || self.expiry_in_flight {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.expiry_in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Completes a single-flight expiry and arms a fresh deadline.
    pub fn rearm(&mut self, now: Instant) {
        self.expiry_in_flight = false;
        if self.enabled {
            self.deadline = Some(now + self.random_timeout(None));
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn random_timeout(&mut self, min_extra: Option<Duration>) -> Duration {
        let (min, max) = self.window;
        let jitter = if max == min {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..=(max - min).as_millis() as u64))
        };
        let timeout = min + jitter;
        match min_extra {
            Some(extra) => timeout.max(extra),
            None => timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FailureDetector {
        FailureDetector::with_window(
            Duration::from_millis(100),
            Duration::from_millis(200),
            42,
        )
    }

    #[test]
    fn disabled_detector_never_fires() {
        let mut detector = detector();
        let now = Instant::now();
        assert!(!detector.poll(now + Duration::from_secs(60)));
    }

    #[test]
    fn fires_once_after_deadline_until_rearmed() {
        let mut detector = detector();
        let now = Instant::now();
        detector.enable(now);
        assert!(!detector.poll(now));

        let later = now + Duration::from_millis(250);
        assert!(detector.poll(later));
        // Single flight: no stacking while the election task runs.
        assert!(!detector.poll(later + Duration::from_millis(250)));

        detector.rearm(later);
        assert!(!detector.poll(later));
        assert!(detector.poll(later + Duration::from_millis(250)));
    }

    #[test]
    fn snooze_pushes_deadline_out() {
        let mut detector = detector();
        let now = Instant::now();
        detector.enable(now);
        let before = detector.deadline().unwrap();
        let heartbeat = now + Duration::from_millis(90);
        detector.snooze(heartbeat, None);
        assert!(detector.deadline().unwrap() >= before);
        assert!(!detector.poll(now + Duration::from_millis(150)));
    }

    #[test]
    fn snooze_honors_minimum_extra_delay() {
        let mut detector = detector();
        let now = Instant::now();
        detector.enable(now);
        detector.snooze(now, Some(Duration::from_secs(5)));
        assert!(!detector.poll(now + Duration::from_secs(4)));
        assert!(detector.poll(now + Duration::from_secs(6)));
    }

    #[test]
    fn disable_clears_pending_expiry() {
        let mut detector = detector();
        let now = Instant::now();
        detector.enable(now);
        assert!(detector.poll(now + Duration::from_secs(1)));
        detector.disable();
        detector.enable(now + Duration::from_secs(1));
        assert!(!detector.poll(now + Duration::from_secs(1)));
    }

    #[test]
    fn timeouts_stay_within_window() {
        let mut detector = detector();
        let now = Instant::now();
        for _ in 0..32 {
            detector.enable(now);
            let deadline = detector.deadline().unwrap();
            let timeout = deadline - now;
            assert!(timeout >= Duration::from_millis(100));
            assert!(timeout <= Duration::from_millis(200));
        }
    }
}
