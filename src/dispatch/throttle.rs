//! Server-wide request throttling over fixed one-second windows.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    admitted: u32,
}

/// Admits at most `max_per_second` commands per window; `0` admits all.
#[derive(Debug)]
pub struct Throttle {
    max_per_second: u32,
    window: Mutex<Window>,
}

impl Throttle {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            window: Mutex::new(Window {
                started: Instant::now(),
                admitted: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_per_second > 0
    }

    /// Count one command against the current window.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    fn admit_at(&self, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut window = self.window.lock();
        if now.saturating_duration_since(window.started) >= WINDOW {
            window.started = now;
            window.admitted = 0;
        }
        if window.admitted < self.max_per_second {
            window.admitted += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_admits_everything() {
        let throttle = Throttle::new(0);
        assert!((0..10_000).all(|_| throttle.admit()));
    }

    #[test]
    fn test_window_budget() {
        let throttle = Throttle::new(3);
        let start = Instant::now();

        assert!(throttle.admit_at(start));
        assert!(throttle.admit_at(start));
        assert!(throttle.admit_at(start + Duration::from_millis(500)));
        assert!(!throttle.admit_at(start + Duration::from_millis(900)));

        // A new window opens a second after the previous one started.
        assert!(throttle.admit_at(start + Duration::from_millis(1500)));
    }
}
