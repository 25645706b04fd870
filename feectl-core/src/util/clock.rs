use crate::prelude::*;
use crate::Arc;
use core::time::Duration;
use std::time::SystemTime;

/// A clock provider
///
/// In production use the [`StandardClock`] implementation
pub trait Clock: SendSync {
    /// A duration since the UNIX epoch
    fn now(&self) -> Duration;

    /// Whole seconds since the UNIX epoch
    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

/// A clock provider using the std::time::SystemTime
pub struct StandardClock();

impl SendSync for StandardClock {}

impl Clock for StandardClock {
    fn now(&self) -> Duration {
        // a system clock before the epoch is treated as the epoch
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default()
    }
}

/// A clock provider with manually updated notion of "now"
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<Duration>>);

impl SendSync for ManualClock {}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        match self.0.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl ManualClock {
    /// Create a manual clock
    pub fn new(now: Duration) -> Self {
        ManualClock(Arc::new(Mutex::new(now)))
    }

    /// Create a manual clock at the given number of seconds since the UNIX epoch
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Set the current time as duration since the UNIX epoch
    pub fn set(&self, now: Duration) {
        match self.0.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn std_test() {
        let clock = StandardClock();
        assert!(clock.now_secs() > 0);
    }

    #[test]
    fn manual_test() {
        let now1 = now();
        let clock = ManualClock::new(now1);
        let dur1 = clock.now();
        sleep(Duration::from_millis(1));
        let now2 = now();
        assert_ne!(now1, now2);
        clock.set(now2);
        let dur2 = clock.now();
        assert_ne!(dur1, dur2);
    }

    #[test]
    fn advance_test() {
        let clock = ManualClock::from_secs(1000);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_secs(), 1060);
        // clones share the same notion of now
        let other = clock.clone();
        other.advance(Duration::from_secs(1));
        assert_eq!(clock.now_secs(), 1061);
    }

    fn now() -> Duration {
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap()
    }
}
