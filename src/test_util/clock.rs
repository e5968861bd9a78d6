use std::time::Duration;

use crate::session::message_id::WallClock;
use crate::util::atomic_box::AtomicBox;

/// A wall clock that only moves when told to
pub struct ManualClock {
    now: AtomicBox<Duration>,
}

impl ManualClock {
    pub fn new(now: Duration) -> ManualClock {
        ManualClock {
            now: AtomicBox::new(now),
        }
    }

    pub fn set(&self, now: Duration) {
        self.now.swap(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.modify(|now| *now += by);
    }
}

impl WallClock for ManualClock {
    fn unix_time(&self) -> Duration {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Duration::from_secs(10));
        assert_eq!(clock.unix_time(), Duration::from_secs(10));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.unix_time(), Duration::from_millis(11_500));

        clock.set(Duration::from_secs(3));
        assert_eq!(clock.unix_time(), Duration::from_secs(3));
    }
}
