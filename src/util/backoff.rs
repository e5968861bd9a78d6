use std::cmp::min;
use std::time::Duration;

/// Delay between reconnect attempts, growing by a factor (in eighths) up to a maximum. A
///  successful connection resets it.
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor_eighths: u32) -> Self {
        ExponentialBackoff {
            next_delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
            config_factor_eighths: factor_eighths.max(8),
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(self.next_delay * self.config_factor_eighths / 8, self.config_max_delay);
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.config_initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::initial(ms(250), ms(250), ms(30_000), 16, ms(250), ms(500))]
    #[case::later(ms(4000), ms(250), ms(30_000), 16, ms(4000), ms(8000))]
    #[case::capped(ms(20_000), ms(250), ms(30_000), 16, ms(20_000), ms(30_000))]
    #[case::at_max(ms(30_000), ms(250), ms(30_000), 16, ms(30_000), ms(30_000))]
    #[case::factor_1_5(ms(200), ms(200), ms(30_000), 12, ms(200), ms(300))]
    #[case::factor_1(ms(200), ms(200), ms(30_000), 8, ms(200), ms(200))]
    fn test_next_delay(
        #[case] next_delay: Duration,
        #[case] config_initial_delay: Duration,
        #[case] config_max_delay: Duration,
        #[case] config_factor_eighths: u32,
        #[case] expected_result: Duration,
        #[case] expected_next: Duration,
    ) {
        let mut backoff = ExponentialBackoff {
            next_delay,
            config_initial_delay,
            config_max_delay,
            config_factor_eighths,
        };

        assert_eq!(backoff.next_delay(), expected_result);
        assert_eq!(backoff.next_delay, expected_next);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(ms(250), ms(30_000), 16);
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(250));
    }

    #[test]
    fn test_factor_below_one_is_clamped() {
        let mut backoff = ExponentialBackoff::new(ms(100), ms(1000), 4);
        let _ = backoff.next_delay();
        assert_eq!(backoff.next_delay(), ms(100));
    }
}
