//! Deadline arithmetic for bounded waits.

use std::time::{Duration, Instant};

/// Time left until `deadline` as seen at `now`; zero once it has passed.
pub fn remaining_until(deadline: Instant, now: Instant) -> Duration {
    deadline
        .checked_duration_since(now)
        .unwrap_or(Duration::ZERO)
}

/// Length of the next sleep: the poll interval, clamped to the remaining budget.
pub fn next_sleep(interval: Duration, deadline: Instant, now: Instant) -> Duration {
    interval.min(remaining_until(deadline, now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_saturates_at_zero() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(5);
        assert_eq!(remaining_until(deadline, now), Duration::from_secs(5));
        assert_eq!(
            remaining_until(deadline, now + Duration::from_secs(9)),
            Duration::ZERO
        );
    }

    #[test]
    fn sleep_is_clamped_to_deadline() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);
        assert_eq!(
            next_sleep(Duration::from_secs(30), deadline, now),
            Duration::from_secs(10)
        );
        assert_eq!(
            next_sleep(Duration::from_secs(3), deadline, now),
            Duration::from_secs(3)
        );
    }
}
