//! Wall-clock sources for bucket alignment

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of the current UTC time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Tokio deadline at which this clock will read `at`.
    ///
    /// Points in the past map to "now".
    fn deadline(&self, at: DateTime<Utc>) -> Instant {
        let wait = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + wait
    }
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with tokio's clock.
///
/// Follows `tokio::time::pause` / `advance`, so timer driven code can be
/// exercised deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + TimeDelta::from_std(self.started.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();
        let clock = TokioClock::starting_at(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(clock.now(), origin + TimeDelta::seconds(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();
        let clock = TokioClock::starting_at(origin);
        let now = Instant::now();

        let boundary = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
        assert_eq!(clock.deadline(boundary), now + Duration::from_secs(30));

        let past = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(clock.deadline(past), now);
    }
}
