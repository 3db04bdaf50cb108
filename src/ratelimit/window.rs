//! Time window bucketing.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Shortest period a limiter accepts.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);
/// Longest period a limiter accepts.
pub const MAX_PERIOD: Duration = Duration::from_secs(3600);

/// Clock field used by [`BucketStrategy::Cyclic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Second of the minute
    Second,
    /// Minute of the hour
    Minute,
    /// Hour of the day
    Hour,
}

impl Granularity {
    /// Pick the clock field for a period: sub-minute periods use seconds,
    /// sub-hour periods use minutes, and everything else uses hours.
    pub fn for_period(period: Duration) -> Self {
        if period < Duration::from_secs(60) {
            Granularity::Second
        } else if period < Duration::from_secs(3600) {
            Granularity::Minute
        } else {
            Granularity::Hour
        }
    }

    /// Get the duration of one tick of this field.
    pub fn duration(&self) -> Duration {
        match self {
            Granularity::Second => Duration::from_secs(1),
            Granularity::Minute => Duration::from_secs(60),
            Granularity::Hour => Duration::from_secs(3600),
        }
    }

    /// Current value of the field.
    fn value(&self, now: DateTime<Utc>) -> u32 {
        match self {
            Granularity::Second => now.second(),
            Granularity::Minute => now.minute(),
            Granularity::Hour => now.hour(),
        }
    }

    /// Milliseconds already elapsed within the current tick.
    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        // Leap seconds report up to 1999 sub-second millis.
        let subsec = now.timestamp_subsec_millis().min(999) as u64;
        let seconds = match self {
            Granularity::Second => 0,
            Granularity::Minute => now.second() as u64,
            Granularity::Hour => now.minute() as u64 * 60 + now.second() as u64,
        };
        seconds * 1000 + subsec
    }
}

/// How the bucket identifier of the current window is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStrategy {
    /// `floor(unix_time / period)`: monotonic, never aliases.
    #[default]
    Epoch,
    /// The clock field picked by [`Granularity::for_period`].
    ///
    /// Identifiers repeat (every minute, hour or day), so two calls far
    /// apart can share a bucket if the store entry has not expired yet.
    Cyclic,
}

impl BucketStrategy {
    /// Identifier of the window containing `now`.
    pub fn bucket_id(&self, period: Duration, now: DateTime<Utc>) -> i64 {
        match self {
            BucketStrategy::Epoch => now.timestamp_millis().div_euclid(period_ms(period)),
            BucketStrategy::Cyclic => Granularity::for_period(period).value(now) as i64,
        }
    }

    /// Time left until the window containing `now` ends.
    pub fn resets_in(&self, period: Duration, now: DateTime<Utc>) -> Duration {
        match self {
            BucketStrategy::Epoch => {
                let period_ms = period_ms(period);
                let elapsed = now.timestamp_millis().rem_euclid(period_ms);
                Duration::from_millis((period_ms - elapsed) as u64)
            }
            BucketStrategy::Cyclic => {
                let granularity = Granularity::for_period(period);
                let tick_ms = granularity.duration().as_millis() as u64;
                Duration::from_millis(tick_ms.saturating_sub(granularity.elapsed_ms(now)))
            }
        }
    }
}

impl fmt::Display for BucketStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketStrategy::Epoch => write!(f, "epoch"),
            BucketStrategy::Cyclic => write!(f, "cyclic"),
        }
    }
}

fn period_ms(period: Duration) -> i64 {
    (period.as_millis() as i64).max(1)
}

/// Source of wall-clock time for bucketing.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_granularity_for_period() {
        assert_eq!(Granularity::for_period(Duration::from_secs(1)), Granularity::Second);
        assert_eq!(Granularity::for_period(Duration::from_secs(59)), Granularity::Second);
        assert_eq!(Granularity::for_period(Duration::from_secs(60)), Granularity::Minute);
        assert_eq!(Granularity::for_period(Duration::from_secs(3599)), Granularity::Minute);
        assert_eq!(Granularity::for_period(Duration::from_secs(3600)), Granularity::Hour);
    }

    #[test]
    fn test_granularity_duration() {
        assert_eq!(Granularity::Second.duration(), Duration::from_secs(1));
        assert_eq!(Granularity::Minute.duration(), Duration::from_secs(60));
        assert_eq!(Granularity::Hour.duration(), Duration::from_secs(3600));
    }

    #[test]
    fn test_cyclic_bucket_uses_clock_field() {
        let now = at(13, 45, 30);
        let cyclic = BucketStrategy::Cyclic;

        assert_eq!(cyclic.bucket_id(Duration::from_secs(10), now), 30);
        assert_eq!(cyclic.bucket_id(Duration::from_secs(300), now), 45);
        assert_eq!(cyclic.bucket_id(Duration::from_secs(3600), now), 13);
    }

    #[test]
    fn test_cyclic_bucket_aliases_across_days() {
        let period = Duration::from_secs(3600);
        let today = at(9, 0, 0);
        let tomorrow = today + chrono::Duration::days(1);

        assert_eq!(
            BucketStrategy::Cyclic.bucket_id(period, today),
            BucketStrategy::Cyclic.bucket_id(period, tomorrow)
        );
        assert_ne!(
            BucketStrategy::Epoch.bucket_id(period, today),
            BucketStrategy::Epoch.bucket_id(period, tomorrow)
        );
    }

    #[test]
    fn test_epoch_bucket_floors_to_period() {
        let period = Duration::from_secs(60);
        let start = at(10, 0, 0);

        let first = BucketStrategy::Epoch.bucket_id(period, start);
        assert_eq!(first, start.timestamp() / 60);
        assert_eq!(BucketStrategy::Epoch.bucket_id(period, at(10, 0, 59)), first);
        assert_eq!(BucketStrategy::Epoch.bucket_id(period, at(10, 1, 0)), first + 1);
    }

    #[test]
    fn test_epoch_bucket_handles_fractional_periods() {
        let period = Duration::from_millis(1500);
        let start = Utc.timestamp_millis_opt(3_000).unwrap();

        assert_eq!(BucketStrategy::Epoch.bucket_id(period, start), 2);
        let later = Utc.timestamp_millis_opt(4_499).unwrap();
        assert_eq!(BucketStrategy::Epoch.bucket_id(period, later), 2);
        let next = Utc.timestamp_millis_opt(4_500).unwrap();
        assert_eq!(BucketStrategy::Epoch.bucket_id(period, next), 3);
    }

    #[test]
    fn test_resets_in() {
        let now = at(13, 45, 30);

        assert_eq!(
            BucketStrategy::Epoch.resets_in(Duration::from_secs(60), now),
            Duration::from_secs(30)
        );
        assert_eq!(
            BucketStrategy::Cyclic.resets_in(Duration::from_secs(10), now),
            Duration::from_secs(1)
        );
        assert_eq!(
            BucketStrategy::Cyclic.resets_in(Duration::from_secs(120), now),
            Duration::from_secs(30)
        );
        assert_eq!(
            BucketStrategy::Cyclic.resets_in(Duration::from_secs(3600), now),
            Duration::from_secs(14 * 60 + 30)
        );
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(at(0, 0, 0));
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), at(0, 1, 30));

        clock.set(at(5, 0, 0));
        assert_eq!(clock.now(), at(5, 0, 0));
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: BucketStrategy = serde_yaml::from_str("cyclic").unwrap();
        assert_eq!(strategy, BucketStrategy::Cyclic);
        assert_eq!(BucketStrategy::default(), BucketStrategy::Epoch);
        assert_eq!(BucketStrategy::Epoch.to_string(), "epoch");
    }
}
