use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Current wall-clock time, truncated to the millisecond precision the store keeps
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now)
}

/// `at + delay`, saturating at the largest representable instant
pub(crate) fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    TimeDelta::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Time left until `at`, zero when it has already passed
pub(crate) fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_saturates_instead_of_overflowing() {
        let start = now();
        assert_eq!(after(start, Duration::from_secs(5)) - start, TimeDelta::seconds(5));
        assert_eq!(after(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn until_is_zero_for_past_instants() {
        let start = now();
        assert_eq!(until(start, after(start, Duration::from_secs(1))), Duration::ZERO);
        assert_eq!(until(after(start, Duration::from_millis(250)), start), Duration::from_millis(250));
    }
}
