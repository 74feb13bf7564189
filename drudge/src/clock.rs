use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{Error, Result};

/// A clock anchored to a [tokio::time::Instant] so that tests which pause
/// tokio's clock see consistent timestamps.
#[derive(Clone)]
pub(crate) struct Time {
    start_instant: Instant,
    start_time: OffsetDateTime,
}

impl Time {
    pub fn new() -> Self {
        Time {
            start_instant: Instant::now(),
            start_time: OffsetDateTime::now_utc(),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.start_time + self.start_instant.elapsed()
    }
}

pub(crate) fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_ms(ms: i64, field: &'static str) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|_| Error::TimestampOutOfRange(field))
}

pub(crate) fn opt_from_ms(ms: Option<i64>, field: &'static str) -> Result<Option<OffsetDateTime>> {
    ms.map(|ms| from_ms(ms, field)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_roundtrip() {
        let now = OffsetDateTime::now_utc();
        let ms = to_ms(now);
        let back = from_ms(ms, "now").unwrap();
        assert_eq!(to_ms(back), ms);
    }

    #[test]
    fn out_of_range_timestamp() {
        let result = from_ms(i64::MAX, "run_at");
        assert!(matches!(result, Err(Error::TimestampOutOfRange("run_at"))));
    }

    #[tokio::test]
    async fn now_tracks_elapsed_time() {
        let time = Time::new();
        let first = time.now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(time.now() > first);
    }
}
