use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, UTC.
pub type UnixNano = i64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
pub const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
pub const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Current wall-clock time in Unix nanoseconds.
pub fn now_unix_nano() -> UnixNano {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// Truncates `ts` down to a multiple of `interval`. Works for timestamps
/// before the epoch as well.
pub fn truncate(ts: UnixNano, interval: i64) -> UnixNano {
    if interval <= 0 {
        return ts;
    }
    ts - ts.rem_euclid(interval)
}

/// Rounds `ts` to the nearest multiple of `interval`, halfway values
/// rounding up.
pub fn round(ts: UnixNano, interval: i64) -> UnixNano {
    if interval <= 0 {
        return ts;
    }
    let rem = ts.rem_euclid(interval);
    if rem * 2 >= interval {
        ts - rem + interval
    } else {
        ts - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_to_window_start() {
        assert_eq!(truncate(90 * NANOS_PER_MINUTE, NANOS_PER_HOUR), NANOS_PER_HOUR);
        assert_eq!(truncate(59 * NANOS_PER_MINUTE, NANOS_PER_HOUR), 0);
        assert_eq!(truncate(-1, NANOS_PER_HOUR), -NANOS_PER_HOUR);
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(round(30 * NANOS_PER_MINUTE, NANOS_PER_HOUR), NANOS_PER_HOUR);
        assert_eq!(round(29 * NANOS_PER_MINUTE, NANOS_PER_HOUR), 0);
    }
}
