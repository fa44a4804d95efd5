//! Microsecond-resolution timestamps for packet accounting.
//!
//! Traffic threads stamp every record with wall-clock time so the
//! receiving side can compute one-way transit against the sender's
//! clock. Subtraction yields fractional seconds as `f64`, which is what
//! all the interval arithmetic in the reporter works in.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MILLION: i64 = 1_000_000;

/// A wall-clock instant split into seconds and microseconds.
///
/// # Examples
///
/// ```
/// use rperf2::timing::Timestamp;
///
/// let t0 = Timestamp::from_parts(100, 250_000);
/// let t1 = Timestamp::from_parts(101, 750_000);
/// assert!((t1.subtract(t0) - 1.5).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub usecs: i32,
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            secs: elapsed.as_secs() as i64,
            usecs: elapsed.subsec_micros() as i32,
        }
    }

    pub fn from_parts(secs: i64, usecs: i32) -> Self {
        Self { secs, usecs }
    }

    /// Total microseconds since the epoch.
    pub fn as_micros(&self) -> i64 {
        self.secs * MILLION + self.usecs as i64
    }

    pub fn from_micros(us: i64) -> Self {
        Self {
            secs: us.div_euclid(MILLION),
            usecs: us.rem_euclid(MILLION) as i32,
        }
    }

    /// `self - other` in fractional seconds. Negative when `other` is later.
    pub fn subtract(&self, other: Timestamp) -> f64 {
        (self.secs - other.secs) as f64 + (self.usecs - other.usecs) as f64 / MILLION as f64
    }

    /// Increment-add of a duration, carrying microsecond overflow.
    pub fn add(&self, d: Duration) -> Timestamp {
        let mut secs = self.secs + d.as_secs() as i64;
        let mut usecs = self.usecs + d.subsec_micros() as i32;
        if usecs >= MILLION as i32 {
            usecs -= MILLION as i32;
            secs += 1;
        }
        Timestamp { secs, usecs }
    }

    /// Add fractional seconds; used to advance interval boundaries.
    pub fn add_secs(&self, secs: f64) -> Timestamp {
        Timestamp::from_micros(self.as_micros() + (secs * MILLION as f64).round() as i64)
    }

    /// True once `self` has reached or passed `boundary`.
    pub fn reached(&self, boundary: Timestamp) -> bool {
        self.as_micros() >= boundary.as_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract_carries_usecs() {
        let t0 = Timestamp::from_parts(10, 900_000);
        let t1 = Timestamp::from_parts(11, 100_000);
        assert!((t1.subtract(t0) - 0.2).abs() < 1e-9);
        assert!((t0.subtract(t1) + 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_add_duration_wraps() {
        let t = Timestamp::from_parts(5, 800_000);
        let t2 = t.add(Duration::from_micros(300_000));
        assert_eq!(t2.secs, 6);
        assert_eq!(t2.usecs, 100_000);
    }

    #[test]
    fn test_add_secs_fractional() {
        let t = Timestamp::from_parts(0, 0);
        let t2 = t.add_secs(2.5);
        assert_eq!(t2.secs, 2);
        assert_eq!(t2.usecs, 500_000);
    }

    #[test]
    fn test_micros_roundtrip() {
        let t = Timestamp::from_parts(123, 456_789);
        assert_eq!(Timestamp::from_micros(t.as_micros()), t);
    }

    #[test]
    fn test_reached_boundary() {
        let t = Timestamp::from_parts(10, 0);
        assert!(t.reached(Timestamp::from_parts(9, 999_999)));
        assert!(t.reached(t));
        assert!(!t.reached(Timestamp::from_parts(10, 1)));
    }
}
