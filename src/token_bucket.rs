//! Token bucket rate limiter for the offered load (-b).
//!
//! Tokens accrue at the target rate and are consumed per write; when the
//! bucket runs dry the sender sleeps until enough tokens have accrued.
//! Integer arithmetic with a pre-computed nanoseconds-per-token factor
//! keeps the per-packet cost to a couple of additions. The same bucket
//! paces bits-per-second loads (tokens are bytes) and packets-per-second
//! loads (tokens are datagrams).

use std::time::{Duration, Instant};

/// Token bucket rate limiter for offered-load pacing.
///
/// # Examples
///
/// ```
/// use rperf2::token_bucket::TokenBucket;
///
/// // Pace a 1 Mbit/sec UDP flow of 1470-byte datagrams.
/// let mut bucket = TokenBucket::from_bits_per_sec(1_048_576);
/// bucket.consume(1470);
/// // Sleeps automatically once the burst allowance is spent.
/// ```
pub struct TokenBucket {
    /// Target tokens per second.
    pub tokens_per_sec: u64,
    /// Currently available tokens; may go negative after a large write.
    tokens: i64,
    /// Maximum burst, tokens.
    capacity: i64,
    last_refill: Instant,
    nanos_per_token: u64,
}

impl TokenBucket {
    /// Create a bucket allowing a burst of roughly 100 ms of traffic.
    ///
    /// # Arguments
    ///
    /// * `tokens_per_sec` - Target rate; zero disables pacing entirely
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::token_bucket::TokenBucket;
    ///
    /// // 1000 packets per second for a -b 1Kp flow.
    /// let bucket = TokenBucket::new(1000);
    /// assert_eq!(bucket.tokens_per_sec, 1000);
    /// ```
    pub fn new(tokens_per_sec: u64) -> Self {
        let capacity = (tokens_per_sec / 10).max(1) as i64;
        let nanos_per_token = if tokens_per_sec > 0 {
            1_000_000_000 / tokens_per_sec.max(1)
        } else {
            0
        };
        Self {
            tokens_per_sec,
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
            nanos_per_token,
        }
    }

    /// Bucket for a bits-per-second load consumed in bytes. Zero means
    /// unlimited.
    ///
    /// # Arguments
    ///
    /// * `bits_per_sec` - Offered load in bits per second
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::token_bucket::TokenBucket;
    ///
    /// // 8 Mbit/sec is one million bytes per second.
    /// let bucket = TokenBucket::from_bits_per_sec(8_000_000);
    /// assert_eq!(bucket.tokens_per_sec, 1_000_000);
    /// ```
    pub fn from_bits_per_sec(bits_per_sec: u64) -> Self {
        if bits_per_sec == 0 {
            Self::new(0)
        } else {
            Self::new((bits_per_sec / 8).max(1))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let accrued = (elapsed.as_nanos() as u64 / self.nanos_per_token.max(1)) as i64;
        if accrued > 0 {
            self.tokens = (self.tokens + accrued).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take `count` tokens, sleeping until the deficit has accrued.
    ///
    /// # Arguments
    ///
    /// * `count` - Tokens to take: bytes for bandwidth pacing, one per
    ///   datagram for packets-per-second pacing
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::token_bucket::TokenBucket;
    ///
    /// let mut bucket = TokenBucket::from_bits_per_sec(8_000_000);
    /// // Within the burst allowance this returns immediately.
    /// bucket.consume(1500);
    /// ```
    pub fn consume(&mut self, count: u64) {
        if self.tokens_per_sec == 0 {
            return;
        }
        self.refill();
        self.tokens -= count as i64;
        if self.tokens < 0 {
            let deficit = (-self.tokens) as u64;
            let sleep_nanos = deficit * self.nanos_per_token;
            if sleep_nanos > 0 {
                std::thread::sleep(Duration::from_nanos(sleep_nanos));
            }
            self.refill();
        }
    }

    /// Non-sleeping probe used by senders that prefer to poll the
    /// interrupt flag while throttled.
    ///
    /// # Arguments
    ///
    /// * `count` - Tokens the next send needs
    ///
    /// # Returns
    ///
    /// `None` when the tokens were taken and the send may proceed, or
    /// `Some(wait)` with the time until the deficit will have accrued.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::token_bucket::TokenBucket;
    ///
    /// // An unlimited bucket never asks the caller to wait.
    /// let mut bucket = TokenBucket::new(0);
    /// assert!(bucket.try_consume(1470).is_none());
    ///
    /// // A slow bucket reports how long the sender should sleep.
    /// let mut bucket = TokenBucket::new(10);
    /// assert!(bucket.try_consume(100).is_some());
    /// ```
    pub fn try_consume(&mut self, count: u64) -> Option<Duration> {
        if self.tokens_per_sec == 0 {
            return None;
        }
        self.refill();
        if self.tokens >= count as i64 {
            self.tokens -= count as i64;
            None
        } else {
            let deficit = count as i64 - self.tokens;
            Some(Duration::from_nanos(deficit as u64 * self.nanos_per_token))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_bucket_never_sleeps() {
        let mut bucket = TokenBucket::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            bucket.consume(1500);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_burst_within_capacity_is_free() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        // Capacity is 100ms of tokens = 100_000; stay under it.
        bucket.consume(50_000);
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_sustained_rate_is_enforced() {
        // 1M tokens/sec; consuming 300k beyond the 100k burst capacity
        // must take roughly 200ms.
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        for _ in 0..30 {
            bucket.consume(10_000);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "finished in {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    }

    #[test]
    fn test_try_consume_reports_wait() {
        let mut bucket = TokenBucket::new(1000);
        // Drain the burst capacity, then the next packet must wait.
        while bucket.try_consume(100).is_none() {}
        let wait = bucket.try_consume(100);
        assert!(wait.is_some());
        assert!(wait.unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_bits_per_sec_conversion() {
        let bucket = TokenBucket::from_bits_per_sec(8_000_000);
        assert_eq!(bucket.tokens_per_sec, 1_000_000);
    }
}
