//! Isochronous traffic model.
//!
//! A sender in isochronous mode emits one burst (frame) per 1/fps slot.
//! Frame sizes model a variable-bit-rate source: drawn from a normal
//! distribution with the configured mean and variance, floored so every
//! frame carries at least one datagram.

use crate::config::IsochConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// One frame the sender must emit in the current slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// 1-based frame id; also the slot index since the epoch.
    pub id: i64,
    /// Bytes to send in this frame.
    pub bytes: u64,
    /// Whether the previous slot overran into this one.
    pub slipped: bool,
}

pub struct IsochPacer {
    cfg: IsochConfig,
    /// Nominal bytes per frame at the mean rate.
    mean_frame_bytes: f64,
    stddev_frame_bytes: f64,
    burst_period: Duration,
    epoch: Instant,
    frame_id: i64,
    rng: StdRng,
}

impl IsochPacer {
    pub fn new(cfg: IsochConfig) -> Self {
        let fps = cfg.frames_per_sec.max(1);
        let mean_frame_bytes = cfg.mean_bps as f64 / 8.0 / fps as f64;
        let stddev_frame_bytes = (cfg.variance as f64).sqrt() / 8.0 / fps as f64;
        Self {
            cfg,
            mean_frame_bytes,
            stddev_frame_bytes,
            burst_period: Duration::from_secs_f64(1.0 / fps as f64),
            epoch: Instant::now(),
            frame_id: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn burst_period(&self) -> Duration {
        self.burst_period
    }

    pub fn frames_per_sec(&self) -> u32 {
        self.cfg.frames_per_sec
    }

    /// One standard normal variate, Box-Muller form.
    fn normal(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Sample the next frame size, floored at `min_bytes`.
    fn next_frame_bytes(&mut self, min_bytes: u64) -> u64 {
        let size = if self.stddev_frame_bytes > 0.0 {
            self.mean_frame_bytes + self.normal() * self.stddev_frame_bytes
        } else {
            self.mean_frame_bytes
        };
        (size.round() as i64).max(min_bytes as i64) as u64
    }

    /// Sleep until the next frame slot and return its spec. A slot whose
    /// deadline already passed is not skipped; the frame is late and
    /// marked slipped.
    pub fn next_frame(&mut self, min_bytes: u64) -> FrameSpec {
        self.frame_id += 1;
        let deadline = self.epoch + self.burst_period.mul_f64((self.frame_id - 1) as f64);
        let now = Instant::now();
        let slipped = if now < deadline {
            std::thread::sleep(deadline - now);
            false
        } else {
            self.frame_id > 1 && now.duration_since(deadline) > self.burst_period
        };
        FrameSpec {
            id: self.frame_id,
            bytes: self.next_frame_bytes(min_bytes),
            slipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(fps: u32, mean_bps: u64, variance: u64) -> IsochConfig {
        IsochConfig {
            frames_per_sec: fps,
            mean_bps,
            variance,
        }
    }

    #[test]
    fn test_constant_rate_frame_size() {
        // 1 Mbit at 60 fps with zero variance: every frame is the same.
        let mut pacer = IsochPacer::new(cfg(60, 1_048_576, 0));
        let expected = (1_048_576.0 / 8.0 / 60.0f64).round() as u64;
        for _ in 0..5 {
            assert_eq!(pacer.next_frame_bytes(1), expected);
        }
    }

    #[test]
    fn test_frame_size_floor() {
        let mut pacer = IsochPacer::new(cfg(1000, 8, 0));
        // Mean works out below one datagram; the floor wins.
        assert_eq!(pacer.next_frame_bytes(1470), 1470);
    }

    #[test]
    fn test_vbr_sampling_centers_on_mean() {
        let mut pacer = IsochPacer::new(cfg(60, 1_048_576, 64_000_000));
        let n = 2000;
        let sum: f64 = (0..n).map(|_| pacer.next_frame_bytes(1) as f64).sum();
        let observed_mean = sum / n as f64;
        let expected = 1_048_576.0 / 8.0 / 60.0;
        assert!(
            (observed_mean - expected).abs() < expected * 0.05,
            "observed {observed_mean}, expected {expected}"
        );
    }

    #[test]
    fn test_pacing_holds_frame_rate() {
        let mut pacer = IsochPacer::new(cfg(100, 1_000_000, 0));
        let start = Instant::now();
        let mut last_id = 0;
        for _ in 0..10 {
            let frame = pacer.next_frame(1);
            assert_eq!(frame.id, last_id + 1);
            last_id = frame.id;
        }
        // Ten 10ms slots; the first fires immediately.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "ran in {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }
}
