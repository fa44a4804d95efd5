//! Per-flow statistics accumulators.
//!
//! Each accumulator keeps a current-interval view alongside a cumulative
//! ("total") view. Interval views are cleared at every reporting boundary;
//! cumulative views roll forward until the final report.

use serde::{Deserialize, Serialize};

/// Running one-way transit (latency) statistics.
///
/// Mean and variance are maintained incrementally in the Welford form:
/// m² accumulates Σ(x−µ)² and variance is derived as m²/(n−1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub cnt: u64,
    pub mean: f64,
    pub m2: f64,
    pub last: f64,

    pub tot_min: f64,
    pub tot_max: f64,
    pub tot_sum: f64,
    pub tot_cnt: u64,
    pub tot_mean: f64,
    pub tot_m2: f64,
}

impl Default for TransitStats {
    fn default() -> Self {
        Self {
            min: f64::MAX,
            max: f64::MIN,
            sum: 0.0,
            cnt: 0,
            mean: 0.0,
            m2: 0.0,
            last: 0.0,
            tot_min: f64::MAX,
            tot_max: f64::MIN,
            tot_sum: 0.0,
            tot_cnt: 0,
            tot_mean: 0.0,
            tot_m2: 0.0,
        }
    }
}

impl TransitStats {
    /// Fold one transit sample into both windows.
    pub fn update(&mut self, transit: f64) {
        self.last = transit;

        self.cnt += 1;
        self.sum += transit;
        if transit < self.min {
            self.min = transit;
        }
        if transit > self.max {
            self.max = transit;
        }
        let delta = transit - self.mean;
        self.mean += delta / self.cnt as f64;
        self.m2 += delta * (transit - self.mean);

        self.tot_cnt += 1;
        self.tot_sum += transit;
        if transit < self.tot_min {
            self.tot_min = transit;
        }
        if transit > self.tot_max {
            self.tot_max = transit;
        }
        let delta = transit - self.tot_mean;
        self.tot_mean += delta / self.tot_cnt as f64;
        self.tot_m2 += delta * (transit - self.tot_mean);
    }

    /// Sample variance of the interval window, m²/(n−1).
    pub fn variance(&self) -> f64 {
        if self.cnt > 1 {
            self.m2 / (self.cnt - 1) as f64
        } else {
            0.0
        }
    }

    pub fn tot_variance(&self) -> f64 {
        if self.tot_cnt > 1 {
            self.tot_m2 / (self.tot_cnt - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Reset the interval window; the cumulative window is untouched.
    pub fn clear_interval(&mut self) {
        self.min = f64::MAX;
        self.max = f64::MIN;
        self.sum = 0.0;
        self.cnt = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }
}

pub const READ_BIN_COUNT: usize = 8;

/// Counts of successful reads, binned by read size.
///
/// Bin width is buffer_len / 8 so the enhanced report can show how the
/// kernel is coalescing reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStats {
    pub cnt: u64,
    pub tot_cnt: u64,
    pub bins: [u64; READ_BIN_COUNT],
    pub tot_bins: [u64; READ_BIN_COUNT],
    pub bin_size: usize,
}

impl Default for ReadStats {
    fn default() -> Self {
        Self {
            cnt: 0,
            tot_cnt: 0,
            bins: [0; READ_BIN_COUNT],
            tot_bins: [0; READ_BIN_COUNT],
            bin_size: 1,
        }
    }
}

impl ReadStats {
    pub fn new(buffer_len: usize) -> Self {
        Self {
            bin_size: (buffer_len / READ_BIN_COUNT).max(1),
            ..Default::default()
        }
    }

    pub fn account(&mut self, read_len: usize) {
        self.cnt += 1;
        self.tot_cnt += 1;
        let bin = (read_len / self.bin_size).min(READ_BIN_COUNT - 1);
        self.bins[bin] += 1;
        self.tot_bins[bin] += 1;
    }

    pub fn clear_interval(&mut self) {
        self.cnt = 0;
        self.bins = [0; READ_BIN_COUNT];
    }
}

/// Counts of write calls, write errors and TCP path state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStats {
    pub cnt: u64,
    pub err: u64,
    pub tcp_retry: u64,
    pub tot_cnt: u64,
    pub tot_err: u64,
    pub tot_tcp_retry: u64,
    /// Retransmit total at the last interval boundary.
    pub last_tcp_retry: u64,
    /// Congestion window, bytes.
    pub cwnd: u64,
    /// Smoothed RTT, microseconds.
    pub rtt: u64,
    pub mean_rtt: f64,
    pub up_to_date: bool,
}

impl WriteStats {
    pub fn account(&mut self) {
        self.cnt += 1;
        self.tot_cnt += 1;
    }

    pub fn account_error(&mut self) {
        self.err += 1;
        self.tot_err += 1;
    }

    /// Refresh retransmit counters from a cumulative kernel total.
    pub fn update_tcp_info(&mut self, total_retrans: u64, cwnd: u64, rtt: u64) {
        self.tcp_retry = total_retrans.saturating_sub(self.last_tcp_retry);
        self.tot_tcp_retry = total_retrans;
        self.cwnd = cwnd;
        let delta = rtt as f64 - self.mean_rtt;
        self.mean_rtt += delta / 8.0;
        self.rtt = rtt;
        self.up_to_date = true;
    }

    pub fn clear_interval(&mut self) {
        self.cnt = 0;
        self.err = 0;
        self.last_tcp_retry = self.tot_tcp_retry;
        self.tcp_retry = 0;
    }
}

/// Read-or-write accumulator, discriminated by traffic direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SockCallStats {
    Read(ReadStats),
    Write(WriteStats),
}

impl SockCallStats {
    pub fn clear_interval(&mut self) {
        match self {
            SockCallStats::Read(r) => r.clear_interval(),
            SockCallStats::Write(w) => w.clear_interval(),
        }
    }

    pub fn as_read_mut(&mut self) -> Option<&mut ReadStats> {
        match self {
            SockCallStats::Read(r) => Some(r),
            SockCallStats::Write(_) => None,
        }
    }

    pub fn as_write_mut(&mut self) -> Option<&mut WriteStats> {
        match self {
            SockCallStats::Write(w) => Some(w),
            SockCallStats::Read(_) => None,
        }
    }
}

/// Layer-2 frame validation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L2Stats {
    pub cnt: u64,
    pub unknown: u64,
    pub udp_csum_err: u64,
    pub length_err: u64,
    pub tot_cnt: u64,
    pub tot_unknown: u64,
    pub tot_udp_csum_err: u64,
    pub tot_length_err: u64,
}

impl L2Stats {
    pub fn clear_interval(&mut self) {
        self.cnt = 0;
        self.unknown = 0;
        self.udp_csum_err = 0;
        self.length_err = 0;
    }
}

/// Isochronous frame accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsochStats {
    pub fps: u32,
    /// Variable-bit-rate source mean, bits/sec.
    pub mean: f64,
    pub variance: f64,
    pub frame_cnt: u64,
    pub frame_lost_cnt: u64,
    /// Frames whose transmission slipped past their burst period.
    pub slip_cnt: u64,
    pub tot_frame_cnt: u64,
    pub tot_frame_lost_cnt: u64,
    pub tot_slip_cnt: u64,
    pub frame_id: i64,
}

impl IsochStats {
    pub fn clear_interval(&mut self) {
        self.frame_cnt = 0;
        self.frame_lost_cnt = 0;
        self.slip_cnt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_variance(samples: &[f64]) -> f64 {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
    }

    #[test]
    fn test_welford_matches_batch_variance() {
        let samples = [0.00112, 0.00089, 0.00231, 0.00075, 0.00198, 0.00154];
        let mut t = TransitStats::default();
        for s in samples {
            t.update(s);
        }
        let expected = batch_variance(&samples);
        assert!((t.variance() - expected).abs() < 1e-15 * samples.len() as f64);
        assert!((t.tot_variance() - expected).abs() < 1e-15 * samples.len() as f64);
    }

    #[test]
    fn test_transit_extrema_and_mean() {
        let mut t = TransitStats::default();
        t.update(0.002);
        t.update(0.004);
        t.update(0.003);
        assert_eq!(t.min, 0.002);
        assert_eq!(t.max, 0.004);
        assert!((t.mean - 0.003).abs() < 1e-12);
        assert_eq!(t.cnt, 3);
    }

    #[test]
    fn test_clear_interval_keeps_cumulative() {
        let mut t = TransitStats::default();
        t.update(0.001);
        t.update(0.005);
        t.clear_interval();
        assert_eq!(t.cnt, 0);
        assert_eq!(t.tot_cnt, 2);
        assert_eq!(t.tot_max, 0.005);
        t.update(0.010);
        assert_eq!(t.max, 0.010);
        assert_eq!(t.tot_cnt, 3);
    }

    #[test]
    fn test_read_bins() {
        let mut r = ReadStats::new(8000);
        r.account(500); // bin 0
        r.account(4500); // bin 4
        r.account(1_000_000); // clamps to last bin
        assert_eq!(r.cnt, 3);
        assert_eq!(r.bins[0], 1);
        assert_eq!(r.bins[4], 1);
        assert_eq!(r.bins[READ_BIN_COUNT - 1], 1);
        r.clear_interval();
        assert_eq!(r.cnt, 0);
        assert_eq!(r.tot_cnt, 3);
    }

    #[test]
    fn test_write_retry_baseline() {
        let mut w = WriteStats::default();
        w.update_tcp_info(10, 1000, 200);
        assert_eq!(w.tcp_retry, 10);
        w.clear_interval();
        assert_eq!(w.last_tcp_retry, 10);
        w.update_tcp_info(13, 1100, 190);
        assert_eq!(w.tcp_retry, 3);
        assert_eq!(w.tot_tcp_retry, 13);
    }
}
