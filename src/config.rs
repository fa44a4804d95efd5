use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Test mode: client or server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Server,
    Client,
}

/// Client test arrangement negotiated with the listener.
///
/// `DualTest` runs the reverse flow concurrently (-d), `TradeOff` runs it
/// after the forward flow completes (-r).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    Normal,
    DualTest,
    TradeOff,
}

/// Units for the offered load (-b): bits per second or packets per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateUnits {
    BitsPerSec,
    PacketsPerSec,
}

/// How much traffic to generate: a wall-clock duration, a byte count, or
/// unbounded until interrupted (-t with a non-positive value).
///
/// Infinite takes precedence over any leftover amount value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TestAmount {
    Time(Duration),
    Bytes(u64),
    Infinite,
}

/// Receive-latency histogram settings (--rx-histogram).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    /// Bin width in microseconds.
    pub bin_width_us: u64,
    pub bin_count: usize,
    /// Samples below/above these bounds (seconds) land in outlier buckets.
    pub lower_secs: f64,
    pub upper_secs: f64,
    /// Percentiles printed with the summary.
    pub ci_lower: f64,
    pub ci_upper: f64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bin_width_us: 1000,
            bin_count: 1000,
            lower_secs: 0.0,
            upper_secs: f64::MAX,
            ci_lower: 5.0,
            ci_upper: 95.0,
        }
    }
}

/// Isochronous traffic settings (--isochronous fps:mean[,variance]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsochConfig {
    pub frames_per_sec: u32,
    /// Mean offered load in bits per second.
    pub mean_bps: u64,
    /// Variance of the frame-size distribution, bits²/s².
    pub variance: u64,
}

/// Default offered load for UDP, 1 Mbit/sec.
pub const DEFAULT_UDP_RATE: u64 = 1024 * 1024;
/// UDP payload that fills exactly one IPv4 ethernet datagram.
pub const DEFAULT_UDP_BUFLEN: usize = 1470;
/// UDP payload that fills exactly one IPv6 ethernet datagram.
pub const DEFAULT_UDP_BUFLEN_V6: usize = 1450;
/// TCP default read/write size.
pub const DEFAULT_TCP_BUFLEN: usize = 128 * 1024;
pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_TEST_SECS: u64 = 10;
pub const DEFAULT_MULTICAST_TTL: u32 = 1;

/// Configuration for rperf2 tests.
///
/// One settings struct covers both roles; the traffic, reporter and
/// negotiation layers all read from snapshots of this.
///
/// # Examples
///
/// ```
/// use rperf2::{Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("10.0.0.2".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_duration(Duration::from_secs(2))
///     .with_interval(Duration::from_secs(1));
/// assert_eq!(config.effective_buffer_len(), 1470);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port number to use
    pub port: u16,

    /// Port the client asks the server to connect back to in dual tests (-L)
    pub listen_port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode, or -B on the client)
    pub bind_addr: Option<IpAddr>,

    /// Bind port parsed from -B addr:port
    pub bind_port: u16,

    /// Device name parsed from -B addr%dev
    pub bind_dev: Option<String>,

    /// How much traffic to send
    pub amount: TestAmount,

    /// Target offered load (for UDP, or TCP write pacing)
    pub rate: Option<u64>,
    pub rate_units: RateUnits,

    /// Buffer length in bytes; None means protocol default
    pub buffer_len: Option<usize>,

    /// Requested socket window size (-w), bytes
    pub window_size: Option<usize>,

    /// Number of parallel streams
    pub parallel: usize,

    /// Dual / trade-off arrangement (-d / -r)
    pub test_mode: TestMode,

    /// Reverse mode (server sends, client receives)
    pub reverse: bool,

    /// Bidirectional mode (--bidir)
    pub bidir: bool,

    /// Interval for periodic bandwidth reports; zero disables them
    pub interval: Duration,

    /// Enhanced reporting (-e): retransmits, cwnd, RTT, latency columns
    pub enhanced: bool,

    /// CSV output (-y c)
    pub csv: bool,

    /// Report output file (-o); stdout when None
    pub output_file: Option<String>,

    /// Report format character (-f): a/k/m/g/K/M/G
    pub format: char,

    /// Type-of-service byte (-S)
    pub tos: u32,

    /// Time-to-live (-T); None means system default
    pub ttl: Option<u32>,

    /// TCP maximum segment size (-M)
    pub mss: Option<u32>,

    /// TCP_NODELAY (-N)
    pub nodelay: bool,

    /// Congestion control algorithm (-Z)
    pub congestion: Option<String>,

    /// Realtime scheduling for traffic threads (-z)
    pub realtime: bool,

    /// Compatibility mode (-C): no negotiation header
    pub compat: bool,

    /// Peer version detection (-X)
    pub peer_detect: bool,

    /// Measure round-trip client-to-server write times (--trip-time)
    pub trip_time: bool,

    /// IPv6 (-V)
    pub ipv6: bool,

    /// Source-specific multicast host (-H)
    pub ssm_host: Option<String>,

    /// Receive latency histogram (--rx-histogram)
    pub rx_histogram: Option<HistogramConfig>,

    /// Isochronous traffic (--isochronous)
    pub isochronous: Option<IsochConfig>,

    /// Epoch time (seconds) at which transmission should start
    pub txstart_time: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            listen_port: 0,
            server_addr: None,
            bind_addr: None,
            bind_port: 0,
            bind_dev: None,
            amount: TestAmount::Time(Duration::from_secs(DEFAULT_TEST_SECS)),
            rate: None,
            rate_units: RateUnits::BitsPerSec,
            buffer_len: None,
            window_size: None,
            parallel: 1,
            test_mode: TestMode::Normal,
            reverse: false,
            bidir: false,
            interval: Duration::ZERO,
            enhanced: false,
            csv: false,
            output_file: None,
            format: 'a',
            tos: 0,
            ttl: None,
            mss: None,
            nodelay: false,
            congestion: None,
            realtime: false,
            compat: false,
            peer_detect: false,
            trip_time: false,
            ipv6: false,
            ssm_host: None,
            rx_histogram: None,
            isochronous: None,
            txstart_time: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for a listener on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::config::{Config, Mode};
    ///
    /// let cfg = Config::server(5001);
    /// assert_eq!(cfg.mode, Mode::Server);
    /// assert_eq!(cfg.port, 5001);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Settings for a client connecting to `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::config::{Config, Mode};
    ///
    /// let cfg = Config::client("10.0.0.2".to_string(), 5001);
    /// assert_eq!(cfg.mode, Mode::Client);
    /// assert_eq!(cfg.server_addr.as_deref(), Some("10.0.0.2"));
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.amount = TestAmount::Time(duration);
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.amount = TestAmount::Bytes(bytes);
        self
    }

    pub fn with_rate(mut self, rate: u64, units: RateUnits) -> Self {
        self.rate = Some(rate);
        self.rate_units = units;
        self
    }

    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = Some(len);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_enhanced(mut self, enhanced: bool) -> Self {
        self.enhanced = enhanced;
        self
    }

    /// Effective read/write size for the data path.
    ///
    /// # Returns
    ///
    /// The explicit `-l` value, or the protocol default: 128 KiB for
    /// TCP, 1470 bytes for UDP over IPv4, 1450 over IPv6.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Config, Protocol};
    ///
    /// let mut cfg = Config::server(5001).with_protocol(Protocol::Udp);
    /// assert_eq!(cfg.effective_buffer_len(), 1470);
    /// cfg.ipv6 = true;
    /// assert_eq!(cfg.effective_buffer_len(), 1450);
    /// ```
    pub fn effective_buffer_len(&self) -> usize {
        match self.buffer_len {
            Some(len) => len,
            None => match self.protocol {
                Protocol::Tcp => DEFAULT_TCP_BUFLEN,
                Protocol::Udp if self.ipv6 => DEFAULT_UDP_BUFLEN_V6,
                Protocol::Udp => DEFAULT_UDP_BUFLEN,
            },
        }
    }

    /// Effective offered load; UDP defaults to 1 Mbit/sec.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Config, Protocol};
    ///
    /// let cfg = Config::client("10.0.0.2".to_string(), 5001)
    ///     .with_protocol(Protocol::Udp);
    /// assert_eq!(cfg.effective_rate(), 1024 * 1024);
    /// ```
    pub fn effective_rate(&self) -> u64 {
        match self.rate {
            Some(r) => r,
            None if self.protocol == Protocol::Udp => DEFAULT_UDP_RATE,
            None => 0,
        }
    }

    pub fn is_time_mode(&self) -> bool {
        matches!(self.amount, TestAmount::Time(_) | TestAmount::Infinite)
    }

    /// Resolve compound settings after all option sources have been applied,
    /// and reject invalid combinations.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid flag combinations and
    /// [`Error::Isoch`] for unusable isochronous settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Config, Protocol};
    ///
    /// let mut cfg = Config::client("10.0.0.2".to_string(), 5001)
    ///     .with_protocol(Protocol::Udp);
    /// cfg.trip_time = true;
    /// assert!(cfg.resolve().is_err());
    /// ```
    pub fn resolve(&mut self) -> Result<()> {
        if self.mode == Mode::Client && self.server_addr.is_none() {
            return Err(Error::Config("client mode requires a server address".into()));
        }
        if self.parallel == 0 {
            return Err(Error::Config("parallel stream count must be >= 1".into()));
        }
        if self.trip_time && self.protocol == Protocol::Udp {
            return Err(Error::Config("--trip-time is not supported with UDP".into()));
        }
        if let Some(isoch) = &self.isochronous {
            if self.protocol != Protocol::Udp {
                return Err(Error::Isoch("--isochronous requires UDP (-u)".into()));
            }
            if isoch.frames_per_sec == 0 {
                return Err(Error::Isoch("frames-per-second must be >= 1".into()));
            }
        }
        if self.test_mode != TestMode::Normal && (self.reverse || self.bidir) {
            return Err(Error::Config(
                "-d/-r cannot be combined with --reverse or --bidir".into(),
            ));
        }
        // Sub-second intervals imply the enhanced report
        if !self.interval.is_zero() && self.interval < Duration::from_millis(500) {
            self.enhanced = true;
        }
        if self.rx_histogram.is_some() || self.isochronous.is_some() {
            self.enhanced = true;
        }
        Ok(())
    }

    /// Read option values from the environment. Called before command-line
    /// application so the command line wins.
    pub fn apply_environment(&mut self) {
        if std::env::var("RPERF2_SERVER").is_ok() {
            self.mode = Mode::Server;
        }
        if let Ok(host) = std::env::var("RPERF2_CLIENT") {
            self.mode = Mode::Client;
            self.server_addr = Some(host);
        }
        if std::env::var("RPERF2_UDP").is_ok() {
            self.protocol = Protocol::Udp;
        }
        if let Some(rate) = env_parse("RPERF2_BANDWIDTH", parse_rate) {
            self.rate = Some(rate.0);
            self.rate_units = rate.1;
        }
        if let Some(secs) = env_parse("RPERF2_TIME", |s| s.parse::<i64>().ok()) {
            self.amount = if secs <= 0 {
                TestAmount::Infinite
            } else {
                TestAmount::Time(Duration::from_secs(secs as u64))
            };
        }
        if let Some(bytes) = env_parse("RPERF2_NUM", parse_byte_count) {
            self.amount = TestAmount::Bytes(bytes);
        }
        if let Some(secs) = env_parse("RPERF2_INTERVAL", |s| s.parse::<f64>().ok()) {
            self.interval = Duration::from_secs_f64(secs.max(0.0));
        }
        if let Some(len) = env_parse("RPERF2_LEN", parse_byte_count) {
            self.buffer_len = Some(len as usize);
        }
        if let Some(win) = env_parse("TCP_WINDOW_SIZE", parse_byte_count) {
            self.window_size = Some(win as usize);
        }
        if let Some(port) = env_parse("RPERF2_PORT", |s| s.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(n) = env_parse("RPERF2_PARALLEL", |s| s.parse::<usize>().ok()) {
            self.parallel = n;
        }
        if let Some(ttl) = env_parse("RPERF2_TTL", |s| s.parse::<u32>().ok()) {
            self.ttl = Some(ttl);
        }
        if let Some(tos) = env_parse("RPERF2_TOS", |s| s.parse::<u32>().ok()) {
            self.tos = tos;
        }
        if let Some(fmt) = env_parse("RPERF2_FORMAT", |s| s.chars().next()) {
            self.format = fmt;
        }
        if std::env::var("RPERF2_ENHANCEDREPORTS").is_ok() {
            self.enhanced = true;
        }
        if std::env::var("RPERF2_DUALTEST").is_ok() {
            self.test_mode = TestMode::DualTest;
        }
        if std::env::var("RPERF2_TRADEOFF").is_ok() {
            self.test_mode = TestMode::TradeOff;
        }
        if std::env::var("RPERF2_IPV6_DOMAIN").is_ok() {
            self.ipv6 = true;
        }
        if let Ok(algo) = std::env::var("RPERF2_CONGESTION_CONTROL") {
            self.congestion = Some(algo);
        }
        if let Ok(bind) = std::env::var("RPERF2_BIND") {
            let _ = self.apply_bind(&bind);
        }
    }

    /// Parse `-B addr[:port][%dev]`.
    ///
    /// # Arguments
    ///
    /// * `spec` - The bind specification from the command line or
    ///   environment
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the address part is not an IP literal.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::Config;
    ///
    /// let mut cfg = Config::server(5001);
    /// cfg.apply_bind("10.0.0.1:6001%eth0").unwrap();
    /// assert_eq!(cfg.bind_port, 6001);
    /// assert_eq!(cfg.bind_dev.as_deref(), Some("eth0"));
    /// ```
    pub fn apply_bind(&mut self, spec: &str) -> Result<()> {
        let (addr_part, dev) = match spec.split_once('%') {
            Some((a, d)) => (a, Some(d.to_string())),
            None => (spec, None),
        };
        self.bind_dev = dev;
        // An IPv6 literal contains colons itself; only split off a port for
        // the host:port form.
        let (host, port) = match addr_part.rsplit_once(':') {
            Some((h, p)) if !h.contains(':') => (h, p.parse::<u16>().ok()),
            _ => (addr_part, None),
        };
        if let Some(p) = port {
            self.bind_port = p;
        }
        self.bind_addr = Some(
            host.parse::<IpAddr>()
                .map_err(|_| Error::Config(format!("invalid bind address '{host}'")))?,
        );
        Ok(())
    }
}

fn env_parse<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    std::env::var(name).ok().and_then(|v| parse(&v))
}

/// Parse a rate such as `1M`, `500k` or `100p` (packets/sec).
///
/// Suffixes follow the classic k/m/g = 1024-based multipliers; a trailing
/// `p` switches the units to packets per second.
///
/// # Examples
///
/// ```
/// use rperf2::config::{parse_rate, RateUnits};
///
/// assert_eq!(parse_rate("1M"), Some((1024 * 1024, RateUnits::BitsPerSec)));
/// assert_eq!(parse_rate("100p"), Some((100, RateUnits::PacketsPerSec)));
/// assert_eq!(parse_rate("junk"), None);
/// ```
pub fn parse_rate(spec: &str) -> Option<(u64, RateUnits)> {
    let spec = spec.trim();
    let (spec, units) = match spec.strip_suffix(['p', 'P']) {
        Some(rest) => (rest, RateUnits::PacketsPerSec),
        None => (spec, RateUnits::BitsPerSec),
    };
    parse_byte_count(spec).map(|v| (v, units))
}

/// Parse a count with an optional k/m/g (or K/M/G) multiplier suffix.
///
/// # Examples
///
/// ```
/// use rperf2::config::parse_byte_count;
///
/// assert_eq!(parse_byte_count("128K"), Some(128 * 1024));
/// assert_eq!(parse_byte_count("1470"), Some(1470));
/// assert_eq!(parse_byte_count("1.5m"), Some(1_572_864));
/// ```
pub fn parse_byte_count(spec: &str) -> Option<u64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let (digits, mult) = match spec.chars().last() {
        Some('k') | Some('K') => (&spec[..spec.len() - 1], 1024u64),
        Some('m') | Some('M') => (&spec[..spec.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&spec[..spec.len() - 1], 1024 * 1024 * 1024),
        _ => (spec, 1),
    };
    digits.trim().parse::<f64>().ok().map(|v| (v * mult as f64) as u64)
}

/// Parse `--rx-histogram binwidth[u|m],bins[,lo,hi]`.
///
/// # Arguments
///
/// * `spec` - The option value; empty keeps every default
///
/// # Examples
///
/// ```
/// use rperf2::config::parse_histogram;
///
/// let cfg = parse_histogram("10u,2000").unwrap();
/// assert_eq!(cfg.bin_width_us, 10);
/// assert_eq!(cfg.bin_count, 2000);
/// ```
pub fn parse_histogram(spec: &str) -> Option<HistogramConfig> {
    let mut cfg = HistogramConfig::default();
    if spec.is_empty() {
        return Some(cfg);
    }
    let mut parts = spec.split(',');
    if let Some(width) = parts.next() {
        let (digits, unit_us) = match width.chars().last() {
            Some('u') => (&width[..width.len() - 1], 1u64),
            Some('m') => (&width[..width.len() - 1], 1000u64),
            _ => (width, 1000u64),
        };
        cfg.bin_width_us = digits.parse::<u64>().ok()?.max(1) * unit_us;
    }
    if let Some(bins) = parts.next() {
        cfg.bin_count = bins.parse().ok()?;
    }
    if let Some(lo) = parts.next() {
        cfg.lower_secs = lo.parse().ok()?;
    }
    if let Some(hi) = parts.next() {
        cfg.upper_secs = hi.parse().ok()?;
    }
    Some(cfg)
}

/// Parse `--isochronous fps:mean[,variance]`.
///
/// # Examples
///
/// ```
/// use rperf2::config::parse_isoch;
///
/// let cfg = parse_isoch("60:1M,0").unwrap();
/// assert_eq!(cfg.frames_per_sec, 60);
/// assert_eq!(cfg.mean_bps, 1024 * 1024);
/// assert_eq!(parse_isoch("60"), None);
/// ```
pub fn parse_isoch(spec: &str) -> Option<IsochConfig> {
    let (fps, rest) = spec.split_once(':')?;
    let (mean, variance) = match rest.split_once(',') {
        Some((m, v)) => (m, Some(v)),
        None => (rest, None),
    };
    Some(IsochConfig {
        frames_per_sec: fps.parse().ok()?,
        mean_bps: parse_byte_count(mean)?,
        variance: match variance {
            Some(v) => parse_byte_count(v)?,
            None => 0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 5001);
        assert_eq!(cfg.amount, TestAmount::Time(Duration::from_secs(10)));
        assert_eq!(cfg.effective_buffer_len(), DEFAULT_TCP_BUFLEN);
    }

    #[test]
    fn test_udp_buffer_defaults() {
        let mut cfg = Config::default().with_protocol(Protocol::Udp);
        assert_eq!(cfg.effective_buffer_len(), 1470);
        cfg.ipv6 = true;
        assert_eq!(cfg.effective_buffer_len(), 1450);
        assert_eq!(cfg.effective_rate(), 1024 * 1024);
    }

    #[test]
    fn test_parse_rate_suffixes() {
        assert_eq!(parse_rate("1M"), Some((1024 * 1024, RateUnits::BitsPerSec)));
        assert_eq!(parse_rate("500k"), Some((500 * 1024, RateUnits::BitsPerSec)));
        assert_eq!(parse_rate("100p"), Some((100, RateUnits::PacketsPerSec)));
        assert_eq!(parse_rate("2Kp"), Some((2048, RateUnits::PacketsPerSec)));
        assert_eq!(parse_rate("junk"), None);
    }

    #[test]
    fn test_parse_histogram_spec() {
        let cfg = parse_histogram("10u,2000,0,2").unwrap();
        assert_eq!(cfg.bin_width_us, 10);
        assert_eq!(cfg.bin_count, 2000);
        assert_eq!(cfg.lower_secs, 0.0);
        assert_eq!(cfg.upper_secs, 2.0);
        // bare spec keeps defaults
        let cfg = parse_histogram("").unwrap();
        assert_eq!(cfg.bin_width_us, 1000);
    }

    #[test]
    fn test_parse_isoch_spec() {
        let cfg = parse_isoch("60:1M,0").unwrap();
        assert_eq!(cfg.frames_per_sec, 60);
        assert_eq!(cfg.mean_bps, 1024 * 1024);
        assert_eq!(cfg.variance, 0);
        assert!(parse_isoch("60").is_none());
    }

    #[test]
    fn test_bind_spec_forms() {
        let mut cfg = Config::default();
        cfg.apply_bind("10.0.0.1").unwrap();
        assert_eq!(cfg.bind_addr.unwrap().to_string(), "10.0.0.1");
        cfg.apply_bind("10.0.0.1:6001").unwrap();
        assert_eq!(cfg.bind_port, 6001);
        cfg.apply_bind("10.0.0.1%eth0").unwrap();
        assert_eq!(cfg.bind_dev.as_deref(), Some("eth0"));
        assert!(cfg.apply_bind("not-an-ip").is_err());
    }

    #[test]
    fn test_resolve_rejects_trip_time_udp() {
        let mut cfg = Config::client("h".into(), 5001).with_protocol(Protocol::Udp);
        cfg.trip_time = true;
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn test_resolve_subsecond_interval_enables_enhanced() {
        let mut cfg = Config::client("h".into(), 5001)
            .with_interval(Duration::from_millis(100));
        cfg.resolve().unwrap();
        assert!(cfg.enhanced);
    }
}
