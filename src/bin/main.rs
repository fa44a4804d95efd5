use clap::Parser;
use log::warn;
use rperf2::config::{
    parse_byte_count, parse_histogram, parse_isoch, parse_rate, Mode, TestAmount, TestMode,
};
use rperf2::{Client, Config, Protocol, Server};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rperf2")]
#[command(about = "A threaded network performance measurement tool", long_about = None)]
#[command(version, disable_version_flag = true)]
struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version, value_parser = clap::value_parser!(bool))]
    version: Option<bool>,

    /// Run in server mode
    #[arg(short = 's', long = "server", conflicts_with = "client")]
    server: bool,

    /// Run in client mode, connecting to HOST
    #[arg(short = 'c', long = "client", value_name = "HOST")]
    client: Option<String>,

    /// Use UDP instead of TCP
    #[arg(short = 'u', long = "udp")]
    udp: bool,

    /// Test duration in seconds; zero or negative runs until interrupted
    #[arg(short = 't', long = "time", allow_negative_numbers = true)]
    time: Option<f64>,

    /// Number of bytes to transmit instead of a duration (accepts k/m/g)
    #[arg(short = 'n', long = "num", value_name = "BYTES")]
    num: Option<String>,

    /// Seconds between periodic bandwidth reports; zero disables them
    #[arg(short = 'i', long = "interval")]
    interval: Option<f64>,

    /// Number of parallel client streams
    #[arg(short = 'P', long = "parallel")]
    parallel: Option<usize>,

    /// Read/write buffer length (accepts k/m/g)
    #[arg(short = 'l', long = "len", value_name = "LEN")]
    len: Option<String>,

    /// Requested socket window / buffer size (accepts k/m/g)
    #[arg(short = 'w', long = "window", value_name = "WIN")]
    window: Option<String>,

    /// Port to listen on or connect to
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Bind to addr[:port][%dev]
    #[arg(short = 'B', long = "bind", value_name = "ADDR")]
    bind: Option<String>,

    /// Dual test: the server sends back concurrently
    #[arg(short = 'd', long = "dualtest")]
    dualtest: bool,

    /// Trade-off test: the server sends back after we finish
    #[arg(short = 'r', long = "tradeoff")]
    tradeoff: bool,

    /// Reverse: the server sends, we receive
    #[arg(short = 'R', long = "reverse")]
    reverse: bool,

    /// Bidirectional: both directions at once on one connection
    #[arg(long = "bidir")]
    bidir: bool,

    /// Offered load, bits/sec with k/m/g suffix, or packets/sec with
    /// a trailing 'p' (e.g. -b 1M, -b 100Kp)
    #[arg(short = 'b', long = "bandwidth", value_name = "RATE")]
    bandwidth: Option<String>,

    /// Type-of-service byte, decimal or 0x-prefixed hex
    #[arg(short = 'S', long = "tos", value_name = "TOS")]
    tos: Option<String>,

    /// Time-to-live
    #[arg(short = 'T', long = "ttl")]
    ttl: Option<u32>,

    /// TCP maximum segment size
    #[arg(short = 'M', long = "mss")]
    mss: Option<u32>,

    /// Enhanced reporting: write/error counts, retransmits, latency
    #[arg(short = 'e', long = "enhancedreports")]
    enhanced: bool,

    /// Report style; 'c' selects CSV output
    #[arg(short = 'y', long = "reportstyle", value_name = "STYLE")]
    reportstyle: Option<char>,

    /// Write reports to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<String>,

    /// Receive latency histogram: binwidth[u|m],bins[,lo,hi]
    #[arg(long = "rx-histogram", value_name = "SPEC", num_args = 0..=1, default_missing_value = "")]
    rx_histogram: Option<String>,

    /// Isochronous traffic: fps:mean[,variance]
    #[arg(long = "isochronous", value_name = "FPS:MEAN[,VAR]")]
    isochronous: Option<String>,

    /// Congestion control algorithm (Linux)
    #[arg(short = 'Z', long = "linux-congestion", value_name = "ALGO")]
    congestion: Option<String>,

    /// Realtime scheduling for traffic threads
    #[arg(short = 'z', long = "realtime")]
    realtime: bool,

    /// Epoch time (s.frac) at which transmission starts
    #[arg(long = "txstart-time", value_name = "EPOCH")]
    txstart_time: Option<f64>,

    /// Report format: a (adaptive), b/k/m/g bits, B/K/M/G bytes
    #[arg(short = 'f', long = "format", value_name = "FMT")]
    format: Option<char>,

    /// Disable Nagle's algorithm
    #[arg(short = 'N', long = "nodelay")]
    nodelay: bool,

    /// Port the server should connect back to in dual tests
    #[arg(short = 'L', long = "listenport")]
    listenport: Option<u16>,

    /// Compatibility mode: no test negotiation header
    #[arg(short = 'C', long = "compatibility")]
    compat: bool,

    /// Detect the peer's version during negotiation
    #[arg(short = 'X', long = "peer-detect")]
    peer_detect: bool,

    /// Measure write-to-read trip times (TCP only)
    #[arg(long = "trip-time")]
    trip_time: bool,

    /// Use IPv6
    #[arg(short = 'V', long = "ipv6_domain")]
    ipv6: bool,

    /// Source-specific multicast host
    #[arg(short = 'H', long = "ssm-host", value_name = "HOST")]
    ssm_host: Option<String>,
}

fn parse_tos(spec: &str) -> Option<u32> {
    match spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => spec.parse().ok(),
    }
}

/// Fold command-line options into a config that already carries the
/// environment settings; explicit options win.
fn apply_cli(cli: &Cli, config: &mut Config) -> anyhow::Result<()> {
    if cli.server {
        config.mode = Mode::Server;
    }
    if let Some(host) = &cli.client {
        config.mode = Mode::Client;
        config.server_addr = Some(host.clone());
    }
    if cli.udp {
        config.protocol = Protocol::Udp;
    }
    if let Some(secs) = cli.time {
        config.amount = if secs <= 0.0 {
            TestAmount::Infinite
        } else {
            TestAmount::Time(Duration::from_secs_f64(secs))
        };
    }
    if let Some(num) = &cli.num {
        let bytes = parse_byte_count(num)
            .ok_or_else(|| anyhow::anyhow!("invalid byte count '{num}'"))?;
        config.amount = TestAmount::Bytes(bytes);
    }
    if let Some(secs) = cli.interval {
        config.interval = Duration::from_secs_f64(secs.max(0.0));
    }
    if let Some(n) = cli.parallel {
        config.parallel = n;
    }
    if let Some(len) = &cli.len {
        config.buffer_len = Some(
            parse_byte_count(len).ok_or_else(|| anyhow::anyhow!("invalid length '{len}'"))?
                as usize,
        );
    }
    if let Some(win) = &cli.window {
        config.window_size = Some(
            parse_byte_count(win).ok_or_else(|| anyhow::anyhow!("invalid window '{win}'"))?
                as usize,
        );
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.apply_bind(bind)?;
    }
    if cli.dualtest {
        config.test_mode = TestMode::DualTest;
    }
    if cli.tradeoff {
        config.test_mode = TestMode::TradeOff;
    }
    config.reverse |= cli.reverse;
    config.bidir |= cli.bidir;
    if let Some(rate) = &cli.bandwidth {
        let (value, units) =
            parse_rate(rate).ok_or_else(|| anyhow::anyhow!("invalid rate '{rate}'"))?;
        config.rate = Some(value);
        config.rate_units = units;
    }
    if let Some(tos) = &cli.tos {
        config.tos = parse_tos(tos).ok_or_else(|| anyhow::anyhow!("invalid TOS '{tos}'"))?;
    }
    if let Some(ttl) = cli.ttl {
        config.ttl = Some(ttl);
    }
    if let Some(mss) = cli.mss {
        config.mss = Some(mss);
    }
    config.enhanced |= cli.enhanced;
    if let Some(style) = cli.reportstyle {
        config.csv = style == 'c' || style == 'C';
    }
    if let Some(path) = &cli.output {
        config.output_file = Some(path.clone());
    }
    if let Some(spec) = &cli.rx_histogram {
        config.rx_histogram = Some(
            parse_histogram(spec)
                .ok_or_else(|| anyhow::anyhow!("invalid histogram spec '{spec}'"))?,
        );
    }
    if let Some(spec) = &cli.isochronous {
        config.isochronous = Some(
            parse_isoch(spec).ok_or_else(|| anyhow::anyhow!("invalid isochronous spec '{spec}'"))?,
        );
    }
    if let Some(algo) = &cli.congestion {
        config.congestion = Some(algo.clone());
    }
    config.realtime |= cli.realtime;
    if let Some(epoch) = cli.txstart_time {
        config.txstart_time = Some(epoch);
    }
    if let Some(fmt) = cli.format {
        config.format = fmt;
    }
    config.nodelay |= cli.nodelay;
    if let Some(port) = cli.listenport {
        config.listen_port = port;
    }
    config.compat |= cli.compat;
    config.peer_detect |= cli.peer_detect;
    config.trip_time |= cli.trip_time;
    config.ipv6 |= cli.ipv6;
    if let Some(host) = &cli.ssm_host {
        config.ssm_host = Some(host.clone());
    }
    Ok(())
}

/// Realtime scheduling for the traffic threads (-z), best effort.
#[cfg(target_os = "linux")]
fn apply_realtime() {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_RR) },
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        warn!(
            "realtime scheduling unavailable: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_realtime() {
    warn!("realtime scheduling requires Linux; continuing without it");
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if !cli.server && cli.client.is_none() {
        eprintln!("rperf2: one of -s (server) or -c <host> (client) is required");
        std::process::exit(1);
    }

    let mut config = Config::default();
    config.apply_environment();
    apply_cli(&cli, &mut config)?;

    // First interrupt asks flows to drain; a second one gives up.
    static INTERRUPTS: AtomicU32 = AtomicU32::new(0);
    ctrlc::set_handler(move || {
        if INTERRUPTS.fetch_add(1, Ordering::SeqCst) == 0 {
            rperf2::reporter::set_interrupted();
            warn!("interrupt: waiting for flows to drain; interrupt again to force exit");
        } else {
            std::process::exit(1);
        }
    })?;

    if config.realtime {
        apply_realtime();
    }

    let result = match config.mode {
        Mode::Server => Server::new(config).run(),
        Mode::Client => Client::new(config)?.run(),
    };
    if let Err(e) = result {
        eprintln!("rperf2: {e}");
        std::process::exit(1);
    }
    Ok(())
}
