//! Client driver: spawns one traffic thread per parallel stream, shares a
//! group header across them, and arranges dual/trade-off/reverse tests
//! with the listener through the negotiation header.

use crate::config::{Config, Mode, Protocol, RateUnits, TestAmount, TestMode};
use crate::error::{Error, Result};
use crate::isoch::IsochPacer;
use crate::output::{report_connection, report_settings, ConsoleSink, ReportWriter};
use crate::protocol::{
    generate_client_header, IsochPayload, UdpPayload, ISOCH_PAYLOAD_SIZE, UDP_PAYLOAD_SIZE,
};
use crate::report::{
    ConnectionInfo, MultiHeader, PacketHandler, PacketRecord, PacketSender, ReportHeader, WriteErr,
};
use crate::reporter::{interrupted, Reporter, ReporterHandle};
use crate::timing::Timestamp;
use crate::token_bucket::TokenBucket;
use log::{debug, error, info, warn};
use socket2::SockRef;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Fallback transfer ids on platforms without raw fds.
#[cfg(not(unix))]
static NEXT_TRANSFER_ID: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(3);

#[cfg(unix)]
pub(crate) fn transfer_id_for<T: std::os::unix::io::AsRawFd>(sock: &T) -> i32 {
    sock.as_raw_fd()
}

#[cfg(not(unix))]
pub(crate) fn transfer_id_for<T>(_sock: &T) -> i32 {
    NEXT_TRANSFER_ID.fetch_add(2, std::sync::atomic::Ordering::Relaxed)
}

fn unspecified_ip(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

#[cfg(unix)]
fn retryable_send_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(not(unix))]
fn retryable_send_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

/// Classic repeating-digit payload pattern.
///
/// # Arguments
///
/// * `buf` - The send buffer to fill; any stamped-in headers are
///   overwritten and must be re-applied afterwards
fn pattern_fill(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = b'0' + (i % 10) as u8;
    }
}

/// Apply the requested TCP socket options. Refusals are warnings, not
/// errors; the test proceeds with best-effort settings.
///
/// This covers:
/// - **TCP_NODELAY** (-N): disable Nagle's algorithm
/// - **Window** (-w): send and receive buffer sizes
/// - **MSS** (-M), **TOS** (-S), **congestion algorithm** (-Z)
///
/// # Arguments
///
/// * `stream` - The connected data stream to configure
/// * `settings` - The option values to apply
fn configure_tcp_socket(stream: &TcpStream, settings: &Config) {
    if settings.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
    }
    let sock = SockRef::from(stream);
    if let Some(win) = settings.window_size {
        if let Err(e) = sock.set_send_buffer_size(win) {
            warn!("failed to set send window to {win}: {e}");
        }
        if let Err(e) = sock.set_recv_buffer_size(win) {
            warn!("failed to set receive window to {win}: {e}");
        }
    }
    if let Some(mss) = settings.mss {
        if let Err(e) = sock.set_mss(mss) {
            warn!("failed to set MSS to {mss}: {e}");
        }
    }
    if settings.tos != 0 {
        if let Err(e) = sock.set_tos(settings.tos) {
            warn!("failed to set TOS to {:#x}: {e}", settings.tos);
        }
    }
    if let Some(algo) = &settings.congestion {
        if let Err(e) = set_congestion(stream, algo) {
            warn!("failed to set congestion algorithm '{algo}': {e}");
        }
    }
}

#[cfg(target_os = "linux")]
fn set_congestion(stream: &TcpStream, algo: &str) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            algo.as_ptr() as *const libc::c_void,
            algo.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_congestion(_stream: &TcpStream, _algo: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "congestion control selection requires Linux",
    ))
}

/// Apply UDP socket options; same warn-and-proceed policy.
///
/// # Arguments
///
/// * `socket` - The bound (and usually connected) datagram socket
/// * `settings` - The option values to apply: window (-w), TTL (-T),
///   TOS (-S)
fn configure_udp_socket(socket: &UdpSocket, settings: &Config) {
    let sock = SockRef::from(socket);
    if let Some(win) = settings.window_size {
        if let Err(e) = sock.set_send_buffer_size(win) {
            warn!("failed to set send buffer to {win}: {e}");
        }
        if let Err(e) = sock.set_recv_buffer_size(win) {
            warn!("failed to set receive buffer to {win}: {e}");
        }
    }
    if let Some(ttl) = settings.ttl {
        if let Err(e) = socket.set_ttl(ttl) {
            warn!("failed to set TTL to {ttl}: {e}");
        }
    }
    if settings.tos != 0 {
        if let Err(e) = sock.set_tos(settings.tos) {
            warn!("failed to set TOS to {:#x}: {e}", settings.tos);
        }
    }
}

fn connection_info(
    local: SocketAddr,
    peer: SocketAddr,
    settings: &Config,
    connect_time_ms: f64,
) -> ConnectionInfo {
    ConnectionInfo {
        peer,
        local,
        peer_version: None,
        connect_time_ms,
        tx_holdback_secs: 0.0,
        epoch_start: Timestamp::now(),
        win_size: settings.window_size.unwrap_or(0),
        win_size_requested: settings.window_size.unwrap_or(0),
        flags: 0,
        flags_extend: 0,
        format: settings.format,
    }
}

/// Absolute instant at which a time-bounded flow must stop.
///
/// # Returns
///
/// `None` for byte-bounded and infinite flows; those terminate on the
/// byte budget or the interrupt flag instead.
fn flow_deadline(amount: TestAmount) -> Option<Instant> {
    match amount {
        TestAmount::Time(d) => Some(Instant::now() + d),
        TestAmount::Bytes(_) | TestAmount::Infinite => None,
    }
}

fn byte_budget(amount: TestAmount) -> Option<u64> {
    match amount {
        TestAmount::Bytes(n) => Some(n),
        _ => None,
    }
}

/// Sleep out a pacing deficit, posting empty tick records so the reporter
/// can emit zero-transfer intervals on time.
///
/// # Arguments
///
/// * `bucket` - The flow's token bucket
/// * `tokens` - Tokens the next send needs
/// * `sender` - Where idle tick records go
/// * `interval` - The reporting interval; zero disables tick records
/// * `last_record` - When this flow last produced any record
///
/// # Returns
///
/// `true` when the interrupt flag was raised while throttled and the
/// flow should move to its close path.
fn paced_wait(
    bucket: &mut TokenBucket,
    tokens: u64,
    sender: &PacketSender,
    interval: Duration,
    last_record: &mut Instant,
) -> bool {
    while let Some(wait) = bucket.try_consume(tokens) {
        if interrupted() {
            return true;
        }
        std::thread::sleep(wait.min(Duration::from_millis(100)));
        if !interval.is_zero() && last_record.elapsed() >= interval {
            sender.report_packet(PacketRecord::empty_at(Timestamp::now()));
            *last_record = Instant::now();
        }
    }
    false
}

/// The rperf2 client.
///
/// # Examples
///
/// ```no_run
/// use rperf2::{Client, Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("10.0.0.2".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_duration(Duration::from_secs(2))
///     .with_interval(Duration::from_secs(1));
/// let client = Client::new(config)?;
/// client.run()?;
/// # Ok::<(), rperf2::Error>(())
/// ```
pub struct Client {
    config: Config,
}

impl Client {
    /// Create a client from settings, resolving compound options and
    /// rejecting invalid combinations up front.
    ///
    /// # Arguments
    ///
    /// * `config` - The test settings; the mode is forced to client
    ///
    /// # Errors
    ///
    /// [`Error::Config`] or [`Error::Isoch`] when the settings cannot
    /// describe a runnable test.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Client, Config};
    ///
    /// let client = Client::new(Config::client("10.0.0.2".to_string(), 5001));
    /// assert!(client.is_ok());
    ///
    /// // A client with no server address is rejected before any thread
    /// // starts.
    /// assert!(Client::new(Config::new()).is_err());
    /// ```
    pub fn new(mut config: Config) -> Result<Self> {
        config.mode = Mode::Client;
        config.resolve()?;
        Ok(Self { config })
    }

    /// Run the configured test to completion: spawn the reporter and the
    /// traffic threads, wait for every flow to drain, then shut the
    /// reporter down.
    ///
    /// # Errors
    ///
    /// Socket setup failures, or [`Error::FlowState`] when a traffic
    /// thread died without finishing its flow.
    pub fn run(&self) -> Result<()> {
        let settings = &self.config;
        let writer = match &settings.output_file {
            Some(path) => ReportWriter::to_file(path)?,
            None => ReportWriter::stdout(),
        };
        report_settings(&writer, settings);

        if let Some(txstart) = settings.txstart_time {
            hold_until_epoch(txstart);
        }

        let reporter = Reporter::start(Box::new(ConsoleSink::new(Arc::clone(&writer), settings)));
        let multi = MultiHeader::allocate(settings);

        // Dual and trade-off tests need a listener before the first byte
        // goes out, so the server's counter-flow has somewhere to land.
        let catcher = if settings.test_mode != TestMode::Normal {
            Some(spawn_counterflow_catcher(
                settings,
                reporter.handle(),
                Arc::clone(&writer),
            )?)
        } else {
            None
        };

        let mut joins = Vec::with_capacity(settings.parallel);
        for i in 0..settings.parallel {
            let cfg = settings.clone();
            let handle = reporter.handle();
            let multi = Arc::clone(&multi);
            let writer = Arc::clone(&writer);
            let join = std::thread::Builder::new()
                .name(format!("traffic-{i}"))
                .spawn(move || {
                    let result = if cfg.reverse {
                        run_reverse_flow(&cfg, &handle, &writer)
                    } else {
                        match cfg.protocol {
                            Protocol::Tcp => run_tcp_client(&cfg, &handle, Some(multi), &writer),
                            Protocol::Udp => run_udp_client(&cfg, &handle, Some(multi), &writer),
                        }
                    };
                    if let Err(e) = result {
                        error!("traffic thread failed: {e}");
                    }
                })
                .map_err(Error::Io)?;
            joins.push(join);
        }
        let mut died = 0usize;
        for join in joins {
            if join.join().is_err() {
                died += 1;
            }
        }
        if let Some(catcher) = catcher {
            if catcher.join().is_err() {
                died += 1;
            }
        }
        reporter.shutdown();
        if died > 0 {
            return Err(Error::FlowState(format!(
                "{died} traffic thread(s) died before posting a final record"
            )));
        }
        Ok(())
    }
}

/// Sleep until the `--txstart-time` epoch; already-past times start
/// immediately.
fn hold_until_epoch(txstart: f64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    if txstart > now {
        let wait = txstart - now;
        info!("holding transmit start for {wait:.3} sec");
        std::thread::sleep(Duration::from_secs_f64(wait));
    }
}

/// Resolve the server address, preferring the family `-V` selects.
///
/// # Errors
///
/// [`Error::Connection`] when the host does not resolve to a usable
/// address.
fn resolve_server(settings: &Config) -> Result<SocketAddr> {
    let host = settings
        .server_addr
        .as_deref()
        .ok_or_else(|| Error::Config("client requires a server address".into()))?;
    let mut addrs = (host, settings.port)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("cannot resolve {host}: {e}")))?;
    addrs
        .find(|a| a.is_ipv6() == settings.ipv6)
        .or_else(|| (host, settings.port).to_socket_addrs().ok()?.next())
        .ok_or_else(|| Error::Connection(format!("no usable address for {host}")))
}

/// Normal TCP client flow: connect and stream pattern buffers. In bidir
/// mode a second thread receives the server's concurrent counter-flow on
/// the same connection.
///
/// # Arguments
///
/// * `settings` - The flow's settings snapshot
/// * `reporter` - Handle for posting the flow's report head
/// * `multi` - The parallel group this flow belongs to, if any
/// * `writer` - Where the connection banner goes
pub(crate) fn run_tcp_client(
    settings: &Config,
    reporter: &ReporterHandle,
    multi: Option<Arc<MultiHeader>>,
    writer: &Arc<ReportWriter>,
) -> Result<()> {
    let addr = resolve_server(settings)?;
    let started = Instant::now();
    let stream = TcpStream::connect(addr).map_err(|e| {
        Error::Connection(format!("connect to {addr} failed: {e}"))
    })?;
    let connect_ms = started.elapsed().as_secs_f64() * 1000.0;
    configure_tcp_socket(&stream, settings);

    let receiver = if settings.bidir {
        let read_half = stream.try_clone().map_err(Error::Io)?;
        let mut recv_settings = settings.clone();
        recv_settings.mode = Mode::Server;
        let handle = reporter.clone();
        let writer = Arc::clone(writer);
        Some(
            std::thread::Builder::new()
                .name("bidir-recv".to_string())
                .spawn(move || {
                    if let Err(e) = crate::server::tcp_receive_loop(
                        read_half,
                        &recv_settings,
                        &handle,
                        None,
                        &writer,
                        true,
                        0,
                    ) {
                        error!("bidir receive failed: {e}");
                    }
                })
                .map_err(Error::Io)?,
        )
    } else {
        None
    };

    let result = tcp_sender_on_stream(stream, settings, reporter, multi, writer, connect_ms);
    if let Some(receiver) = receiver {
        let _ = receiver.join();
    }
    result
}

/// Drive a TCP send loop over an already-connected stream; used by the
/// normal client and by the server's reverse/bidir arrangements.
///
/// # Arguments
///
/// * `stream` - The connected, configured data stream
/// * `connect_ms` - The measured connect() latency for the banner; zero
///   when the connection was accepted rather than initiated
pub(crate) fn tcp_sender_on_stream(
    mut stream: TcpStream,
    settings: &Config,
    reporter: &ReporterHandle,
    multi: Option<Arc<MultiHeader>>,
    writer: &Arc<ReportWriter>,
    connect_ms: f64,
) -> Result<()> {
    let transfer_id = transfer_id_for(&stream);
    let conn = connection_info(stream.local_addr()?, stream.peer_addr()?, settings, connect_ms);
    let (mut head, sender) = ReportHeader::new(
        settings,
        transfer_id,
        PacketHandler::TcpSend,
        multi.clone(),
        reporter.wake_condition(),
    );
    head.data.connection = Some(conn.clone());
    report_connection(writer, transfer_id, &conn);

    let header = generate_client_header(settings);
    let header_len = header
        .as_ref()
        .map_or(crate::protocol::BASE_SIZE, |h| h.wire_size());
    let mut buf = vec![0u8; settings.effective_buffer_len().max(header_len)];
    pattern_fill(&mut buf);
    // The first buffer leads with the negotiation header, or a zeroed
    // base block meaning "no negotiation" to the listener.
    match &header {
        Some(hdr) => buf[..header_len].copy_from_slice(&hdr.encode()),
        None => buf[..crate::protocol::BASE_SIZE].fill(0),
    }

    let epoch = match &multi {
        Some(m) => m.barrier_client(),
        None => Timestamp::now(),
    };
    head.data.set_epoch(epoch);
    reporter.post_report(head);

    let deadline = flow_deadline(settings.amount);
    let budget = byte_budget(settings.amount);
    let mut bucket = settings
        .rate
        .filter(|r| *r > 0)
        .map(TokenBucket::from_bits_per_sec);
    let interval = settings.interval;
    let mut last_record = Instant::now();
    let mut bytes_sent = 0u64;
    let mut seq = 0i64;

    loop {
        if interrupted() {
            debug!("tcp sender {transfer_id} interrupted");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if budget.is_some_and(|b| bytes_sent >= b) {
            break;
        }
        if let Some(bucket) = &mut bucket {
            if paced_wait(bucket, buf.len() as u64, &sender, interval, &mut last_record) {
                break;
            }
        }
        let now = Timestamp::now();
        match stream.write(&buf) {
            Ok(0) => break,
            Ok(n) => {
                seq += 1;
                bytes_sent += n as u64;
                last_record = Instant::now();
                sender.report_packet(PacketRecord {
                    packet_id: seq,
                    packet_len: n as u64,
                    sent_time: now,
                    packet_time: now,
                    socket: transfer_id,
                    ..Default::default()
                });
                // Restore payload clobbered by the header after the first
                // write.
                if seq == 1 {
                    pattern_fill(&mut buf);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                sender.report_packet(PacketRecord {
                    err_write: WriteErr::Account,
                    empty: true,
                    sent_time: now,
                    packet_time: now,
                    socket: transfer_id,
                    ..Default::default()
                });
            }
            Err(e) => {
                warn!("tcp sender {transfer_id} write failed: {e}");
                sender.report_packet(PacketRecord {
                    err_write: WriteErr::Fatal,
                    empty: true,
                    sent_time: now,
                    packet_time: now,
                    socket: transfer_id,
                    ..Default::default()
                });
                break;
            }
        }
    }

    let now = Timestamp::now();
    sender.close_report(PacketRecord {
        packet_id: seq,
        sent_time: now,
        packet_time: now,
        socket: transfer_id,
        ..Default::default()
    });
    sender.end_report();
    Ok(())
}

/// Normal UDP client flow: paced datagrams with inline payload headers,
/// or isochronous bursts when configured.
///
/// # Arguments
///
/// * `settings` - The flow's settings snapshot
/// * `reporter` - Handle for posting the flow's report head
/// * `multi` - The parallel group this flow belongs to, if any
/// * `writer` - Where the connection banner goes
pub(crate) fn run_udp_client(
    settings: &Config,
    reporter: &ReporterHandle,
    multi: Option<Arc<MultiHeader>>,
    writer: &Arc<ReportWriter>,
) -> Result<()> {
    let addr = resolve_server(settings)?;
    let bind: SocketAddr = match settings.bind_addr {
        Some(ip) => (ip, settings.bind_port).into(),
        None => (unspecified_ip(addr.is_ipv6()), 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(addr)?;
    configure_udp_socket(&socket, settings);
    if addr.ip().is_multicast() && settings.ttl.is_none() {
        if let Err(e) = socket.set_multicast_ttl_v4(crate::config::DEFAULT_MULTICAST_TTL) {
            warn!("failed to set multicast TTL: {e}");
        }
    }

    let receiver = if settings.bidir {
        let read_half = socket.try_clone().map_err(Error::Io)?;
        let mut recv_settings = settings.clone();
        recv_settings.mode = Mode::Server;
        let handle = reporter.clone();
        let writer = Arc::clone(writer);
        Some(
            std::thread::Builder::new()
                .name("bidir-recv".to_string())
                .spawn(move || {
                    if let Err(e) = crate::server::udp_receive_flow(
                        &read_half,
                        &recv_settings,
                        &handle,
                        &writer,
                        true,
                        None,
                    ) {
                        error!("bidir receive failed: {e}");
                    }
                })
                .map_err(Error::Io)?,
        )
    } else {
        None
    };

    let result = udp_sender_on_socket(socket, settings, reporter, multi, writer);
    if let Some(receiver) = receiver {
        let _ = receiver.join();
    }
    result
}

/// Drive a UDP send loop over a connected socket; used by the normal
/// client and by the server's reverse/bidir arrangements.
///
/// # Arguments
///
/// * `socket` - The connected, configured datagram socket
/// * `settings` - The flow's settings; isochronous settings switch the
///   loop to the frame pacer
pub(crate) fn udp_sender_on_socket(
    socket: UdpSocket,
    settings: &Config,
    reporter: &ReporterHandle,
    multi: Option<Arc<MultiHeader>>,
    writer: &Arc<ReportWriter>,
) -> Result<()> {
    let transfer_id = transfer_id_for(&socket);
    let conn = connection_info(socket.local_addr()?, socket.peer_addr()?, settings, 0.0);
    let (mut head, sender) = ReportHeader::new(
        settings,
        transfer_id,
        PacketHandler::UdpSend,
        multi.clone(),
        reporter.wake_condition(),
    );
    head.data.connection = Some(conn.clone());
    report_connection(writer, transfer_id, &conn);

    let header = generate_client_header(settings);
    let header_len = header.as_ref().map_or(0, |h| h.wire_size());
    let isoch_offset = UDP_PAYLOAD_SIZE + header_len;
    let min_len = isoch_offset + if settings.isochronous.is_some() {
        ISOCH_PAYLOAD_SIZE
    } else {
        0
    };
    let mut buf = vec![0u8; settings.effective_buffer_len().max(min_len)];
    pattern_fill(&mut buf);
    // The negotiation header rides in every datagram; the buffer is
    // stamped once and reused.
    if let Some(hdr) = &header {
        buf[UDP_PAYLOAD_SIZE..UDP_PAYLOAD_SIZE + header_len].copy_from_slice(&hdr.encode());
    } else {
        let end = (UDP_PAYLOAD_SIZE + crate::protocol::BASE_SIZE).min(buf.len());
        buf[UDP_PAYLOAD_SIZE..end].fill(0);
    }

    let epoch = match &multi {
        Some(m) => m.barrier_client(),
        None => Timestamp::now(),
    };
    head.data.set_epoch(epoch);
    reporter.post_report(head);

    let result = if settings.isochronous.is_some() {
        udp_isoch_loop(&socket, settings, &sender, &mut buf, isoch_offset, transfer_id)
    } else {
        udp_steady_loop(&socket, settings, &sender, &mut buf, transfer_id)
    };

    sender.end_report();
    result
}

/// Send one datagram and produce its record.
///
/// # Returns
///
/// `Ok(bytes_sent)` — zero when the send was retryable and only an
/// error record was produced — or `Err(())` on a fatal send error after
/// the fatal record has been posted.
fn send_datagram(
    socket: &UdpSocket,
    sender: &PacketSender,
    buf: &[u8],
    id: i64,
    transfer_id: i32,
    isoch: Option<(&IsochPayload, i64)>,
) -> std::result::Result<u64, ()> {
    let now = Timestamp::now();
    match socket.send(buf) {
        Ok(n) => {
            let mut record = PacketRecord {
                packet_id: id,
                packet_len: n as u64,
                sent_time: now,
                packet_time: now,
                socket: transfer_id,
                ..Default::default()
            };
            if let Some((block, prev)) = isoch {
                record.isoch_start_time = block.start_time;
                record.prev_frame_id = prev;
                record.frame_id = block.frame_id as i64;
                record.burst_size = block.burst_size as u64;
                record.burst_period = block.burst_period as u64;
                record.remaining = block.remaining as u64;
            }
            sender.report_packet(record);
            Ok(n as u64)
        }
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
        Err(e) if retryable_send_error(&e) => {
            // ENOBUFS and friends: retryable, accounted.
            sender.report_packet(PacketRecord {
                err_write: WriteErr::Account,
                empty: true,
                sent_time: now,
                packet_time: now,
                socket: transfer_id,
                ..Default::default()
            });
            Ok(0)
        }
        Err(e) => {
            warn!("udp send failed: {e}");
            sender.report_packet(PacketRecord {
                err_write: WriteErr::Fatal,
                empty: true,
                sent_time: now,
                packet_time: now,
                socket: transfer_id,
                ..Default::default()
            });
            Err(())
        }
    }
}

fn udp_steady_loop(
    socket: &UdpSocket,
    settings: &Config,
    sender: &PacketSender,
    buf: &mut [u8],
    transfer_id: i32,
) -> Result<()> {
    let deadline = flow_deadline(settings.amount);
    let budget = byte_budget(settings.amount);
    let mut bucket = match settings.rate_units {
        RateUnits::BitsPerSec => TokenBucket::from_bits_per_sec(settings.effective_rate()),
        RateUnits::PacketsPerSec => TokenBucket::new(settings.effective_rate()),
    };
    let tokens = match settings.rate_units {
        RateUnits::BitsPerSec => buf.len() as u64,
        RateUnits::PacketsPerSec => 1,
    };
    let interval = settings.interval;
    let mut last_record = Instant::now();
    let mut bytes_sent = 0u64;
    let mut seq = 0i64;

    loop {
        if interrupted() {
            debug!("udp sender {transfer_id} interrupted");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if budget.is_some_and(|b| bytes_sent >= b) {
            break;
        }
        if paced_wait(&mut bucket, tokens, sender, interval, &mut last_record) {
            break;
        }
        UdpPayload::new(seq, Timestamp::now()).write_to(buf);
        match send_datagram(socket, sender, buf, seq, transfer_id, None) {
            Ok(n) => {
                if n > 0 {
                    bytes_sent += n;
                    seq += 1;
                    last_record = Instant::now();
                }
            }
            Err(()) => break,
        }
    }

    // Terminal datagram: negated id on the wire and in the final record.
    let now = Timestamp::now();
    UdpPayload::new(-seq, now).write_to(buf);
    let sent = socket.send(buf).unwrap_or(0);
    sender.close_report(PacketRecord {
        packet_id: seq,
        packet_len: sent as u64,
        sent_time: now,
        packet_time: now,
        socket: transfer_id,
        ..Default::default()
    });
    Ok(())
}

fn udp_isoch_loop(
    socket: &UdpSocket,
    settings: &Config,
    sender: &PacketSender,
    buf: &mut [u8],
    isoch_offset: usize,
    transfer_id: i32,
) -> Result<()> {
    let Some(isoch_cfg) = settings.isochronous else {
        return Err(Error::Isoch("isochronous flow started without settings".into()));
    };
    let mut pacer = IsochPacer::new(isoch_cfg);
    let deadline = flow_deadline(settings.amount);
    let payload_capacity = (buf.len() - isoch_offset - ISOCH_PAYLOAD_SIZE).max(1) as u64;
    let mut seq = 0i64;
    let mut prev_frame = 0i64;

    'frames: loop {
        if interrupted() || deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let frame = pacer.next_frame(payload_capacity);
        let frame_start = Timestamp::now();
        let mut remaining = frame.bytes;
        while remaining > 0 {
            if interrupted() {
                break 'frames;
            }
            let this_len = remaining.min(payload_capacity);
            let block = IsochPayload {
                burst_period: pacer.burst_period().as_micros() as u32,
                start_time: frame_start,
                prev_frame_id: prev_frame as u32,
                frame_id: frame.id as u32,
                burst_size: frame.bytes as u32,
                remaining: remaining as u32,
            };
            UdpPayload::new(seq, Timestamp::now()).write_to(buf);
            block.write_to(&mut buf[isoch_offset..]);
            // Datagram length tracks the frame remainder, never below the
            // inline blocks.
            let wire_len = (isoch_offset + ISOCH_PAYLOAD_SIZE + this_len as usize).min(buf.len());
            match send_datagram(socket, sender, &buf[..wire_len], seq, transfer_id, Some((&block, prev_frame))) {
                Ok(n) => {
                    if n > 0 {
                        seq += 1;
                        remaining = remaining.saturating_sub(this_len);
                    }
                }
                Err(()) => break 'frames,
            }
        }
        prev_frame = frame.id;
    }

    let now = Timestamp::now();
    UdpPayload::new(-seq, now).write_to(buf);
    let sent = socket.send(&buf[..(isoch_offset + ISOCH_PAYLOAD_SIZE).min(buf.len())]).unwrap_or(0);
    sender.close_report(PacketRecord {
        packet_id: seq,
        packet_len: sent as u64,
        sent_time: now,
        packet_time: now,
        socket: transfer_id,
        ..Default::default()
    });
    Ok(())
}

/// `-R`: connect to the server, request a reverse test, then receive on
/// the same socket as if we were the server.
///
/// # Arguments
///
/// * `settings` - The client settings carrying the reverse flag; the
///   receive side runs with a server-mode copy of them
fn run_reverse_flow(
    settings: &Config,
    reporter: &ReporterHandle,
    writer: &Arc<ReportWriter>,
) -> Result<()> {
    let addr = resolve_server(settings)?;
    let mut recv_settings = settings.clone();
    recv_settings.mode = Mode::Server;
    match settings.protocol {
        Protocol::Tcp => {
            let stream = TcpStream::connect(addr)
                .map_err(|e| Error::Connection(format!("connect to {addr} failed: {e}")))?;
            configure_tcp_socket(&stream, settings);
            let hdr = generate_client_header(settings)
                .ok_or_else(|| Error::Config("reverse mode cannot run with -C".into()))?;
            (&stream).write_all(&hdr.encode())?;
            info!("requested reverse test from {addr}");
            crate::server::tcp_receive_loop(stream, &recv_settings, reporter, None, writer, false, 0)
        }
        Protocol::Udp => {
            let bind: SocketAddr = (unspecified_ip(addr.is_ipv6()), 0).into();
            let socket = UdpSocket::bind(bind)?;
            socket.connect(addr)?;
            configure_udp_socket(&socket, settings);
            let hdr = generate_client_header(settings)
                .ok_or_else(|| Error::Config("reverse mode cannot run with -C".into()))?;
            let mut request = vec![0u8; UDP_PAYLOAD_SIZE + hdr.wire_size()];
            UdpPayload::new(0, Timestamp::now()).write_to(&mut request);
            request[UDP_PAYLOAD_SIZE..].copy_from_slice(&hdr.encode());
            socket.send(&request)?;
            info!("requested reverse test from {addr}");
            crate::server::udp_receive_flow(&socket, &recv_settings, reporter, writer, false, None)
        }
    }
}

/// Listener the client runs for dual/trade-off tests so the server's
/// counter-flow has an endpoint. Accepts exactly one flow.
///
/// # Arguments
///
/// * `settings` - The client settings; the listen port is `-L` when
///   given, the data port otherwise
///
/// # Returns
///
/// The catcher thread's join handle; it exits after the counter-flow
/// completes or the interrupt flag is raised.
fn spawn_counterflow_catcher(
    settings: &Config,
    reporter: ReporterHandle,
    writer: Arc<ReportWriter>,
) -> Result<std::thread::JoinHandle<()>> {
    let port = if settings.listen_port != 0 {
        settings.listen_port
    } else {
        settings.port
    };
    let mut recv_settings = settings.clone();
    recv_settings.mode = Mode::Server;
    recv_settings.port = port;
    let protocol = settings.protocol;

    let bind_ip = settings
        .bind_addr
        .unwrap_or_else(|| unspecified_ip(settings.ipv6));

    let join = match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind((bind_ip, port))?;
            listener.set_nonblocking(true)?;
            std::thread::Builder::new()
                .name("counterflow".to_string())
                .spawn(move || {
                    loop {
                        if interrupted() {
                            return;
                        }
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                debug!("counter-flow connection from {peer}");
                                let _ = stream.set_nonblocking(false);
                                if let Err(e) = crate::server::tcp_receive_loop(
                                    stream,
                                    &recv_settings,
                                    &reporter,
                                    None,
                                    &writer,
                                    true,
                                    0,
                                ) {
                                    error!("counter-flow receive failed: {e}");
                                }
                                return;
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                std::thread::sleep(Duration::from_millis(100));
                            }
                            Err(e) => {
                                error!("counter-flow accept failed: {e}");
                                return;
                            }
                        }
                    }
                })
                .map_err(Error::Io)?
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind((bind_ip, port))?;
            socket.set_read_timeout(Some(Duration::from_millis(250)))?;
            std::thread::Builder::new()
                .name("counterflow".to_string())
                .spawn(move || {
                    if let Err(e) = crate::server::udp_receive_flow(
                        &socket,
                        &recv_settings,
                        &reporter,
                        &writer,
                        true,
                        None,
                    ) {
                        error!("counter-flow receive failed: {e}");
                    }
                })
                .map_err(Error::Io)?
        }
    };
    Ok(join)
}
