//! Server driver: the listener thread accepts data connections, decodes
//! the negotiation header from the first bytes, spawns whatever
//! counter-flow the client asked for, and runs the receive loops that
//! feed the reporter.

use crate::client::{run_tcp_client, run_udp_client, tcp_sender_on_stream, transfer_id_for, udp_sender_on_socket};
use crate::config::{Config, Mode, Protocol};
use crate::error::{Error, Result};
use crate::output::{report_connection, report_settings, ConsoleSink, ReportWriter};
use crate::protocol::{
    derive_client_settings, ClientHeader, IsochPayload, NegotiatedTest, UdpPayload,
    TEST_UDP_ISOCH, UDP_PAYLOAD_SIZE,
};
use crate::report::{
    ConnectionInfo, PacketHandler, PacketRecord, ReportHeader, WriteErr,
};
use crate::reporter::{interrupted, Reporter, ReporterHandle};
use crate::timing::Timestamp;
use log::{debug, error, info, warn};
use socket2::SockRef;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll granularity for accept loops and receive timeouts; bounds how
/// late an idle-interval tick or an interrupt can be noticed.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

fn unspecified_ip(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

fn configure_server_socket(sock: SockRef<'_>, settings: &Config) {
    if let Some(win) = settings.window_size {
        if let Err(e) = sock.set_recv_buffer_size(win) {
            warn!("failed to set receive window to {win}: {e}");
        }
        if let Err(e) = sock.set_send_buffer_size(win) {
            warn!("failed to set send window to {win}: {e}");
        }
    }
}

fn timed_out(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// The rperf2 server.
///
/// # Examples
///
/// ```no_run
/// use rperf2::{Config, Server};
///
/// let server = Server::new(Config::server(5001));
/// server.run()?;
/// # Ok::<(), rperf2::Error>(())
/// ```
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(mut config: Config) -> Self {
        config.mode = Mode::Server;
        Self { config }
    }

    /// Listen and serve tests until interrupted.
    pub fn run(&self) -> Result<()> {
        let mut settings = self.config.clone();
        settings.resolve()?;
        let writer = match &settings.output_file {
            Some(path) => ReportWriter::to_file(path)?,
            None => ReportWriter::stdout(),
        };
        report_settings(&writer, &settings);
        let reporter = Reporter::start(Box::new(ConsoleSink::new(Arc::clone(&writer), &settings)));
        let result = match settings.protocol {
            Protocol::Tcp => run_tcp_server(&settings, &reporter, &writer),
            Protocol::Udp => run_udp_server(&settings, &reporter, &writer),
        };
        reporter.shutdown();
        result
    }
}

fn run_tcp_server(settings: &Config, reporter: &Reporter, writer: &Arc<ReportWriter>) -> Result<()> {
    let bind_ip = settings
        .bind_addr
        .unwrap_or_else(|| unspecified_ip(settings.ipv6));
    let listener = TcpListener::bind((bind_ip, settings.port))?;
    listener.set_nonblocking(true)?;
    info!("TCP server listening on {}:{}", bind_ip, settings.port);

    let mut joins = Vec::new();
    loop {
        if interrupted() {
            debug!("listener interrupted");
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("cannot restore blocking mode for {peer}: {e}");
                    continue;
                }
                configure_server_socket(SockRef::from(&stream), settings);
                let cfg = settings.clone();
                let handle = reporter.handle();
                let writer = Arc::clone(writer);
                let join = std::thread::Builder::new()
                    .name("server-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = handle_tcp_connection(stream, peer, &cfg, &handle, &writer)
                        {
                            error!("connection from {peer} failed: {e}");
                        }
                    })
                    .map_err(Error::Io)?;
                joins.push(join);
            }
            Err(e) if timed_out(&e) => std::thread::sleep(Duration::from_millis(100)),
            Err(e) => {
                error!("accept failed: {e}");
                break;
            }
        }
    }
    for join in joins {
        let _ = join.join();
    }
    Ok(())
}

/// First read decides what this connection is: a plain receive flow, a
/// reverse/bidir arrangement, or a dual/trade-off counter-flow request.
fn handle_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: &Config,
    reporter: &ReporterHandle,
    writer: &Arc<ReportWriter>,
) -> Result<()> {
    let mut buf = vec![0u8; settings.effective_buffer_len().max(crate::protocol::BASE_SIZE)];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Ok(());
    }
    let negotiated = match ClientHeader::decode(&buf[..n]) {
        Ok(hdr) => derive_client_settings(settings, &peer.ip().to_string(), &hdr),
        // Too short for a header: a legacy peer, treat as plain data.
        Err(_) => NegotiatedTest::None,
    };
    match negotiated {
        NegotiatedTest::None => {
            tcp_receive_loop(stream, settings, reporter, None, writer, false, n)
        }
        NegotiatedTest::Reverse(flow) => {
            info!("reverse test requested by {peer}");
            tcp_sender_on_stream(stream, &flow, reporter, None, writer, 0.0)
        }
        NegotiatedTest::Bidir(flow) => {
            info!("bidirectional test requested by {peer}");
            let write_half = stream.try_clone()?;
            let send_handle = reporter.clone();
            let send_writer = Arc::clone(writer);
            let sender = std::thread::Builder::new()
                .name("bidir-send".to_string())
                .spawn(move || {
                    if let Err(e) = tcp_sender_on_stream(
                        write_half,
                        &flow,
                        &send_handle,
                        None,
                        &send_writer,
                        0.0,
                    ) {
                        error!("bidir sender failed: {e}");
                    }
                })
                .map_err(Error::Io)?;
            let result = tcp_receive_loop(stream, settings, reporter, None, writer, false, n);
            let _ = sender.join();
            result
        }
        NegotiatedTest::Counterflow {
            settings: flow,
            dual,
        } => {
            info!(
                "{} test requested by {peer}",
                if dual { "dual" } else { "trade-off" }
            );
            let counter = if dual {
                let counter_flow = flow.clone();
                let handle = reporter.clone();
                let counter_writer = Arc::clone(writer);
                Some(
                    std::thread::Builder::new()
                        .name("counterflow".to_string())
                        .spawn(move || run_counterflow(&counter_flow, &handle, &counter_writer))
                        .map_err(Error::Io)?,
                )
            } else {
                None
            };
            let result = tcp_receive_loop(stream, settings, reporter, None, writer, false, n);
            match counter {
                Some(join) => {
                    let _ = join.join();
                }
                // Trade-off: the reverse flow runs after ours completes.
                None => run_counterflow(&flow, reporter, writer),
            }
            result
        }
    }
}

fn run_counterflow(flow: &Config, reporter: &ReporterHandle, writer: &Arc<ReportWriter>) {
    let result = match flow.protocol {
        Protocol::Tcp => run_tcp_client(flow, reporter, None, writer),
        Protocol::Udp => run_udp_client(flow, reporter, None, writer),
    };
    if let Err(e) = result {
        error!("counter-flow client failed: {e}");
    }
}

/// Receive until EOF, producing one record per successful read.
pub(crate) fn tcp_receive_loop(
    mut stream: TcpStream,
    settings: &Config,
    reporter: &ReporterHandle,
    multi: Option<Arc<crate::report::MultiHeader>>,
    writer: &Arc<ReportWriter>,
    negate_id: bool,
    initial_len: usize,
) -> Result<()> {
    let fd = transfer_id_for(&stream);
    let transfer_id = if negate_id { -fd.abs() } else { fd };
    let conn = ConnectionInfo {
        peer: stream.peer_addr()?,
        local: stream.local_addr()?,
        peer_version: None,
        connect_time_ms: 0.0,
        tx_holdback_secs: 0.0,
        epoch_start: Timestamp::now(),
        win_size: settings.window_size.unwrap_or(0),
        win_size_requested: settings.window_size.unwrap_or(0),
        flags: 0,
        flags_extend: 0,
        format: settings.format,
    };
    let (mut head, sender) = ReportHeader::new(
        settings,
        transfer_id,
        PacketHandler::TcpRecv,
        multi,
        reporter.wake_condition(),
    );
    head.data.connection = Some(conn.clone());
    report_connection(writer, transfer_id, &conn);
    head.data.set_epoch(Timestamp::now());
    reporter.post_report(head);

    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
    let mut buf = vec![0u8; settings.effective_buffer_len()];
    let interval = settings.interval;
    let mut last_record = Instant::now();
    let mut seq = 0i64;

    if initial_len > 0 {
        seq += 1;
        let now = Timestamp::now();
        sender.report_packet(PacketRecord {
            packet_id: seq,
            packet_len: initial_len as u64,
            sent_time: now,
            packet_time: now,
            socket: transfer_id,
            ..Default::default()
        });
    }

    loop {
        if interrupted() {
            debug!("tcp receiver {transfer_id} interrupted");
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                seq += 1;
                last_record = Instant::now();
                let now = Timestamp::now();
                sender.report_packet(PacketRecord {
                    packet_id: seq,
                    packet_len: n as u64,
                    sent_time: now,
                    packet_time: now,
                    socket: transfer_id,
                    ..Default::default()
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if timed_out(&e) => {
                if !interval.is_zero() && last_record.elapsed() >= interval {
                    sender.report_packet(PacketRecord::empty_at(Timestamp::now()));
                    last_record = Instant::now();
                }
            }
            Err(e) => {
                warn!("tcp receiver {transfer_id} read failed: {e}");
                let now = Timestamp::now();
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

fn run_udp_server(settings: &Config, reporter: &Reporter, writer: &Arc<ReportWriter>) -> Result<()> {
    let bind_ip = settings
        .bind_addr
        .unwrap_or_else(|| unspecified_ip(settings.ipv6));
    let socket = UdpSocket::bind((bind_ip, settings.port))?;
    configure_server_socket(SockRef::from(&socket), settings);
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    info!("UDP server listening on {}:{}", bind_ip, settings.port);

    let mut buf = vec![0u8; settings.effective_buffer_len().max(65536)];
    loop {
        if interrupted() {
            break;
        }
        // Wait for the first datagram of the next test.
        let (n, peer) = match socket.recv_from(&mut buf) {
            Ok(got) => got,
            Err(e) if timed_out(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("udp receive failed: {e}");
                break;
            }
        };
        let negotiated = match ClientHeader::decode(&buf[n.min(UDP_PAYLOAD_SIZE)..n]) {
            Ok(hdr) => derive_client_settings(settings, &peer.ip().to_string(), &hdr),
            Err(_) => NegotiatedTest::None,
        };
        let handle = reporter.handle();
        match negotiated {
            NegotiatedTest::Reverse(flow) => {
                info!("reverse test requested by {peer}");
                let send_socket = socket.try_clone()?;
                send_socket.connect(peer)?;
                if let Err(e) = udp_sender_on_socket(send_socket, &flow, &handle, None, writer) {
                    error!("reverse sender failed: {e}");
                }
            }
            NegotiatedTest::Bidir(flow) => {
                info!("bidirectional test requested by {peer}");
                let send_socket = socket.try_clone()?;
                send_socket.connect(peer)?;
                let send_writer = Arc::clone(writer);
                let send_handle = reporter.handle();
                let sender_thread = std::thread::Builder::new()
                    .name("bidir-send".to_string())
                    .spawn(move || {
                        if let Err(e) =
                            udp_sender_on_socket(send_socket, &flow, &send_handle, None, &send_writer)
                        {
                            error!("bidir sender failed: {e}");
                        }
                    })
                    .map_err(Error::Io)?;
                let result =
                    udp_receive_flow(&socket, settings, &handle, writer, false, Some((&buf[..n], peer)));
                let _ = sender_thread.join();
                if let Err(e) = result {
                    error!("udp receive flow failed: {e}");
                }
            }
            NegotiatedTest::Counterflow {
                settings: flow,
                dual,
            } => {
                info!(
                    "{} test requested by {peer}",
                    if dual { "dual" } else { "trade-off" }
                );
                let counter = if dual {
                    let counter_flow = flow.clone();
                    let counter_writer = Arc::clone(writer);
                    let counter_handle = reporter.handle();
                    Some(
                        std::thread::Builder::new()
                            .name("counterflow".to_string())
                            .spawn(move || {
                                run_counterflow(&counter_flow, &counter_handle, &counter_writer)
                            })
                            .map_err(Error::Io)?,
                    )
                } else {
                    None
                };
                let result =
                    udp_receive_flow(&socket, settings, &handle, writer, false, Some((&buf[..n], peer)));
                match counter {
                    Some(join) => {
                        let _ = join.join();
                    }
                    None => run_counterflow(&flow, &handle, writer),
                }
                if let Err(e) = result {
                    error!("udp receive flow failed: {e}");
                }
            }
            NegotiatedTest::None => {
                if let Err(e) =
                    udp_receive_flow(&socket, settings, &handle, writer, false, Some((&buf[..n], peer)))
                {
                    error!("udp receive flow failed: {e}");
                }
            }
        }
    }
    Ok(())
}

/// Receive one UDP flow: parse the inline payload header of every
/// datagram, hand records to the reporter, finish on the negated-id
/// terminal datagram.
pub(crate) fn udp_receive_flow(
    socket: &UdpSocket,
    settings: &Config,
    reporter: &ReporterHandle,
    writer: &Arc<ReportWriter>,
    negate_id: bool,
    first: Option<(&[u8], SocketAddr)>,
) -> Result<()> {
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    let fd = transfer_id_for(socket);
    let transfer_id = if negate_id { -fd.abs() } else { fd };

    let mut settings = settings.clone();
    settings.mode = Mode::Server;

    let mut buf = vec![0u8; settings.effective_buffer_len().max(65536)];
    let mut peer: Option<SocketAddr> = first.map(|(_, p)| p);
    let connected_peer = socket.peer_addr().ok();

    // First datagram: from the caller, or awaited here.
    let (mut pending, mut pending_len): (Option<Vec<u8>>, usize) = match first {
        Some((data, _)) => (Some(data.to_vec()), data.len()),
        None => (None, 0),
    };
    if pending.is_none() {
        loop {
            if interrupted() {
                return Ok(());
            }
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    peer = Some(from);
                    pending = Some(buf[..n].to_vec());
                    pending_len = n;
                    break;
                }
                Err(e) if timed_out(&e) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    // Isochronous flows announce themselves in the first datagram's
    // negotiation header; the isoch block then rides at a fixed offset in
    // every datagram.
    let first_data = pending.as_deref().unwrap_or(&[]);
    let (isoch_offset, mut flow_settings) = match ClientHeader::decode(&first_data[UDP_PAYLOAD_SIZE.min(first_data.len())..]) {
        Ok(hdr) if hdr.flags != 0 => {
            let isoch = hdr.flags & crate::protocol::HEADER_UDPTESTS != 0
                && hdr.udp_tests.test_flags & TEST_UDP_ISOCH != 0;
            if isoch && settings.isochronous.is_none() {
                settings.isochronous = Some(crate::config::IsochConfig {
                    frames_per_sec: 0,
                    mean_bps: 0,
                    variance: 0,
                });
                settings.enhanced = true;
            }
            (
                isoch.then_some(UDP_PAYLOAD_SIZE + hdr.wire_size()),
                settings.clone(),
            )
        }
        _ => (None, settings.clone()),
    };
    flow_settings.mode = Mode::Server;

    let local = socket.local_addr()?;
    let peer_addr = peer.or(connected_peer).unwrap_or(local);
    let conn = ConnectionInfo {
        peer: peer_addr,
        local,
        peer_version: None,
        connect_time_ms: 0.0,
        tx_holdback_secs: 0.0,
        epoch_start: Timestamp::now(),
        win_size: flow_settings.window_size.unwrap_or(0),
        win_size_requested: flow_settings.window_size.unwrap_or(0),
        flags: 0,
        flags_extend: 0,
        format: flow_settings.format,
    };
    let (mut head, sender) = ReportHeader::new(
        &flow_settings,
        transfer_id,
        PacketHandler::UdpRecv,
        None,
        reporter.wake_condition(),
    );
    head.data.connection = Some(conn.clone());
    report_connection(writer, transfer_id, &conn);
    head.data.set_epoch(Timestamp::now());
    reporter.post_report(head);

    let interval = flow_settings.interval;
    let mut last_record = Instant::now();

    loop {
        let (n, data): (usize, &[u8]) = if let Some(p) = pending.take() {
            buf[..pending_len].copy_from_slice(&p);
            (pending_len, &buf[..pending_len])
        } else {
            if interrupted() {
                debug!("udp receiver {transfer_id} interrupted");
                break;
            }
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if peer.is_some_and(|p| p != from) {
                        // Another client mid-test; single flow at a time.
                        continue;
                    }
                    (n, &buf[..n])
                }
                Err(e) if timed_out(&e) => {
                    if !interval.is_zero() && last_record.elapsed() >= interval {
                        sender.report_packet(PacketRecord::empty_at(Timestamp::now()));
                        last_record = Instant::now();
                    }
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("udp receiver {transfer_id} failed: {e}");
                    break;
                }
            }
        };

        let Some(payload) = UdpPayload::read_from(data) else {
            continue;
        };
        let now = Timestamp::now();
        last_record = Instant::now();
        let mut record = PacketRecord {
            packet_id: payload.id,
            packet_len: n as u64,
            sent_time: payload.sent_time,
            packet_time: now,
            socket: transfer_id,
            ..Default::default()
        };
        if let Some(offset) = isoch_offset {
            if let Some(block) = IsochPayload::read_from(&data[offset.min(data.len())..]) {
                record.isoch_start_time = block.start_time;
                record.prev_frame_id = block.prev_frame_id as i64;
                record.frame_id = block.frame_id as i64;
                record.burst_size = block.burst_size as u64;
                record.burst_period = block.burst_period as u64;
                record.remaining = block.remaining as u64;
            }
        }
        if payload.id < 0 {
            // Terminal datagram.
            sender.close_report(record);
            sender.end_report();
            return Ok(());
        }
        sender.report_packet(record);
    }

    let now = Timestamp::now();
    sender.close_report(PacketRecord {
        sent_time: now,
        packet_time: now,
        socket: transfer_id,
        ..Default::default()
    });
    sender.end_report();
    Ok(())
}
