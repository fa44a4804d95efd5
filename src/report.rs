//! Per-flow report state and the traffic-thread-facing handles.
//!
//! A traffic thread gets a [`PacketSender`] wrapping the flow's packet
//! ring; the matching [`ReportHeader`] is handed to the reporter, which
//! owns it until the final report is emitted. Parallel flows share a
//! [`MultiHeader`] carrying the start barrier and the SUM aggregation.

use crate::config::{Config, HistogramConfig, Mode, Protocol, RateUnits, TestAmount};
use crate::histogram::Histogram;
use crate::packet_ring::{Condition, PacketRing};
use crate::stats::{IsochStats, L2Stats, ReadStats, SockCallStats, TransitStats, WriteStats};
use crate::timing::Timestamp;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// L2 error bits carried in PacketRecord::l2_errors.
pub const L2_UNKNOWN: u32 = 0x01;
pub const L2_LENERR: u32 = 0x02;
pub const L2_CSUMERR: u32 = 0x04;

/// Outcome of the write call that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteErr {
    #[default]
    None,
    /// Retryable failure, counted against WriteStats.
    Account,
    /// Flow aborts; the reporter emits a partial final row.
    Fatal,
    /// Failure that is neither counted nor fatal.
    NoAccount,
}

/// The unit carried on the packet ring.
///
/// When `empty` is set no packet was seen; only the timestamps are
/// meaningful and the reporter uses the record to advance interval
/// boundaries on an idle flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketRecord {
    pub packet_id: i64,
    pub packet_len: u64,
    pub sent_time: Timestamp,
    pub packet_time: Timestamp,
    pub err_write: WriteErr,
    pub empty: bool,
    pub socket: i32,
    pub l2_errors: u32,
    pub l2_len: u32,
    pub expected_l2_len: u32,
    // Isochronous bookkeeping, zero unless the flow is isochronous.
    pub isoch_start_time: Timestamp,
    pub prev_frame_id: i64,
    pub frame_id: i64,
    pub burst_size: u64,
    pub burst_period: u64,
    pub remaining: u64,
}

impl PacketRecord {
    /// A tick record for an idle flow.
    pub fn empty_at(now: Timestamp) -> Self {
        Self {
            empty: true,
            packet_time: now,
            sent_time: now,
            ..Default::default()
        }
    }
}

/// Per-packet processing discriminator, replacing the C function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketHandler {
    TcpSend,
    TcpRecv,
    UdpSend,
    UdpRecv,
}

impl PacketHandler {
    pub fn from_settings(protocol: Protocol, sending: bool) -> Self {
        match (protocol, sending) {
            (Protocol::Tcp, true) => PacketHandler::TcpSend,
            (Protocol::Tcp, false) => PacketHandler::TcpRecv,
            (Protocol::Udp, true) => PacketHandler::UdpSend,
            (Protocol::Udp, false) => PacketHandler::UdpRecv,
        }
    }

    pub fn is_sender(&self) -> bool {
        matches!(self, PacketHandler::TcpSend | PacketHandler::UdpSend)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, PacketHandler::UdpSend | PacketHandler::UdpRecv)
    }
}

/// Public snapshot of a flow at an interval boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInfo {
    pub transfer_id: i32,
    pub group_id: i32,
    pub cnt_error: i64,
    pub cnt_out_of_order: i64,
    pub cnt_datagrams: i64,
    pub ipg_cnt: i64,
    pub socket: i32,
    pub transit: TransitStats,
    pub sock_callstats: SockCallStats,
    pub total_len: u64,
    pub jitter: f64,
    /// Interval bounds, seconds since the flow epoch.
    pub start_time: f64,
    pub end_time: f64,
    pub ipg_sum: f64,
    pub trip_time: f64,
    pub format: char,
    pub enhanced: bool,
    pub ttl: u32,
    pub protocol: Protocol,
    pub l2counts: L2Stats,
    pub isoch: Option<IsochStats>,
    pub frame: TransitStats,
    #[serde(skip)]
    pub latency_histogram: Option<Histogram>,
    #[serde(skip)]
    pub frame_latency_histogram: Option<Histogram>,
}

impl TransferInfo {
    pub fn new(transfer_id: i32, group_id: i32, settings: &Config, handler: PacketHandler) -> Self {
        let sock_callstats = if handler.is_sender() {
            SockCallStats::Write(WriteStats::default())
        } else {
            SockCallStats::Read(ReadStats::new(settings.effective_buffer_len()))
        };
        let latency_histogram = settings
            .rx_histogram
            .filter(|_| !handler.is_sender())
            .map(|cfg| Histogram::new(&format!("T{transfer_id}"), cfg));
        let (isoch, frame_latency_histogram) = match settings.isochronous {
            Some(cfg) => (
                Some(IsochStats {
                    fps: cfg.frames_per_sec,
                    mean: cfg.mean_bps as f64,
                    variance: cfg.variance as f64,
                    ..Default::default()
                }),
                (!handler.is_sender()).then(|| {
                    Histogram::new(
                        &format!("F{transfer_id}"),
                        settings.rx_histogram.unwrap_or_else(HistogramConfig::default),
                    )
                }),
            ),
            None => (None, None),
        };
        Self {
            transfer_id,
            group_id,
            cnt_error: 0,
            cnt_out_of_order: 0,
            cnt_datagrams: 0,
            ipg_cnt: 0,
            socket: -1,
            transit: TransitStats::default(),
            sock_callstats,
            total_len: 0,
            jitter: 0.0,
            start_time: 0.0,
            end_time: 0.0,
            ipg_sum: 0.0,
            trip_time: 0.0,
            format: settings.format,
            enhanced: settings.enhanced,
            ttl: settings.ttl.unwrap_or(0),
            protocol: settings.protocol,
            l2counts: L2Stats::default(),
            isoch,
            frame: TransitStats::default(),
            latency_histogram,
            frame_latency_histogram,
        }
    }

    /// Interval length in seconds.
    pub fn seconds(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Export this snapshot as a JSON object, for callers that consume
    /// results programmatically instead of through the report rows.
    ///
    /// # Returns
    ///
    /// The serialized snapshot; histograms are omitted (they print
    /// through their own summaries).
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::config::Config;
    /// use rperf2::report::{PacketHandler, TransferInfo};
    ///
    /// let cfg = Config::client("10.0.0.2".to_string(), 5001);
    /// let info = TransferInfo::new(3, 0, &cfg, PacketHandler::TcpSend);
    /// let json = info.to_json().expect("serializable snapshot");
    /// assert!(json.contains("\"transfer_id\":3"));
    /// ```
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Peer/local addressing and connection characteristics for one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub peer_version: Option<String>,
    /// TCP connect() latency, milliseconds.
    pub connect_time_ms: f64,
    pub tx_holdback_secs: f64,
    pub epoch_start: Timestamp,
    pub win_size: usize,
    pub win_size_requested: usize,
    pub flags: u32,
    pub flags_extend: u32,
    pub format: char,
}

/// One per flow: settings snapshot plus the running counters the
/// reporter maintains between records.
#[derive(Debug, Clone)]
pub struct ReporterData {
    pub host: Option<String>,
    pub local_host: Option<String>,
    pub ifr_name: Option<String>,
    pub ssm_multicast: Option<String>,
    pub cnt_error: i64,
    pub last_error: i64,
    pub cnt_out_of_order: i64,
    pub last_out_of_order: i64,
    pub cnt_datagrams: i64,
    pub last_datagrams: i64,
    pub packet_id: i64,
    pub buf_len: usize,
    pub mss: u32,
    pub tcp_win: usize,
    pub rate: u64,
    pub rate_units: RateUnits,
    pub thread_mode: Mode,
    pub amount: TestAmount,
    pub port: u16,
    pub total_len: u64,
    pub last_total: u64,
    pub info: TransferInfo,
    pub connection: Option<ConnectionInfo>,
    pub start_time: Timestamp,
    pub packet_time: Timestamp,
    pub next_time: Timestamp,
    pub interval: Duration,
    pub ipg_start: Timestamp,
    pub client_start_time: Timestamp,
}

impl ReporterData {
    pub fn new(settings: &Config, transfer_id: i32, group_id: i32, handler: PacketHandler) -> Self {
        let now = Timestamp::now();
        Self {
            host: settings.server_addr.clone(),
            local_host: settings.bind_addr.map(|a| a.to_string()),
            ifr_name: settings.bind_dev.clone(),
            ssm_multicast: settings.ssm_host.clone(),
            cnt_error: 0,
            last_error: 0,
            cnt_out_of_order: 0,
            last_out_of_order: 0,
            cnt_datagrams: 0,
            last_datagrams: 0,
            packet_id: -1,
            buf_len: settings.effective_buffer_len(),
            mss: settings.mss.unwrap_or(0),
            tcp_win: settings.window_size.unwrap_or(0),
            rate: settings.effective_rate(),
            rate_units: settings.rate_units,
            thread_mode: settings.mode,
            amount: settings.amount,
            port: settings.port,
            total_len: 0,
            last_total: 0,
            info: TransferInfo::new(transfer_id, group_id, settings, handler),
            connection: None,
            start_time: now,
            packet_time: now,
            next_time: now.add(settings.interval),
            interval: settings.interval,
            ipg_start: now,
            client_start_time: now,
        }
    }

    /// Re-anchor the flow epoch, typically to the group barrier time.
    pub fn set_epoch(&mut self, epoch: Timestamp) {
        self.start_time = epoch;
        self.packet_time = epoch;
        self.ipg_start = epoch;
        self.next_time = epoch.add(self.interval);
    }
}

/// Per-head drain state, advanced only by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Attached,
    Running,
    Closing,
    Drained,
}

/// Per-flow descriptor owned by the reporter once posted.
pub struct ReportHeader {
    pub data: ReporterData,
    pub handler: PacketHandler,
    pub multi: Option<Arc<MultiHeader>>,
    pub ring: Arc<PacketRing<PacketRecord>>,
    pub state: FlowState,
    /// Transit of the previous packet, for the RFC 1889 jitter form.
    pub last_transit: f64,
    pub isoch_prev_frame: i64,
    /// Cumulative histograms; the ones in `info` are interval windows.
    pub total_latency_histogram: Option<Histogram>,
    pub total_frame_histogram: Option<Histogram>,
}

impl ReportHeader {
    /// `init_report`: build the head and the producer handle in one step.
    pub fn new(
        settings: &Config,
        transfer_id: i32,
        handler: PacketHandler,
        multi: Option<Arc<MultiHeader>>,
        wake: Arc<Condition>,
    ) -> (ReportHeader, PacketSender) {
        let ring = Arc::new(PacketRing::new(wake));
        let group_id = multi.as_ref().map_or(0, |m| m.group_id);
        let data = ReporterData::new(settings, transfer_id, group_id, handler);
        let total_latency_histogram = data.info.latency_histogram.clone();
        let total_frame_histogram = data.info.frame_latency_histogram.clone();
        let head = ReportHeader {
            data,
            handler,
            multi,
            ring: Arc::clone(&ring),
            state: FlowState::Attached,
            last_transit: 0.0,
            isoch_prev_frame: 0,
            total_latency_histogram,
            total_frame_histogram,
        };
        (head, PacketSender { ring })
    }
}

/// Producer-side handle to a posted flow.
///
/// The traffic thread reports each I/O unit, posts a final record, then
/// waits for the reporter to finish with the flow.
#[derive(Clone)]
pub struct PacketSender {
    ring: Arc<PacketRing<PacketRecord>>,
}

impl PacketSender {
    /// `report_packet`: blocks when the ring is full; never drops.
    pub fn report_packet(&self, record: PacketRecord) {
        self.ring.enqueue(record);
    }

    /// `close_report`: push the terminal record; the producer stops after
    /// this. A negative packet id is the terminal marker.
    pub fn close_report(&self, mut final_record: PacketRecord) {
        final_record.empty = false;
        final_record.packet_id = if final_record.packet_id == 0 {
            -1
        } else {
            -final_record.packet_id.abs()
        };
        self.ring.enqueue(final_record);
    }

    /// `end_report`: wait until the reporter has drained the ring and
    /// printed the final summary.
    pub fn end_report(&self) {
        self.ring.await_done();
    }
}

struct BarrierState {
    arrived: usize,
    released: bool,
}

/// Shared by all flows of one parallel client run.
///
/// Holds the start barrier, the group id, and the SUM aggregation that
/// the reporter maintains. Aggregated counters are only ever mutated from
/// the reporter thread.
pub struct MultiHeader {
    pub group_id: i32,
    pub threads: usize,
    barrier_state: Mutex<BarrierState>,
    barrier_cond: Condvar,
    start_time: Mutex<Option<Timestamp>>,
    pub sum: Mutex<GroupSum>,
}

/// Reporter-side accumulation for the SUM rows.
///
/// Interval contributions are keyed by boundary so the SUM row for
/// interval k goes out exactly when its last member flow reports k, even
/// when ring draining lets one flow run ahead of another.
pub struct GroupSum {
    /// Zeroed-counter prototype for new interval windows.
    pub template: TransferInfo,
    /// Open interval windows keyed by end-boundary microseconds.
    pub windows: BTreeMap<i64, SumWindow>,
    /// Cumulative accumulation feeding the final SUM row.
    pub final_info: TransferInfo,
    /// Flows that have emitted their final report.
    pub done: usize,
}

pub struct SumWindow {
    pub info: TransferInfo,
    pub contributed: usize,
}

static GROUP_ID: Mutex<i32> = Mutex::new(0);

impl MultiHeader {
    /// Create the shared header for a parallel group, allocating the next
    /// (negative) group id under the process-wide lock.
    pub fn allocate(settings: &Config) -> Arc<MultiHeader> {
        let group_id = {
            let mut id = GROUP_ID.lock();
            *id -= 1;
            *id
        };
        let mut info = TransferInfo::new(
            group_id,
            group_id,
            settings,
            PacketHandler::from_settings(settings.protocol, settings.mode == Mode::Client),
        );
        info.group_id = group_id;
        Arc::new(MultiHeader {
            group_id,
            threads: settings.parallel,
            barrier_state: Mutex::new(BarrierState {
                arrived: 0,
                released: false,
            }),
            barrier_cond: Condvar::new(),
            start_time: Mutex::new(None),
            sum: Mutex::new(GroupSum {
                template: info.clone(),
                windows: BTreeMap::new(),
                final_info: info,
                done: 0,
            }),
        })
    }

    /// Arrive-and-wait start barrier. The last arriver records the common
    /// epoch and releases everyone; with one thread this is a no-op.
    pub fn barrier_client(&self) -> Timestamp {
        let mut state = self.barrier_state.lock();
        state.arrived += 1;
        if state.arrived >= self.threads {
            let epoch = Timestamp::now();
            *self.start_time.lock() = Some(epoch);
            state.released = true;
            self.barrier_cond.notify_all();
            epoch
        } else {
            while !state.released {
                self.barrier_cond.wait(&mut state);
            }
            drop(state);
            self.start_time.lock().unwrap_or_else(Timestamp::now)
        }
    }

    pub fn epoch(&self) -> Option<Timestamp> {
        *self.start_time.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_config() -> Config {
        let mut cfg = Config::client("10.0.0.2".to_string(), 5001);
        cfg.interval = Duration::from_secs(1);
        cfg
    }

    #[test]
    fn test_handler_from_settings() {
        assert_eq!(
            PacketHandler::from_settings(Protocol::Udp, true),
            PacketHandler::UdpSend
        );
        assert!(PacketHandler::UdpSend.is_sender());
        assert!(!PacketHandler::TcpRecv.is_sender());
        assert!(PacketHandler::UdpRecv.is_udp());
    }

    #[test]
    fn test_group_ids_are_negative_and_unique() {
        let cfg = test_config();
        let a = MultiHeader::allocate(&cfg);
        let b = MultiHeader::allocate(&cfg);
        assert!(a.group_id < 0);
        assert!(b.group_id < a.group_id);
    }

    #[test]
    fn test_barrier_single_thread_is_noop() {
        let cfg = test_config();
        let multi = MultiHeader::allocate(&cfg);
        let epoch = multi.barrier_client();
        assert_eq!(multi.epoch(), Some(epoch));
    }

    #[test]
    fn test_barrier_releases_all_with_common_epoch() {
        let mut cfg = test_config();
        cfg.parallel = 4;
        let multi = MultiHeader::allocate(&cfg);
        let mut joins = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&multi);
            joins.push(thread::spawn(move || m.barrier_client()));
        }
        let epochs: Vec<Timestamp> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        assert!(epochs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_close_report_negates_packet_id() {
        let cfg = test_config();
        let (head, sender) = ReportHeader::new(
            &cfg,
            3,
            PacketHandler::UdpSend,
            None,
            crate::packet_ring::Condition::new(),
        );
        let mut rec = PacketRecord::default();
        rec.packet_id = 42;
        sender.close_report(rec);
        let out = head.ring.dequeue().unwrap();
        assert_eq!(out.packet_id, -42);
    }

    #[test]
    fn test_reporter_data_epoch_reset() {
        let cfg = test_config();
        let mut data = ReporterData::new(&cfg, 1, 0, PacketHandler::TcpSend);
        let epoch = Timestamp::from_parts(1000, 0);
        data.set_epoch(epoch);
        assert_eq!(data.start_time, epoch);
        assert_eq!(data.next_time, epoch.add(Duration::from_secs(1)));
    }
}
