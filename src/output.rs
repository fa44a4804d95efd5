//! Report formatting.
//!
//! All row shaping lives here; the reporter only hands over
//! `TransferInfo` snapshots. Output is serialized through a single
//! [`ReportWriter`] so interval rows, SUM rows and the banners that
//! bypass the reporter never interleave mid-line.

use crate::config::{Config, Mode, Protocol};
use crate::report::{ConnectionInfo, TransferInfo};
use crate::reporter::{latency_suppressed, ReportRow, ReportSink};
use crate::stats::SockCallStats;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

/// Serialized sink for everything the process prints.
pub struct ReportWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl ReportWriter {
    pub fn stdout() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Box::new(io::stdout())),
        })
    }

    pub fn to_file(path: &str) -> io::Result<Arc<Self>> {
        let file = File::create(path)?;
        Ok(Arc::new(Self {
            inner: Mutex::new(Box::new(file)),
        }))
    }

    pub fn writeln(&self, line: &str) {
        let mut w = self.inner.lock();
        let _ = writeln!(w, "{line}");
        let _ = w.flush();
    }
}

/// Scale a byte count per the `-f` format character. Adaptive (`a`) picks
/// the largest unit that keeps the value above one.
pub fn format_bytes(bytes: f64, format: char) -> String {
    const KILO: f64 = 1024.0;
    let (value, unit) = match format {
        'K' => (bytes / KILO, "KBytes"),
        'M' => (bytes / (KILO * KILO), "MBytes"),
        'G' => (bytes / (KILO * KILO * KILO), "GBytes"),
        'k' => (bytes * 8.0 / 1000.0, "Kbits"),
        'm' => (bytes * 8.0 / 1e6, "Mbits"),
        'g' => (bytes * 8.0 / 1e9, "Gbits"),
        _ => {
            if bytes >= KILO * KILO * KILO {
                (bytes / (KILO * KILO * KILO), "GBytes")
            } else if bytes >= KILO * KILO {
                (bytes / (KILO * KILO), "MBytes")
            } else {
                (bytes / KILO, "KBytes")
            }
        }
    };
    format!("{value:6.2} {unit:>7}")
}

/// Scale a bit rate per the `-f` format character.
pub fn format_rate(bits_per_second: f64, format: char) -> String {
    let (value, unit) = match format {
        'k' | 'K' => (bits_per_second / 1000.0, "Kbits/sec"),
        'm' | 'M' => (bits_per_second / 1e6, "Mbits/sec"),
        'g' | 'G' => (bits_per_second / 1e9, "Gbits/sec"),
        _ => {
            if bits_per_second >= 1e9 {
                (bits_per_second / 1e9, "Gbits/sec")
            } else {
                (bits_per_second / 1e6, "Mbits/sec")
            }
        }
    };
    format!("{value:6.2} {unit:>10}")
}

fn bits_per_second(info: &TransferInfo) -> f64 {
    let secs = info.seconds();
    if secs > 0.0 {
        info.total_len as f64 * 8.0 / secs
    } else {
        0.0
    }
}

fn id_tag(info: &TransferInfo, sum: bool) -> String {
    if sum {
        "[SUM]".to_string()
    } else {
        format!("[{:3}]", info.transfer_id)
    }
}

/// Console/file sink for the reporter.
pub struct ConsoleSink {
    writer: Arc<ReportWriter>,
    csv: bool,
    local_host: String,
    remote_host: String,
    port: u16,
    header_printed: bool,
}

impl ConsoleSink {
    pub fn new(writer: Arc<ReportWriter>, settings: &Config) -> Self {
        Self {
            writer,
            csv: settings.csv,
            local_host: settings
                .bind_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            remote_host: settings.server_addr.clone().unwrap_or_default(),
            port: settings.port,
            header_printed: false,
        }
    }

    fn column_header(&self, info: &TransferInfo) -> &'static str {
        let receiving = matches!(info.sock_callstats, SockCallStats::Read(_));
        match (info.protocol, receiving, info.enhanced) {
            (Protocol::Udp, true, false) => {
                "[ ID] Interval       Transfer     Bandwidth        Jitter   Lost/Total Datagrams"
            }
            (Protocol::Udp, true, true) => {
                "[ ID] Interval       Transfer     Bandwidth        Jitter   Lost/Total \
                 Latency avg/min/max/stdev PPS"
            }
            (Protocol::Udp, false, true) => {
                "[ ID] Interval       Transfer     Bandwidth      Write/Err  PPS"
            }
            (Protocol::Tcp, false, true) => {
                "[ ID] Interval       Transfer     Bandwidth      Write/Err  Rtry     Cwnd/RTT"
            }
            (Protocol::Tcp, true, true) => {
                "[ ID] Interval       Transfer     Bandwidth       Reads   Dist(bin=len/8)"
            }
            _ => "[ ID] Interval       Transfer     Bandwidth",
        }
    }

    fn human_row(&mut self, info: &TransferInfo, sum: bool) {
        if !self.header_printed {
            self.writer.writeln(self.column_header(info));
            self.header_printed = true;
        }
        let mut line = format!(
            "{} {:4.1}-{:4.1} sec  {}  {}",
            id_tag(info, sum),
            info.start_time,
            info.end_time,
            format_bytes(info.total_len as f64, info.format),
            format_rate(bits_per_second(info), info.format),
        );
        match &info.sock_callstats {
            SockCallStats::Read(reads) => {
                if info.protocol == Protocol::Udp {
                    line.push_str(&self.udp_receive_columns(info, sum));
                } else if info.enhanced {
                    let bins = reads
                        .bins
                        .iter()
                        .map(|b| b.to_string())
                        .collect::<Vec<_>>()
                        .join(":");
                    line.push_str(&format!("  {:>6}   {}", reads.cnt, bins));
                }
            }
            SockCallStats::Write(writes) => {
                if info.enhanced {
                    line.push_str(&format!("  {}/{}", writes.cnt, writes.err));
                    if info.protocol == Protocol::Tcp {
                        line.push_str(&format!(
                            "  {:>4}  {:>4}K/{} us",
                            writes.tcp_retry,
                            writes.cwnd / 1024,
                            writes.rtt
                        ));
                    } else if info.seconds() > 0.0 {
                        let pps = info.cnt_datagrams as f64 / info.seconds();
                        line.push_str(&format!("  {pps:.0} pps"));
                    }
                }
            }
        }
        self.writer.writeln(&line);
        self.extra_rows(info, sum);
    }

    fn udp_receive_columns(&self, info: &TransferInfo, sum: bool) -> String {
        // Assume out-of-order arrivals are not duplicates and net them out
        // of the loss count.
        let lost = (info.cnt_error - info.cnt_out_of_order).max(0);
        let total = info.cnt_datagrams + lost;
        let pct = if total > 0 {
            lost as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        let mut cols = format!(
            "  {:6.3} ms {:4}/{:5} ({pct:.2}%)",
            info.jitter * 1000.0,
            lost,
            total
        );
        if info.enhanced && !sum {
            let t = &info.transit;
            let (mean, min, max, stddev, cnt) = if t.cnt > 0 {
                (t.mean, t.min, t.max, t.variance().sqrt(), t.cnt)
            } else {
                (t.tot_mean, t.tot_min, t.tot_max, t.tot_variance().sqrt(), t.tot_cnt)
            };
            if cnt > 0 && !latency_suppressed(min) {
                cols.push_str(&format!(
                    " {:.3}/{:.3}/{:.3}/{:.3} ms",
                    mean * 1000.0,
                    min * 1000.0,
                    max * 1000.0,
                    stddev * 1000.0
                ));
            }
            if info.ipg_cnt > 0 && info.ipg_sum > 0.0 {
                cols.push_str(&format!(
                    " {:.0} pps",
                    info.ipg_cnt as f64 / info.ipg_sum
                ));
            }
        }
        cols
    }

    /// Out-of-order notes, isochronous counters and histogram summaries
    /// printed under the main row.
    fn extra_rows(&self, info: &TransferInfo, sum: bool) {
        if info.cnt_out_of_order > 0 && matches!(info.sock_callstats, SockCallStats::Read(_)) {
            self.writer.writeln(&format!(
                "{} {:4.1}-{:4.1} sec  {} datagrams received out-of-order",
                id_tag(info, sum),
                info.start_time,
                info.end_time,
                info.cnt_out_of_order
            ));
        }
        if info.l2counts.cnt > 0 {
            self.writer.writeln(&format!(
                "{} {:4.1}-{:4.1} sec  L2 errors {} (len {}, csum {}, unknown {})",
                id_tag(info, sum),
                info.start_time,
                info.end_time,
                info.l2counts.cnt,
                info.l2counts.length_err,
                info.l2counts.udp_csum_err,
                info.l2counts.unknown
            ));
        }
        if let Some(isoch) = &info.isoch {
            if isoch.frame_cnt > 0 || isoch.frame_lost_cnt > 0 || isoch.slip_cnt > 0 {
                self.writer.writeln(&format!(
                    "{} {:4.1}-{:4.1} sec  isoch frames {} lost {} slips {}",
                    id_tag(info, sum),
                    info.start_time,
                    info.end_time,
                    isoch.frame_cnt,
                    isoch.frame_lost_cnt,
                    isoch.slip_cnt
                ));
            }
        }
        for hist in [&info.latency_histogram, &info.frame_latency_histogram]
            .into_iter()
            .flatten()
        {
            if hist.population() > 0 {
                self.writer.writeln(&format!(
                    "{} {:4.1}-{:4.1} sec  {}",
                    id_tag(info, sum),
                    info.start_time,
                    info.end_time,
                    hist.summary()
                ));
            }
        }
    }

    fn csv_row(&self, info: &TransferInfo, sum: bool) {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let id = if sum { -1 } else { info.transfer_id };
        let local = if self.local_host.is_empty() {
            local_host_name()
        } else {
            self.local_host.clone()
        };
        let mut line = format!(
            "{stamp},{},{},{},{},{id},{:.1}-{:.1},{},{:.0}",
            local,
            0,
            self.remote_host,
            self.port,
            info.start_time,
            info.end_time,
            info.total_len,
            bits_per_second(info),
        );
        if info.protocol == Protocol::Udp {
            let lost = (info.cnt_error - info.cnt_out_of_order).max(0);
            let total = info.cnt_datagrams + lost;
            let pct = if total > 0 {
                lost as f64 * 100.0 / total as f64
            } else {
                0.0
            };
            line.push_str(&format!(
                ",{:.3},{lost},{total},{pct:.3},{}",
                info.jitter * 1000.0,
                info.cnt_out_of_order
            ));
        }
        self.writer.writeln(&line);
    }

    fn row(&mut self, info: &TransferInfo, sum: bool) {
        if self.csv {
            self.csv_row(info, sum);
        } else {
            self.human_row(info, sum);
        }
    }
}

impl ReportSink for ConsoleSink {
    fn emit(&mut self, row: ReportRow) {
        match row {
            ReportRow::Interval(info) => self.row(&info, false),
            ReportRow::Final(info) => self.row(&info, false),
            ReportRow::SumInterval(info) => self.row(&info, true),
            ReportRow::SumFinal(info) => self.row(&info, true),
        }
    }
}

const SEPARATOR: &str = "------------------------------------------------------------";

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Settings banner printed once at startup; bypasses the reporter.
pub fn report_settings(writer: &ReportWriter, settings: &Config) {
    log::debug!(
        "rperf2 {} on {} ({} {})",
        crate::VERSION,
        local_host_name(),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    writer.writeln(SEPARATOR);
    match settings.mode {
        Mode::Server => {
            let proto = match settings.protocol {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
            };
            writer.writeln(&format!("Server listening on {} port {}", proto, settings.port));
        }
        Mode::Client => {
            let proto = match settings.protocol {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
            };
            writer.writeln(&format!(
                "Client connecting to {}, {} port {}",
                settings.server_addr.as_deref().unwrap_or("?"),
                proto,
                settings.port
            ));
            if settings.protocol == Protocol::Udp {
                writer.writeln(&format!(
                    "Sending {} byte datagrams",
                    settings.effective_buffer_len()
                ));
            }
        }
    }
    if let Some(win) = settings.window_size {
        writer.writeln(&format!("TCP window size: {}", format_bytes(win as f64, 'a').trim()));
    }
    writer.writeln(SEPARATOR);
}

/// Connection row printed when a flow's socket pair is established.
pub fn report_connection(writer: &ReportWriter, transfer_id: i32, conn: &ConnectionInfo) {
    let mut line = format!(
        "[{:3}] local {} port {} connected with {} port {}",
        transfer_id,
        conn.local.ip(),
        conn.local.port(),
        conn.peer.ip(),
        conn.peer.port()
    );
    if let Some(version) = &conn.peer_version {
        line.push_str(&format!(" (peer {version})"));
    }
    if conn.connect_time_ms > 0.0 {
        line.push_str(&format!(" (ct={:.2} ms)", conn.connect_time_ms));
    }
    writer.writeln(&line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_adaptive() {
        assert!(format_bytes(512.0, 'a').contains("KBytes"));
        assert!(format_bytes(2.5 * 1024.0 * 1024.0, 'a').contains("MBytes"));
        assert!(format_bytes(3.0 * 1024.0 * 1024.0 * 1024.0, 'a').contains("GBytes"));
    }

    #[test]
    fn test_format_bytes_fixed_units() {
        let s = format_bytes(1024.0 * 1024.0, 'K');
        assert!(s.contains("1024.00"));
        assert!(s.contains("KBytes"));
        let s = format_bytes(1_000_000.0 / 8.0, 'm');
        assert!(s.contains("Mbits"));
    }

    #[test]
    fn test_format_rate() {
        assert!(format_rate(1_050_000.0, 'a').contains("Mbits/sec"));
        assert!(format_rate(2.5e9, 'a').contains("Gbits/sec"));
        assert!(format_rate(500_000.0, 'k').contains("Kbits/sec"));
    }
}
