// Reporter invariants driven through the public flow API: interval rows
// per elapsed boundary, byte-exact SUM rows, UDP accounting identities,
// and the -i 0 final-only mode.

use rperf2::config::{Config, Protocol};
use rperf2::report::{MultiHeader, PacketHandler, PacketRecord, ReportHeader};
use rperf2::reporter::{Reporter, ReportRow, VecSink};
use rperf2::timing::Timestamp;
use std::sync::Arc;
use std::time::Duration;

const EPOCH: Timestamp = Timestamp {
    secs: 10_000,
    usecs: 0,
};

fn udp_config(interval_secs: f64, parallel: usize) -> Config {
    let mut cfg = Config::client("10.0.0.2".to_string(), 5001);
    cfg.protocol = Protocol::Udp;
    cfg.parallel = parallel;
    if interval_secs > 0.0 {
        cfg.interval = Duration::from_secs_f64(interval_secs);
    }
    cfg
}

fn record(id: i64, at_secs: f64, len: u64) -> PacketRecord {
    let t = EPOCH.add_secs(at_secs);
    PacketRecord {
        packet_id: id,
        packet_len: len,
        sent_time: t,
        packet_time: t,
        ..Default::default()
    }
}

/// Drive one synthetic UDP receive flow through the reporter.
fn drive_flow(
    reporter: &Reporter,
    cfg: &Config,
    multi: Option<Arc<MultiHeader>>,
    transfer_id: i32,
    ids: &[i64],
    len: u64,
    step_secs: f64,
) {
    let (mut head, sender) = ReportHeader::new(
        cfg,
        transfer_id,
        PacketHandler::UdpRecv,
        multi,
        reporter.wake_condition(),
    );
    head.data.set_epoch(EPOCH);
    reporter.post_report(head);
    let mut at = 0.0;
    for id in ids {
        sender.report_packet(record(*id, at, len));
        at += step_secs;
    }
    let close_id = ids.iter().copied().max().unwrap_or(0) + 1;
    sender.close_report(record(close_id, at, len));
    sender.end_report();
}

#[test]
fn test_one_interval_row_per_elapsed_boundary() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));
    let cfg = udp_config(1.0, 1);
    // 25 packets, 0.1s apart: boundaries at 1.0 and 2.0 inside the run.
    let ids: Vec<i64> = (0..25).collect();
    drive_flow(&reporter, &cfg, None, 3, &ids, 1470, 0.1);
    reporter.shutdown();

    let rows = rows.lock();
    let intervals: Vec<_> = rows
        .iter()
        .filter_map(|r| match r {
            ReportRow::Interval(i) => Some((i.start_time, i.end_time, i.total_len)),
            _ => None,
        })
        .collect();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].0, 0.0);
    assert_eq!(intervals[0].1, 1.0);
    assert_eq!(intervals[1].1, 2.0);

    // Cumulative bytes equal the interval sum plus the final remainder.
    let final_total = rows
        .iter()
        .find_map(|r| match r {
            ReportRow::Final(f) => Some(f.total_len),
            _ => None,
        })
        .expect("final row");
    assert_eq!(final_total, 26 * 1470); // 25 packets + terminal datagram
    let interval_total: u64 = intervals.iter().map(|i| i.2).sum();
    assert!(interval_total <= final_total);
}

#[test]
fn test_interval_zero_emits_only_final_row() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));
    let cfg = udp_config(0.0, 1);
    let ids: Vec<i64> = (0..50).collect();
    drive_flow(&reporter, &cfg, None, 3, &ids, 1000, 0.1);
    reporter.shutdown();

    let rows = rows.lock();
    assert!(rows
        .iter()
        .all(|r| matches!(r, ReportRow::Final(_))));
    assert_eq!(rows.len(), 1);
}

#[test]
fn test_udp_loss_accounting_identity() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));
    let cfg = udp_config(0.0, 1);
    // ids 0..100 with 7 dropped and one late arrival.
    let mut ids: Vec<i64> = (0..100).filter(|i| ![5, 6, 7, 20, 40, 41, 90].contains(i)).collect();
    // 40 arrives late after 50.
    let pos = ids.iter().position(|&i| i == 50).unwrap();
    ids.insert(pos + 1, 40);
    drive_flow(&reporter, &cfg, None, 3, &ids, 100, 0.01);
    reporter.shutdown();

    let rows = rows.lock();
    let info = rows
        .iter()
        .find_map(|r| match r {
            ReportRow::Final(f) => Some(f.clone()),
            _ => None,
        })
        .expect("final row");
    // datagrams_received + lost = max(packet_id)+1, modulo out-of-order:
    // the late datagram was counted lost at gap time and received later.
    assert_eq!(info.cnt_out_of_order, 1);
    assert_eq!(
        info.cnt_datagrams + info.cnt_error - info.cnt_out_of_order,
        101 // ids 0..=99 plus the terminal datagram
    );
}

#[test]
fn test_sum_rows_are_byte_exact_across_parallel_flows() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));
    let cfg = udp_config(1.0, 4);
    let multi = MultiHeader::allocate(&cfg);
    assert!(multi.group_id < 0);

    let mut joins = Vec::new();
    for flow in 0..4 {
        let reporter_handle = reporter.handle();
        let cfg = cfg.clone();
        let multi = Arc::clone(&multi);
        joins.push(std::thread::spawn(move || {
            let (mut head, sender) = ReportHeader::new(
                &cfg,
                10 + flow,
                PacketHandler::UdpRecv,
                Some(multi),
                reporter_handle.wake_condition(),
            );
            head.data.set_epoch(EPOCH);
            reporter_handle.post_report(head);
            // Each flow: 30 packets, 0.1s apart, distinct sizes.
            let len = 1000 + flow as u64 * 10;
            let mut at = 0.0;
            for id in 0..30i64 {
                sender.report_packet(record(id, at, len));
                at += 0.1;
            }
            sender.close_report(record(30, at, len));
            sender.end_report();
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    reporter.shutdown();

    let rows = rows.lock();
    // Per interval boundary: the SUM row's bytes equal the sum of the
    // four per-flow rows for that boundary, and it comes after them.
    for boundary in [1.0f64, 2.0, 3.0] {
        let flow_sum: u64 = rows
            .iter()
            .filter_map(|r| match r {
                ReportRow::Interval(i) if i.end_time == boundary => Some(i.total_len),
                _ => None,
            })
            .sum();
        let sum_row = rows
            .iter()
            .position(|r| matches!(r, ReportRow::SumInterval(i) if i.end_time == boundary))
            .expect("sum row for boundary");
        let last_flow_row = rows
            .iter()
            .rposition(|r| matches!(r, ReportRow::Interval(i) if i.end_time == boundary))
            .expect("flow rows for boundary");
        match &rows[sum_row] {
            ReportRow::SumInterval(i) => assert_eq!(i.total_len, flow_sum),
            _ => unreachable!(),
        }
        assert!(
            sum_row > last_flow_row,
            "SUM for {boundary} emitted before all flow rows"
        );
    }

    // Final SUM equals the sum of per-flow finals and comes last of the
    // final rows.
    let finals: Vec<u64> = rows
        .iter()
        .filter_map(|r| match r {
            ReportRow::Final(f) => Some(f.total_len),
            _ => None,
        })
        .collect();
    assert_eq!(finals.len(), 4);
    let sum_final = rows
        .iter()
        .find_map(|r| match r {
            ReportRow::SumFinal(f) => Some(f.total_len),
            _ => None,
        })
        .expect("final SUM row");
    assert_eq!(sum_final, finals.iter().sum::<u64>());
    let sum_final_pos = rows
        .iter()
        .position(|r| matches!(r, ReportRow::SumFinal(_)))
        .unwrap();
    let last_final_pos = rows
        .iter()
        .rposition(|r| matches!(r, ReportRow::Final(_)))
        .unwrap();
    assert!(sum_final_pos > last_final_pos);
}

#[test]
fn test_jitter_stays_small_on_steady_transit() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));
    let cfg = udp_config(0.0, 1);
    let (mut head, sender) = ReportHeader::new(
        &cfg,
        3,
        PacketHandler::UdpRecv,
        None,
        reporter.wake_condition(),
    );
    head.data.set_epoch(EPOCH);
    reporter.post_report(head);
    for id in 0..200i64 {
        let sent = EPOCH.add_secs(id as f64 * 0.01);
        let recv = sent.add_secs(0.0004); // constant 400us transit
        sender.report_packet(PacketRecord {
            packet_id: id,
            packet_len: 100,
            sent_time: sent,
            packet_time: recv,
            ..Default::default()
        });
    }
    sender.close_report(record(200, 2.0, 100));
    sender.end_report();
    reporter.shutdown();

    let rows = rows.lock();
    let info = rows
        .iter()
        .find_map(|r| match r {
            ReportRow::Final(f) => Some(f.clone()),
            _ => None,
        })
        .expect("final row");
    assert!(info.jitter < 0.001, "jitter {} too high", info.jitter);
    assert!(info.transit.tot_cnt > 0);
}
