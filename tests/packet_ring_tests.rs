// Ring and flow-handle behavior across threads: nothing lost, nothing
// duplicated, producers block rather than drop, and end_report only
// returns once the reporter is done with the flow.

use rperf2::config::Config;
use rperf2::packet_ring::{Condition, PacketRing, RING_CAPACITY};
use rperf2::report::{PacketHandler, PacketRecord, ReportHeader};
use rperf2::reporter::{Reporter, ReportRow, VecSink};
use rperf2::timing::Timestamp;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_ring_capacity_constant() {
    assert_eq!(RING_CAPACITY, 5000);
}

#[test]
fn test_full_ring_blocks_and_preserves_everything() {
    // More records than the ring holds; the producer must block, not
    // drop, and FIFO order must survive the wrap.
    const COUNT: u64 = 3 * RING_CAPACITY as u64;
    let ring = Arc::new(PacketRing::<u64>::new(Condition::new()));
    let producer_ring = Arc::clone(&ring);
    let producer = thread::spawn(move || {
        for i in 0..COUNT {
            producer_ring.enqueue(i);
        }
    });
    let mut next = 0u64;
    while next < COUNT {
        match ring.dequeue() {
            Some(v) => {
                assert_eq!(v, next, "record out of order or duplicated");
                next += 1;
            }
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
    assert_eq!(ring.dequeue(), None);
}

#[test]
fn test_cursor_distance_stays_bounded() {
    let ring = Arc::new(PacketRing::<u64>::new(Condition::new()));
    // Fill to capacity - 1; one more enqueue would block.
    for i in 0..(RING_CAPACITY as u64 - 1) {
        ring.enqueue(i);
    }
    // Drain everything back out.
    for i in 0..(RING_CAPACITY as u64 - 1) {
        assert_eq!(ring.dequeue(), Some(i));
    }
    assert!(ring.is_empty());
}

#[test]
fn test_end_report_waits_for_final_summary() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));

    let cfg = Config::client("10.0.0.2".to_string(), 5001);
    let (mut head, sender) = ReportHeader::new(
        &cfg,
        3,
        PacketHandler::TcpSend,
        None,
        reporter.wake_condition(),
    );
    let epoch = Timestamp::from_parts(100, 0);
    head.data.set_epoch(epoch);
    reporter.post_report(head);

    let t = epoch.add(Duration::from_secs(1));
    sender.report_packet(PacketRecord {
        packet_id: 1,
        packet_len: 4096,
        sent_time: t,
        packet_time: t,
        ..Default::default()
    });
    sender.close_report(PacketRecord {
        packet_id: 1,
        sent_time: t,
        packet_time: t,
        ..Default::default()
    });
    // Once end_report returns the final row must already be emitted.
    sender.end_report();
    let emitted = rows.lock().iter().any(|r| matches!(r, ReportRow::Final(_)));
    assert!(emitted, "end_report returned before the final report");
    reporter.shutdown();
}

#[test]
fn test_zero_byte_flow_emits_single_final_row() {
    let sink = VecSink::default();
    let rows = Arc::clone(&sink.rows);
    let reporter = Reporter::start(Box::new(sink));

    let cfg = Config::client("10.0.0.2".to_string(), 5001);
    let (mut head, sender) = ReportHeader::new(
        &cfg,
        3,
        PacketHandler::TcpSend,
        None,
        reporter.wake_condition(),
    );
    let epoch = Timestamp::from_parts(100, 0);
    head.data.set_epoch(epoch);
    reporter.post_report(head);
    sender.close_report(PacketRecord {
        sent_time: epoch,
        packet_time: epoch,
        ..Default::default()
    });
    sender.end_report();
    reporter.shutdown();

    let rows = rows.lock();
    assert_eq!(rows.len(), 1);
    match &rows[0] {
        ReportRow::Final(info) => assert_eq!(info.total_len, 0),
        other => panic!("expected a final row, got {other:?}"),
    }
}
