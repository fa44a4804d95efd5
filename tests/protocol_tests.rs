// Negotiation scenarios through the full pipeline: client settings →
// header → wire bytes → decode → listener-side derived settings.

use rperf2::config::{Config, RateUnits, TestAmount, TestMode};
use rperf2::protocol::{
    decode_amount, derive_client_settings, encode_amount, generate_client_header, ClientHeader,
    NegotiatedTest, EXTEND_REVERSE, HEADER_EXTEND, HEADER_RUN_NOW, HEADER_SEQNO64B,
    HEADER_VERSION1,
};
use rperf2::Protocol;
use std::time::Duration;

fn wire_roundtrip(hdr: &ClientHeader) -> ClientHeader {
    ClientHeader::decode(&hdr.encode()).expect("wire roundtrip")
}

#[test]
fn test_reverse_negotiation_end_to_end() {
    // A client asking for: reverse UDP, 3 seconds, 1 Mbit/sec offered.
    let mut client = Config::client("10.0.0.2".to_string(), 5001).with_protocol(Protocol::Udp);
    client.reverse = true;
    client.rate = Some(1_048_576);
    client.amount = TestAmount::Time(Duration::from_secs(3));

    let hdr = generate_client_header(&client).expect("header");
    assert_eq!(
        hdr.flags & (HEADER_EXTEND | HEADER_VERSION1 | HEADER_SEQNO64B),
        HEADER_EXTEND | HEADER_VERSION1 | HEADER_SEQNO64B
    );
    assert_eq!(hdr.extend.flags & EXTEND_REVERSE, EXTEND_REVERSE);
    assert_eq!(hdr.extend.rate, 1_048_576);

    let server = Config::server(5001).with_protocol(Protocol::Udp);
    match derive_client_settings(&server, "10.0.0.1", &wire_roundtrip(&hdr)) {
        NegotiatedTest::Reverse(flow) => {
            assert_eq!(flow.amount, TestAmount::Time(Duration::from_secs(3)));
            assert_eq!(flow.rate, Some(1_048_576));
            assert_eq!(flow.rate_units, RateUnits::BitsPerSec);
        }
        other => panic!("expected a reverse sender, got {other:?}"),
    }
}

#[test]
fn test_dual_and_tradeoff_negotiation_end_to_end() {
    let mut client = Config::client("10.0.0.2".to_string(), 5001);
    client.test_mode = TestMode::DualTest;
    client.amount = TestAmount::Bytes(5_000_000);
    client.listen_port = 6001;

    let hdr = generate_client_header(&client).expect("header");
    assert!(hdr.flags & HEADER_RUN_NOW != 0);
    assert_eq!(hdr.port, 6001);

    let server = Config::server(5001);
    match derive_client_settings(&server, "192.168.1.7", &wire_roundtrip(&hdr)) {
        NegotiatedTest::Counterflow { settings, dual } => {
            assert!(dual);
            assert_eq!(settings.server_addr.as_deref(), Some("192.168.1.7"));
            assert_eq!(settings.port, 6001);
            assert_eq!(settings.amount, TestAmount::Bytes(5_000_000));
            assert_eq!(settings.parallel, 1);
            // Derived flows never renegotiate.
            assert!(generate_client_header(&settings).is_none());
        }
        other => panic!("expected a dual counter-flow, got {other:?}"),
    }

    client.test_mode = TestMode::TradeOff;
    let hdr = generate_client_header(&client).expect("header");
    assert_eq!(hdr.flags & HEADER_RUN_NOW, 0);
    match derive_client_settings(&server, "192.168.1.7", &wire_roundtrip(&hdr)) {
        NegotiatedTest::Counterflow { dual, .. } => assert!(!dual),
        other => panic!("expected a trade-off counter-flow, got {other:?}"),
    }
}

#[test]
fn test_legacy_peer_is_compat_no_reply() {
    // All-zero base block: a pre-negotiation peer.
    let wire = [0u8; 24];
    let hdr = ClientHeader::decode(&wire).unwrap();
    assert_eq!(hdr.flags, 0);
    let server = Config::server(5001);
    assert_eq!(
        derive_client_settings(&server, "10.0.0.1", &hdr),
        NegotiatedTest::None
    );
}

#[test]
fn test_reserved_bits_survive_server_passthrough() {
    let mut client = Config::client("10.0.0.2".to_string(), 5001);
    client.test_mode = TestMode::DualTest;
    let mut hdr = generate_client_header(&client).expect("header");
    hdr.flags |= 0x00F0_0000; // reserved upper bits from some newer peer
    let decoded = wire_roundtrip(&hdr);
    assert_eq!(decoded.flags, hdr.flags);
    assert_eq!(decoded.encode(), hdr.encode());
    // Unknown bits do not change what the listener does.
    let server = Config::server(5001);
    assert!(matches!(
        derive_client_settings(&server, "10.0.0.1", &decoded),
        NegotiatedTest::Counterflow { .. }
    ));
}

#[test]
fn test_amount_field_laws() {
    for secs in [1u64, 3, 10, 3600] {
        let raw = encode_amount(TestAmount::Time(Duration::from_secs(secs)));
        assert!(raw & 0x8000_0000 != 0, "time mode must set the high bit");
        assert_eq!(
            decode_amount(raw),
            TestAmount::Time(Duration::from_secs(secs)),
            "time {secs}s must round-trip as secs*100 hundredths"
        );
    }
    for bytes in [0u64, 1470, 1_000_000, 0x7FFF_FFFF] {
        let raw = encode_amount(TestAmount::Bytes(bytes));
        assert_eq!(raw & 0x8000_0000, 0);
        assert_eq!(decode_amount(raw), TestAmount::Bytes(bytes));
    }
}

#[test]
fn test_infinite_time_keeps_default_amount() {
    // -t 0 leaves the transmitted amount at the 10 second default; the
    // infinite flag is local.
    let raw = encode_amount(TestAmount::Infinite);
    assert_eq!(decode_amount(raw), TestAmount::Time(Duration::from_secs(10)));
}
