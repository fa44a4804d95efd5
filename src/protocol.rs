//! Wire-level test negotiation and the UDP payload header.
//!
//! The client writes a fixed-layout big-endian header at the start of the
//! data stream (TCP) or inside the first datagram (UDP) to request
//! dual/trade-off/reverse/bidir counter-flows and propagate the offered
//! load. A peer sending `flags == 0` predates negotiation and is handled
//! in compatibility mode with no reply. Unknown flag bits are ignored but
//! preserved, so newer peers can round-trip through older ones.

use crate::config::{Config, Mode, Protocol, RateUnits, TestAmount, TestMode};
use crate::error::{Error, Result};
use crate::timing::Timestamp;
use std::time::Duration;

// Base header flag bits.
pub const HEADER_EXTEND: u32 = 0x0001;
pub const HEADER_VERSION1: u32 = 0x0002;
pub const HEADER_UDPTESTS: u32 = 0x0004;
pub const HEADER_SEQNO64B: u32 = 0x0008;
pub const HEADER_RUN_NOW: u32 = 0x0010;

// Extend-block flag bits.
pub const EXTEND_REVERSE: u32 = 0x0001;
pub const EXTEND_BIDIR: u32 = 0x0002;
pub const EXTEND_UNITS_PPS: u32 = 0x0004;

// UDP test flag bits.
pub const TEST_L2LENCHECK: u16 = 0x0001;
pub const TEST_L2ETHPIPV6: u16 = 0x0002;
pub const TEST_UDP_ISOCH: u16 = 0x0004;

/// Type tag of the extend block.
pub const CLIENT_HEADER_TYPE: u32 = 0x0001;

pub const VERSION_MAJOR_HEX: u32 = 0x0000_0003;
pub const VERSION_MINOR_HEX: u32 = 0x0000_0001;

pub const BASE_SIZE: usize = 24;
pub const EXTEND_SIZE: usize = 28;
pub const UDP_TESTS_SIZE: usize = 12;

/// Extended negotiation block, present when `HEADER_EXTEND` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeaderExt {
    pub type_id: u32,
    pub length: u32,
    pub flags: u32,
    pub version_u: u32,
    pub version_l: u32,
    pub rate: u32,
    pub reserved: u32,
}

/// UDP test block, present when `HEADER_UDPTESTS` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeaderUdpTests {
    pub test_flags: u16,
    pub tlv_offset: u16,
    pub version_u: u32,
    pub version_l: u32,
}

/// The negotiation header sent from client to listener at test start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeader {
    pub flags: u32,
    pub num_threads: u32,
    pub port: u32,
    pub buffer_len: u32,
    pub window_size: u32,
    /// Raw amount encoding; see [`encode_amount`].
    pub amount: u32,
    pub extend: ClientHeaderExt,
    pub udp_tests: ClientHeaderUdpTests,
}

impl ClientHeader {
    /// Serialized size given the blocks the flags select.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::{ClientHeader, BASE_SIZE, EXTEND_SIZE, HEADER_EXTEND};
    ///
    /// let mut hdr = ClientHeader::default();
    /// assert_eq!(hdr.wire_size(), BASE_SIZE);
    /// hdr.flags |= HEADER_EXTEND;
    /// assert_eq!(hdr.wire_size(), BASE_SIZE + EXTEND_SIZE);
    /// ```
    pub fn wire_size(&self) -> usize {
        let mut size = BASE_SIZE;
        if self.flags & HEADER_EXTEND != 0 {
            size += EXTEND_SIZE;
        }
        if self.flags & HEADER_UDPTESTS != 0 {
            size += UDP_TESTS_SIZE;
        }
        size
    }

    /// Serialize to wire bytes: the big-endian base block followed by
    /// the extend and UDP test blocks their flags announce.
    ///
    /// # Returns
    ///
    /// A buffer of exactly [`ClientHeader::wire_size`] bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::{ClientHeader, BASE_SIZE, HEADER_VERSION1};
    ///
    /// let hdr = ClientHeader {
    ///     flags: HEADER_VERSION1,
    ///     num_threads: 2,
    ///     port: 5001,
    ///     ..Default::default()
    /// };
    /// let wire = hdr.encode();
    /// assert_eq!(wire.len(), BASE_SIZE);
    /// assert_eq!(ClientHeader::decode(&wire).unwrap(), hdr);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.num_threads.to_be_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.buffer_len.to_be_bytes());
        buf.extend_from_slice(&self.window_size.to_be_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        if self.flags & HEADER_EXTEND != 0 {
            buf.extend_from_slice(&self.extend.type_id.to_be_bytes());
            buf.extend_from_slice(&self.extend.length.to_be_bytes());
            buf.extend_from_slice(&self.extend.flags.to_be_bytes());
            buf.extend_from_slice(&self.extend.version_u.to_be_bytes());
            buf.extend_from_slice(&self.extend.version_l.to_be_bytes());
            buf.extend_from_slice(&self.extend.rate.to_be_bytes());
            buf.extend_from_slice(&self.extend.reserved.to_be_bytes());
        }
        if self.flags & HEADER_UDPTESTS != 0 {
            buf.extend_from_slice(&self.udp_tests.test_flags.to_be_bytes());
            buf.extend_from_slice(&self.udp_tests.tlv_offset.to_be_bytes());
            buf.extend_from_slice(&self.udp_tests.version_u.to_be_bytes());
            buf.extend_from_slice(&self.udp_tests.version_l.to_be_bytes());
        }
        buf
    }

    /// Decode a header from the start of `buf`. Unknown flag bits are
    /// carried through untouched.
    ///
    /// # Arguments
    ///
    /// * `buf` - The first bytes of the data stream or datagram payload
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Negotiation`] when the buffer is shorter
    /// than the base block, or than a block the flags announce.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::ClientHeader;
    ///
    /// // An all-zero base block is a pre-negotiation peer.
    /// let hdr = ClientHeader::decode(&[0u8; 24]).unwrap();
    /// assert_eq!(hdr.flags, 0);
    /// assert!(ClientHeader::decode(&[0u8; 10]).is_err());
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BASE_SIZE {
            return Err(Error::Negotiation(format!(
                "header truncated: {} bytes",
                buf.len()
            )));
        }
        let be_u32 =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let be_u16 = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);

        let mut hdr = ClientHeader {
            flags: be_u32(0),
            num_threads: be_u32(4),
            port: be_u32(8),
            buffer_len: be_u32(12),
            window_size: be_u32(16),
            amount: be_u32(20),
            ..Default::default()
        };
        let mut off = BASE_SIZE;
        if hdr.flags & HEADER_EXTEND != 0 {
            if buf.len() < off + EXTEND_SIZE {
                return Err(Error::Negotiation("extend block truncated".to_string()));
            }
            hdr.extend = ClientHeaderExt {
                type_id: be_u32(off),
                length: be_u32(off + 4),
                flags: be_u32(off + 8),
                version_u: be_u32(off + 12),
                version_l: be_u32(off + 16),
                rate: be_u32(off + 20),
                reserved: be_u32(off + 24),
            };
            off += EXTEND_SIZE;
        }
        if hdr.flags & HEADER_UDPTESTS != 0 {
            if buf.len() < off + UDP_TESTS_SIZE {
                return Err(Error::Negotiation("udp test block truncated".to_string()));
            }
            hdr.udp_tests = ClientHeaderUdpTests {
                test_flags: be_u16(off),
                tlv_offset: be_u16(off + 2),
                version_u: be_u32(off + 4),
                version_l: be_u32(off + 8),
            };
        }
        Ok(hdr)
    }
}

/// Encode the amount field: time mode is two's-complement hundredths of a
/// second, negated so the high bit is set; byte mode keeps the high bit
/// clear. Infinite mode transmits the default test time.
///
/// # Examples
///
/// ```
/// use rperf2::config::TestAmount;
/// use rperf2::protocol::encode_amount;
/// use std::time::Duration;
///
/// let raw = encode_amount(TestAmount::Time(Duration::from_secs(3)));
/// assert_eq!(raw, (-300i32) as u32);
/// assert_eq!(encode_amount(TestAmount::Bytes(1470)), 1470);
/// ```
pub fn encode_amount(amount: TestAmount) -> u32 {
    match amount {
        TestAmount::Time(d) => (-((d.as_secs_f64() * 100.0).round() as i64)) as i32 as u32,
        TestAmount::Infinite => {
            (-((crate::config::DEFAULT_TEST_SECS as i64) * 100)) as i32 as u32
        }
        TestAmount::Bytes(b) => (b as u32) & 0x7FFF_FFFF,
    }
}

/// Decode the amount field; the inverse of [`encode_amount`] on all
/// defined values.
///
/// # Examples
///
/// ```
/// use rperf2::config::TestAmount;
/// use rperf2::protocol::decode_amount;
/// use std::time::Duration;
///
/// assert_eq!(
///     decode_amount((-300i32) as u32),
///     TestAmount::Time(Duration::from_secs(3))
/// );
/// assert_eq!(decode_amount(1470), TestAmount::Bytes(1470));
/// ```
pub fn decode_amount(raw: u32) -> TestAmount {
    if raw & 0x8000_0000 != 0 {
        let centisecs = -((raw as i32) as i64);
        TestAmount::Time(Duration::from_millis((centisecs * 10) as u64))
    } else {
        TestAmount::Bytes(raw as u64)
    }
}

/// Build the header a client sends, mirroring its settings. `None` in
/// compatibility mode (-C): pre-negotiation peers get raw payload only.
///
/// # Arguments
///
/// * `settings` - The client's resolved configuration
///
/// # Returns
///
/// The header to place at the start of the data stream, or `None` when
/// the peer must be treated as pre-negotiation.
///
/// # Examples
///
/// ```
/// use rperf2::protocol::{generate_client_header, EXTEND_REVERSE, HEADER_EXTEND};
/// use rperf2::{Config, Protocol};
///
/// let mut cfg = Config::client("10.0.0.2".to_string(), 5001)
///     .with_protocol(Protocol::Udp);
/// cfg.reverse = true;
/// let hdr = generate_client_header(&cfg).expect("negotiating client");
/// assert!(hdr.flags & HEADER_EXTEND != 0);
/// assert!(hdr.extend.flags & EXTEND_REVERSE != 0);
///
/// cfg.compat = true;
/// assert!(generate_client_header(&cfg).is_none());
/// ```
pub fn generate_client_header(settings: &Config) -> Option<ClientHeader> {
    if settings.compat {
        return None;
    }
    let mut flags = HEADER_SEQNO64B;
    let mut extend_flags = 0u32;
    let mut hdr = ClientHeader::default();

    if settings.peer_detect || (settings.test_mode != TestMode::Normal && settings.rate.is_some())
    {
        flags |= HEADER_EXTEND;
    }
    if settings.test_mode != TestMode::Normal || settings.reverse || settings.bidir {
        flags |= HEADER_VERSION1;
        hdr.buffer_len = settings.buffer_len.map_or(0, |len| len as u32);
        hdr.port = if settings.listen_port != 0 {
            settings.listen_port as u32
        } else {
            settings.port as u32
        };
        hdr.num_threads = settings.parallel as u32;
        hdr.amount = encode_amount(settings.amount);
        hdr.window_size = settings.window_size.unwrap_or(0) as u32;
        if settings.test_mode == TestMode::DualTest {
            flags |= HEADER_RUN_NOW;
        }
    }
    if settings.protocol == Protocol::Udp {
        let mut test_flags = 0u16;
        if settings.isochronous.is_some() {
            test_flags |= TEST_UDP_ISOCH;
        }
        // L2 length checks ride on the same block.
        if test_flags != 0 {
            flags |= HEADER_UDPTESTS;
            hdr.udp_tests = ClientHeaderUdpTests {
                test_flags,
                tlv_offset: 0, // set below once the flag set is final
                version_u: VERSION_MAJOR_HEX,
                version_l: VERSION_MINOR_HEX,
            };
        }
    }
    if settings.reverse {
        flags |= HEADER_EXTEND;
        extend_flags |= EXTEND_REVERSE;
    }
    if settings.bidir {
        flags |= HEADER_EXTEND;
        extend_flags |= EXTEND_BIDIR;
    }
    if flags & HEADER_EXTEND != 0 {
        if settings.rate_units == RateUnits::PacketsPerSec {
            extend_flags |= EXTEND_UNITS_PPS;
        }
        hdr.extend = ClientHeaderExt {
            type_id: CLIENT_HEADER_TYPE,
            length: (EXTEND_SIZE - 8) as u32,
            flags: extend_flags,
            version_u: VERSION_MAJOR_HEX,
            version_l: VERSION_MINOR_HEX,
            rate: settings.rate.map_or(0, |r| r as u32),
            reserved: 0,
        };
    }
    hdr.flags = flags;
    if flags & HEADER_UDPTESTS != 0 {
        hdr.udp_tests.tlv_offset = (UDP_PAYLOAD_SIZE + hdr.wire_size()) as u16;
    }
    Some(hdr)
}

/// What a decoded header asks the listener to do.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatedTest {
    /// Legacy or normal peer: receive only, no reply.
    None,
    /// Server becomes the sender on the same connection.
    Reverse(Config),
    /// Server adds a concurrent sender on the same connection.
    Bidir(Config),
    /// Server connects back to the peer and runs a client flow there;
    /// `dual` runs it concurrently (DualTest), otherwise after (TradeOff).
    Counterflow { settings: Config, dual: bool },
}

/// Listener-side derivation of the counter-flow settings from a decoded
/// header, the analogue of the client-settings generation the original
/// listener performs. Unknown bits are ignored; BIDIR wins over REVERSE.
///
/// # Arguments
///
/// * `server` - The listener's own settings, the template for the flow
/// * `peer_host` - The requesting client's address, for connect-back
/// * `hdr` - The decoded negotiation header
///
/// # Returns
///
/// What the listener should do: nothing special, become the sender, add
/// a concurrent sender, or connect back and run a client flow.
///
/// # Examples
///
/// ```
/// use rperf2::protocol::{derive_client_settings, ClientHeader, NegotiatedTest};
/// use rperf2::Config;
///
/// let server = Config::server(5001);
/// let legacy = ClientHeader::default();
/// assert_eq!(
///     derive_client_settings(&server, "10.0.0.1", &legacy),
///     NegotiatedTest::None
/// );
/// ```
pub fn derive_client_settings(
    server: &Config,
    peer_host: &str,
    hdr: &ClientHeader,
) -> NegotiatedTest {
    if hdr.flags == 0 {
        return NegotiatedTest::None;
    }
    if hdr.flags & HEADER_EXTEND != 0 {
        let ext = hdr.extend.flags;
        if ext & (EXTEND_BIDIR | EXTEND_REVERSE) != 0 {
            let mut flow = server.clone();
            flow.mode = Mode::Server;
            // The derived flow must not renegotiate with its own peer.
            flow.compat = true;
            flow.amount = decode_amount(hdr.amount);
            if flow.rate.is_none() && hdr.extend.rate != 0 {
                flow.rate = Some(hdr.extend.rate as u64);
                flow.rate_units = if ext & EXTEND_UNITS_PPS != 0 {
                    RateUnits::PacketsPerSec
                } else {
                    RateUnits::BitsPerSec
                };
            }
            return if ext & EXTEND_BIDIR != 0 {
                NegotiatedTest::Bidir(flow)
            } else {
                NegotiatedTest::Reverse(flow)
            };
        }
    }
    if hdr.flags & HEADER_VERSION1 != 0 {
        let mut flow = server.clone();
        flow.mode = Mode::Client;
        // The derived flow must not renegotiate with its own peer.
        flow.compat = true;
        flow.server_addr = Some(peer_host.to_string());
        flow.port = hdr.port as u16;
        flow.parallel = 1;
        if hdr.buffer_len != 0 {
            flow.buffer_len = Some(hdr.buffer_len as usize);
        }
        flow.amount = decode_amount(hdr.amount);
        if flow.rate.is_none() && hdr.flags & HEADER_EXTEND != 0 && hdr.extend.rate != 0 {
            flow.rate = Some(hdr.extend.rate as u64);
            flow.rate_units = if hdr.extend.flags & EXTEND_UNITS_PPS != 0 {
                RateUnits::PacketsPerSec
            } else {
                RateUnits::BitsPerSec
            };
        }
        let dual = hdr.flags & HEADER_RUN_NOW != 0;
        flow.test_mode = if dual {
            TestMode::DualTest
        } else {
            TestMode::TradeOff
        };
        return NegotiatedTest::Counterflow {
            settings: flow,
            dual,
        };
    }
    NegotiatedTest::None
}

/// Size of the inline per-datagram header.
pub const UDP_PAYLOAD_SIZE: usize = 16;

/// Inline header stamped into every UDP datagram: a sequence id split
/// into lower/upper halves (the upper half rides in the fourth word when
/// SEQNO64B is negotiated) and the send timestamp.
///
/// The terminal datagram of a flow carries a negated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPayload {
    pub id: i64,
    pub sent_time: Timestamp,
}

impl UdpPayload {
    /// # Arguments
    ///
    /// * `id` - Sequence id; negate it for the terminal datagram
    /// * `sent_time` - The sender's wall-clock send time
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::UdpPayload;
    /// use rperf2::timing::Timestamp;
    ///
    /// let payload = UdpPayload::new(42, Timestamp::from_parts(100, 0));
    /// assert_eq!(payload.id, 42);
    /// ```
    pub fn new(id: i64, sent_time: Timestamp) -> Self {
        Self { id, sent_time }
    }

    /// Stamp the header into the first 16 bytes of a datagram buffer.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::{UdpPayload, UDP_PAYLOAD_SIZE};
    /// use rperf2::timing::Timestamp;
    ///
    /// let payload = UdpPayload::new(7, Timestamp::from_parts(100, 500));
    /// let mut buf = [0u8; UDP_PAYLOAD_SIZE];
    /// payload.write_to(&mut buf);
    /// assert_eq!(UdpPayload::read_from(&buf), Some(payload));
    /// ```
    pub fn write_to(&self, buf: &mut [u8]) {
        let lower = (self.id & 0xFFFF_FFFF) as u32;
        let upper = ((self.id >> 32) & 0xFFFF_FFFF) as u32;
        buf[0..4].copy_from_slice(&lower.to_be_bytes());
        buf[4..8].copy_from_slice(&(self.sent_time.secs as u32).to_be_bytes());
        buf[8..12].copy_from_slice(&(self.sent_time.usecs as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&upper.to_be_bytes());
    }

    /// Parse the header from the start of a received datagram.
    ///
    /// # Returns
    ///
    /// `None` when the datagram is too short to carry a header.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_PAYLOAD_SIZE {
            return None;
        }
        let be_u32 =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let lower = be_u32(0);
        let upper = be_u32(12);
        let id = (((upper as u64) << 32) | lower as u64) as i64;
        Some(Self {
            id,
            sent_time: Timestamp::from_parts(be_u32(4) as i64, be_u32(8) as i32),
        })
    }
}

/// Size of the inline isochronous block, after the payload header.
pub const ISOCH_PAYLOAD_SIZE: usize = 28;

/// Frame bookkeeping stamped into every datagram of an isochronous flow
/// so the receiver can rebuild frame boundaries, losses and latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsochPayload {
    /// Frame slot length, microseconds.
    pub burst_period: u32,
    /// Wall-clock start of this frame's burst.
    pub start_time: Timestamp,
    pub prev_frame_id: u32,
    pub frame_id: u32,
    /// Total bytes in this frame.
    pub burst_size: u32,
    /// Bytes left in the frame including this datagram.
    pub remaining: u32,
}

impl IsochPayload {
    /// Writes at `buf[0..28]`; callers offset past the payload header.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::protocol::{IsochPayload, ISOCH_PAYLOAD_SIZE};
    ///
    /// let block = IsochPayload {
    ///     burst_period: 16_667,
    ///     frame_id: 7,
    ///     burst_size: 2184,
    ///     remaining: 714,
    ///     ..Default::default()
    /// };
    /// let mut buf = [0u8; ISOCH_PAYLOAD_SIZE];
    /// block.write_to(&mut buf);
    /// assert_eq!(IsochPayload::read_from(&buf), Some(block));
    /// ```
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.burst_period.to_be_bytes());
        buf[4..8].copy_from_slice(&(self.start_time.secs as u32).to_be_bytes());
        buf[8..12].copy_from_slice(&(self.start_time.usecs as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&self.prev_frame_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[20..24].copy_from_slice(&self.burst_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.remaining.to_be_bytes());
    }

    /// Parse the block from a received datagram.
    ///
    /// # Returns
    ///
    /// `None` when the slice cannot hold a full block.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < ISOCH_PAYLOAD_SIZE {
            return None;
        }
        let be_u32 =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        Some(Self {
            burst_period: be_u32(0),
            start_time: Timestamp::from_parts(be_u32(4) as i64, be_u32(8) as i32),
            prev_frame_id: be_u32(12),
            frame_id: be_u32(16),
            burst_size: be_u32(20),
            remaining: be_u32(24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_time_encoding_law() {
        let raw = encode_amount(TestAmount::Time(Duration::from_secs(3)));
        assert_eq!(raw, (-300i32) as u32);
        assert!(raw & 0x8000_0000 != 0);
        assert_eq!(
            decode_amount(raw),
            TestAmount::Time(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_amount_byte_encoding_law() {
        let raw = encode_amount(TestAmount::Bytes(1_000_000));
        assert_eq!(raw & 0x8000_0000, 0);
        assert_eq!(decode_amount(raw), TestAmount::Bytes(1_000_000));
    }

    #[test]
    fn test_header_roundtrip_base_only() {
        let hdr = ClientHeader {
            flags: HEADER_VERSION1 | HEADER_SEQNO64B,
            num_threads: 4,
            port: 5001,
            buffer_len: 1470,
            window_size: 65536,
            amount: encode_amount(TestAmount::Time(Duration::from_secs(10))),
            ..Default::default()
        };
        let wire = hdr.encode();
        assert_eq!(wire.len(), BASE_SIZE);
        assert_eq!(ClientHeader::decode(&wire).unwrap(), hdr);
    }

    #[test]
    fn test_header_roundtrip_all_blocks() {
        let hdr = ClientHeader {
            flags: HEADER_EXTEND | HEADER_VERSION1 | HEADER_UDPTESTS | HEADER_SEQNO64B,
            num_threads: 1,
            port: 5001,
            buffer_len: 0,
            window_size: 0,
            amount: encode_amount(TestAmount::Time(Duration::from_secs(3))),
            extend: ClientHeaderExt {
                type_id: CLIENT_HEADER_TYPE,
                length: (EXTEND_SIZE - 8) as u32,
                flags: EXTEND_REVERSE,
                version_u: VERSION_MAJOR_HEX,
                version_l: VERSION_MINOR_HEX,
                rate: 1_048_576,
                reserved: 0,
            },
            udp_tests: ClientHeaderUdpTests {
                test_flags: TEST_UDP_ISOCH,
                tlv_offset: 52,
                version_u: VERSION_MAJOR_HEX,
                version_l: VERSION_MINOR_HEX,
            },
        };
        let wire = hdr.encode();
        assert_eq!(wire.len(), BASE_SIZE + EXTEND_SIZE + UDP_TESTS_SIZE);
        assert_eq!(ClientHeader::decode(&wire).unwrap(), hdr);
    }

    #[test]
    fn test_unknown_flag_bits_are_preserved() {
        let hdr = ClientHeader {
            flags: HEADER_VERSION1 | 0x4000_0000,
            extend: ClientHeaderExt::default(),
            ..Default::default()
        };
        let decoded = ClientHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded.flags, HEADER_VERSION1 | 0x4000_0000);
        // A reserved-bit value survives a full re-encode.
        assert_eq!(decoded.encode(), hdr.encode());
    }

    #[test]
    fn test_decode_truncated_fails() {
        assert!(ClientHeader::decode(&[0u8; 10]).is_err());
        let hdr = ClientHeader {
            flags: HEADER_EXTEND,
            ..Default::default()
        };
        let mut wire = hdr.encode();
        wire.truncate(BASE_SIZE + 4);
        assert!(ClientHeader::decode(&wire).is_err());
    }

    #[test]
    fn test_derive_compat_mode() {
        let server = Config::server(5001);
        let hdr = ClientHeader::default();
        assert_eq!(
            derive_client_settings(&server, "10.0.0.1", &hdr),
            NegotiatedTest::None
        );
    }

    #[test]
    fn test_derive_reverse_spawns_server_sender() {
        let server = Config::server(5001).with_protocol(Protocol::Udp);
        let hdr = ClientHeader {
            flags: HEADER_EXTEND | HEADER_VERSION1 | HEADER_SEQNO64B,
            amount: encode_amount(TestAmount::Time(Duration::from_secs(3))),
            extend: ClientHeaderExt {
                flags: EXTEND_REVERSE,
                rate: 1_048_576,
                ..Default::default()
            },
            ..Default::default()
        };
        match derive_client_settings(&server, "10.0.0.1", &hdr) {
            NegotiatedTest::Reverse(cfg) => {
                assert_eq!(cfg.amount, TestAmount::Time(Duration::from_secs(3)));
                assert_eq!(cfg.rate, Some(1_048_576));
                assert_eq!(cfg.rate_units, RateUnits::BitsPerSec);
            }
            other => panic!("expected Reverse, got {other:?}"),
        }
    }

    #[test]
    fn test_bidir_wins_over_reverse() {
        let server = Config::server(5001);
        let hdr = ClientHeader {
            flags: HEADER_EXTEND,
            extend: ClientHeaderExt {
                flags: EXTEND_BIDIR | EXTEND_REVERSE,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            derive_client_settings(&server, "10.0.0.1", &hdr),
            NegotiatedTest::Bidir(_)
        ));
    }

    #[test]
    fn test_version1_tradeoff_vs_dual() {
        let server = Config::server(5001);
        let mut hdr = ClientHeader {
            flags: HEADER_VERSION1,
            port: 5001,
            amount: encode_amount(TestAmount::Bytes(1_000_000)),
            ..Default::default()
        };
        match derive_client_settings(&server, "10.0.0.9", &hdr) {
            NegotiatedTest::Counterflow { settings, dual } => {
                assert!(!dual);
                assert_eq!(settings.test_mode, TestMode::TradeOff);
                assert_eq!(settings.server_addr.as_deref(), Some("10.0.0.9"));
                assert_eq!(settings.amount, TestAmount::Bytes(1_000_000));
            }
            other => panic!("expected Counterflow, got {other:?}"),
        }
        hdr.flags |= HEADER_RUN_NOW;
        match derive_client_settings(&server, "10.0.0.9", &hdr) {
            NegotiatedTest::Counterflow { settings, dual } => {
                assert!(dual);
                assert_eq!(settings.test_mode, TestMode::DualTest);
            }
            other => panic!("expected Counterflow, got {other:?}"),
        }
    }

    #[test]
    fn test_generate_header_reverse_client() {
        let mut cfg = Config::client("10.0.0.2".to_string(), 5001).with_protocol(Protocol::Udp);
        cfg.reverse = true;
        cfg.rate = Some(1_048_576);
        cfg.amount = TestAmount::Time(Duration::from_secs(3));
        let hdr = generate_client_header(&cfg).unwrap();
        assert!(hdr.flags & HEADER_EXTEND != 0);
        assert!(hdr.flags & HEADER_VERSION1 != 0);
        assert!(hdr.flags & HEADER_SEQNO64B != 0);
        assert_eq!(hdr.extend.flags & EXTEND_REVERSE, EXTEND_REVERSE);
        assert_eq!(hdr.extend.rate, 1_048_576);
        assert_eq!(decode_amount(hdr.amount), TestAmount::Time(Duration::from_secs(3)));
    }

    #[test]
    fn test_generate_header_compat_is_none() {
        let mut cfg = Config::client("10.0.0.2".to_string(), 5001);
        cfg.compat = true;
        assert!(generate_client_header(&cfg).is_none());
    }

    #[test]
    fn test_udp_payload_roundtrip_seqno64() {
        let id = (7i64 << 32) | 1234;
        let payload = UdpPayload::new(id, Timestamp::from_parts(1_700_000_000, 123_456));
        let mut buf = [0u8; UDP_PAYLOAD_SIZE];
        payload.write_to(&mut buf);
        let parsed = UdpPayload::read_from(&buf).unwrap();
        assert_eq!(parsed, payload);
        assert!(UdpPayload::read_from(&buf[..8]).is_none());
    }

    #[test]
    fn test_udp_payload_negative_final_id() {
        let payload = UdpPayload::new(-171, Timestamp::from_parts(100, 0));
        let mut buf = [0u8; UDP_PAYLOAD_SIZE];
        payload.write_to(&mut buf);
        assert_eq!(UdpPayload::read_from(&buf).unwrap().id, -171);
    }

    #[test]
    fn test_isoch_payload_roundtrip() {
        let block = IsochPayload {
            burst_period: 16_667,
            start_time: Timestamp::from_parts(1_700_000_000, 500),
            prev_frame_id: 6,
            frame_id: 7,
            burst_size: 2184,
            remaining: 714,
        };
        let mut buf = [0u8; ISOCH_PAYLOAD_SIZE];
        block.write_to(&mut buf);
        assert_eq!(IsochPayload::read_from(&buf).unwrap(), block);
        assert!(IsochPayload::read_from(&buf[..20]).is_none());
    }
}
