//! ICMP echo wire format (RFC 792 / RFC 4443).
//!
//! The echo payload starts with an 8 byte big-endian send timestamp in
//! microseconds and a 16 bit logical ping id (the index of this ping
//! within the run); the remainder is zero padding up to the configured
//! data size.

pub const ICMP_HEADER_SIZE: usize = 8;

/// Timestamp plus ping id.
pub const MIN_PING_DATA_SIZE: usize = 10;
/// Maximum ICMP payload in one unfragmented IP packet.
pub const MAX_PING_DATA_SIZE: usize = 65507;
pub const DEFAULT_PING_DATA_SIZE: usize = MIN_PING_DATA_SIZE + 44;

pub const ICMP4_ECHO_REQUEST: u8 = 8;
pub const ICMP4_ECHO_REPLY: u8 = 0;
pub const ICMP4_DEST_UNREACHABLE: u8 = 3;
pub const ICMP4_TIME_EXCEEDED: u8 = 11;
pub const ICMP4_PARAMETER_PROBLEM: u8 = 12;

pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAMETER_PROBLEM: u8 = 4;

/// One's-complement internet checksum over the full ICMP message.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request. The checksum is filled in for ICMPv4; for
/// ICMPv6 the kernel computes it from the pseudo header.
pub fn build_echo_request(
    v6: bool,
    ident: u16,
    seq: u16,
    ping_id: u16,
    timestamp_us: u64,
    data_size: usize,
) -> Vec<u8> {
    let data_size = data_size.clamp(MIN_PING_DATA_SIZE, MAX_PING_DATA_SIZE);
    let mut packet = vec![0u8; ICMP_HEADER_SIZE + data_size];

    packet[0] = if v6 { ICMP6_ECHO_REQUEST } else { ICMP4_ECHO_REQUEST };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_us.to_be_bytes());
    packet[16..18].copy_from_slice(&ping_id.to_be_bytes());

    if !v6 {
        let checksum = internet_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// The echo header of the original request carried inside an ICMP error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EchoRef {
    pub ident: u16,
    pub seq: u16,
}

/// A parsed inbound ICMP message, reduced to what the prober needs.
#[derive(Clone, Debug, PartialEq)]
pub enum IcmpMessage {
    EchoReply {
        ident: u16,
        seq: u16,
        ping_id: Option<u16>,
        timestamp_us: Option<u64>,
    },
    /// destination-unreachable, time-exceeded or parameter-problem,
    /// with the embedded original echo header when recoverable.
    Error {
        icmp_type: u8,
        icmp_code: u8,
        original: Option<EchoRef>,
    },
    Other {
        icmp_type: u8,
    },
}

fn parse_echo_payload(payload: &[u8]) -> (Option<u64>, Option<u16>) {
    if payload.len() < MIN_PING_DATA_SIZE {
        return (None, None);
    }
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&payload[..8]);
    let ping_id = u16::from_be_bytes([payload[8], payload[9]]);
    (Some(u64::from_be_bytes(timestamp)), Some(ping_id))
}

fn parse_icmp(buf: &[u8], v6: bool) -> Option<IcmpMessage> {
    if buf.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let icmp_type = buf[0];
    let icmp_code = buf[1];
    let reply_type = if v6 { ICMP6_ECHO_REPLY } else { ICMP4_ECHO_REPLY };
    let error_types: &[u8] = if v6 {
        &[
            ICMP6_DEST_UNREACHABLE,
            ICMP6_PACKET_TOO_BIG,
            ICMP6_TIME_EXCEEDED,
            ICMP6_PARAMETER_PROBLEM,
        ]
    } else {
        &[
            ICMP4_DEST_UNREACHABLE,
            ICMP4_TIME_EXCEEDED,
            ICMP4_PARAMETER_PROBLEM,
        ]
    };

    if icmp_type == reply_type {
        let ident = u16::from_be_bytes([buf[4], buf[5]]);
        let seq = u16::from_be_bytes([buf[6], buf[7]]);
        let (timestamp_us, ping_id) = parse_echo_payload(&buf[ICMP_HEADER_SIZE..]);
        return Some(IcmpMessage::EchoReply {
            ident,
            seq,
            ping_id,
            timestamp_us,
        });
    }

    if error_types.contains(&icmp_type) {
        return Some(IcmpMessage::Error {
            icmp_type,
            icmp_code,
            original: extract_original_echo(&buf[ICMP_HEADER_SIZE..], v6),
        });
    }

    Some(IcmpMessage::Other { icmp_type })
}

/// An ICMP error body carries the IP header of the offending datagram
/// plus at least the first 8 bytes of its payload — enough to recover
/// the echo identifier and sequence we sent.
fn extract_original_echo(body: &[u8], v6: bool) -> Option<EchoRef> {
    let echo = if v6 {
        // Fixed 40 byte IPv6 header.
        if body.len() < 40 + ICMP_HEADER_SIZE {
            return None;
        }
        let inner = &body[40..];
        if inner[0] != ICMP6_ECHO_REQUEST {
            return None;
        }
        inner
    } else {
        if body.is_empty() || body[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(body[0] & 0x0f) * 4;
        if ihl < 20 || body.len() < ihl + ICMP_HEADER_SIZE {
            return None;
        }
        let inner = &body[ihl..];
        if inner[0] != ICMP4_ECHO_REQUEST {
            return None;
        }
        inner
    };

    Some(EchoRef {
        ident: u16::from_be_bytes([echo[4], echo[5]]),
        seq: u16::from_be_bytes([echo[6], echo[7]]),
    })
}

/// Parse an ICMPv4 frame. Raw sockets deliver the IP header in front of
/// the ICMP message; datagram sockets do not.
pub fn parse_v4(buf: &[u8], strip_ip_header: bool) -> Option<IcmpMessage> {
    if strip_ip_header {
        if buf.is_empty() || buf[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if ihl < 20 || buf.len() < ihl {
            return None;
        }
        parse_icmp(&buf[ihl..], false)
    } else {
        parse_icmp(buf, false)
    }
}

/// Parse an ICMPv6 frame. The kernel never hands us the IPv6 header.
pub fn parse_v6(buf: &[u8]) -> Option<IcmpMessage> {
    parse_icmp(buf, true)
}


#[cfg(test)]
mod codec_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_layout() {
        let packet = build_echo_request(false, 0xbeef, 3, 2, 1_000_000, MIN_PING_DATA_SIZE);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + MIN_PING_DATA_SIZE);
        assert_eq!(packet[0], ICMP4_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0xbeef);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 3);
    }

    #[test]
    fn test_padding_is_zeroed() {
        let packet = build_echo_request(true, 1, 1, 1, 1, 32);
        assert!(packet[ICMP_HEADER_SIZE + MIN_PING_DATA_SIZE..]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_data_size_clamped_to_minimum() {
        let packet = build_echo_request(false, 1, 1, 1, 1, 0);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + MIN_PING_DATA_SIZE);
    }

    #[test]
    fn test_reply_round_trip() {
        let mut packet = build_echo_request(false, 0x0102, 9, 4, 777, DEFAULT_PING_DATA_SIZE);
        // Kernel-style reply: flip the type, fix the checksum.
        packet[0] = ICMP4_ECHO_REPLY;
        packet[2..4].copy_from_slice(&[0, 0]);
        let checksum = internet_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());

        assert_eq!(
            parse_v4(&packet, false),
            Some(IcmpMessage::EchoReply {
                ident: 0x0102,
                seq: 9,
                ping_id: Some(4),
                timestamp_us: Some(777),
            })
        );
    }

    #[test]
    fn test_v6_reply_parse() {
        let mut packet = build_echo_request(true, 0x0a0b, 2, 0, 1, MIN_PING_DATA_SIZE);
        packet[0] = ICMP6_ECHO_REPLY;
        assert_eq!(
            parse_v6(&packet),
            Some(IcmpMessage::EchoReply {
                ident: 0x0a0b,
                seq: 2,
                ping_id: Some(0),
                timestamp_us: Some(1),
            })
        );
    }

    #[test]
    fn test_raw_frame_header_stripped() {
        let mut reply = build_echo_request(false, 0x00ff, 1, 0, 5, MIN_PING_DATA_SIZE);
        reply[0] = ICMP4_ECHO_REPLY;
        let mut frame = vec![0u8; 20];
        frame[0] = 0x45; // IPv4, IHL 5
        frame.extend_from_slice(&reply);

        match parse_v4(&frame, true) {
            Some(IcmpMessage::EchoReply { ident, seq, .. }) => {
                assert_eq!(ident, 0x00ff);
                assert_eq!(seq, 1);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_error_extracts_original_echo() {
        let original = build_echo_request(false, 0xaabb, 5, 1, 9, MIN_PING_DATA_SIZE);

        let mut error = vec![0u8; ICMP_HEADER_SIZE];
        error[0] = ICMP4_TIME_EXCEEDED;
        error[1] = 0;
        // Embedded IPv4 header of the offending datagram.
        let mut inner_ip = vec![0u8; 20];
        inner_ip[0] = 0x45;
        error.extend_from_slice(&inner_ip);
        error.extend_from_slice(&original[..ICMP_HEADER_SIZE]);

        assert_eq!(
            parse_v4(&error, false),
            Some(IcmpMessage::Error {
                icmp_type: ICMP4_TIME_EXCEEDED,
                icmp_code: 0,
                original: Some(EchoRef {
                    ident: 0xaabb,
                    seq: 5
                }),
            })
        );
    }

    #[test]
    fn test_error_with_truncated_body() {
        let mut error = vec![0u8; ICMP_HEADER_SIZE + 4];
        error[0] = ICMP4_DEST_UNREACHABLE;
        error[1] = 1;
        assert_eq!(
            parse_v4(&error, false),
            Some(IcmpMessage::Error {
                icmp_type: ICMP4_DEST_UNREACHABLE,
                icmp_code: 1,
                original: None,
            })
        );
    }

    #[test]
    fn test_short_garbage_rejected() {
        assert_eq!(parse_v4(&[8, 0, 0], false), None);
        assert_eq!(parse_v4(&[], true), None);
        assert_eq!(parse_v6(&[129]), None);
    }
}
