//! ICMP echo wire helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// ICMP header length (type, code, checksum, identifier, sequence).
pub const HEADER_LEN: usize = 8;

/// Payload prefix: send timestamp then the sender's tracker.
pub const STAMP_LEN: usize = 16;

const ECHO_REPLY_V4: u8 = 0;
const DEST_UNREACHABLE_V4: u8 = 3;
const ECHO_REQUEST_V4: u8 = 8;

const DEST_UNREACHABLE_V6: u8 = 1;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;

/// Address family of an ICMP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// An ICMP message relevant to a running pinger.
///
/// `tracker` is `None` when the payload is too short to carry one, which
/// happens when a router quotes only the first bytes of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    EchoReply {
        id: u16,
        seq: u16,
        tracker: Option<u64>,
    },
    /// Destination unreachable quoting one of our echo requests.
    Unreachable {
        id: u16,
        seq: u16,
        tracker: Option<u64>,
    },
}

/// Build an echo request with `size` payload bytes.
///
/// The payload starts with a send timestamp and `tracker`, the rest is a
/// fixed pattern. Payloads shorter than [`STAMP_LEN`] are truncated.
/// IPv6 checksums are left to the kernel.
pub fn build_echo_request(
    family: Family,
    identifier: u16,
    sequence: u16,
    tracker: u64,
    size: usize,
) -> Vec<u8> {
    let mut packet = vec![0u8; HEADER_LEN + size];

    packet[0] = match family {
        Family::V4 => ECHO_REQUEST_V4,
        Family::V6 => ECHO_REQUEST_V6,
    };
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut stamp = [0u8; STAMP_LEN];
    stamp[..8].copy_from_slice(&timestamp.to_be_bytes());
    stamp[8..].copy_from_slice(&tracker.to_be_bytes());
    for (i, byte) in packet[HEADER_LEN..].iter_mut().enumerate() {
        *byte = stamp.get(i).copied().unwrap_or(i as u8);
    }

    if family == Family::V4 {
        let checksum = checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Internet checksum (RFC 1071).
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += word as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Parse a received datagram.
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message;
/// datagram sockets and IPv6 sockets do not.
pub fn parse(family: Family, buf: &[u8]) -> Option<Message> {
    let icmp = match family {
        Family::V4 => strip_ipv4_header(buf)?,
        Family::V6 => buf,
    };
    if icmp.len() < HEADER_LEN {
        return None;
    }

    match (family, icmp[0]) {
        (Family::V4, ECHO_REPLY_V4) | (Family::V6, ECHO_REPLY_V6) => {
            let (id, seq) = id_seq(icmp);
            Some(Message::EchoReply {
                id,
                seq,
                tracker: tracker(icmp),
            })
        }
        (Family::V4, DEST_UNREACHABLE_V4) => {
            let quoted = strip_ipv4_header(&icmp[HEADER_LEN..])?;
            quoted_echo(quoted, ECHO_REQUEST_V4)
        }
        (Family::V6, DEST_UNREACHABLE_V6) => {
            let quoted = icmp.get(HEADER_LEN + IPV6_HEADER_LEN..)?;
            quoted_echo(quoted, ECHO_REQUEST_V6)
        }
        _ => None,
    }
}

fn strip_ipv4_header(buf: &[u8]) -> Option<&[u8]> {
    let first = *buf.first()?;
    if first >> 4 != 4 {
        return Some(buf);
    }
    let ihl = (first & 0x0F) as usize * 4;
    buf.get(ihl..)
}

fn quoted_echo(icmp: &[u8], request_type: u8) -> Option<Message> {
    if icmp.len() < HEADER_LEN || icmp[0] != request_type {
        return None;
    }
    let (id, seq) = id_seq(icmp);
    Some(Message::Unreachable {
        id,
        seq,
        tracker: tracker(icmp),
    })
}

fn tracker(icmp: &[u8]) -> Option<u64> {
    let bytes = icmp.get(HEADER_LEN + 8..HEADER_LEN + STAMP_LEN)?;
    bytes.try_into().ok().map(u64::from_be_bytes)
}

fn id_seq(icmp: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    )
}
