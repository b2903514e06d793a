//! IPv4 + TCP SYN construction for RTT probes.
//!
//! ```text
//! | IPv4 header (20) | TCP header (20) | options (12) |
//! ```
//!
//! Options: MSS 1460, NOP, window scale 8, NOP, NOP, SACK permitted.

use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const SYN_OPTIONS: [u8; 12] = [
    0x02, 0x04, 0x05, 0xb4, // MSS 1460
    0x01, // NOP
    0x03, 0x03, 0x08, // Window scale 8
    0x01, 0x01, // NOP NOP
    0x04, 0x02, // SACK permitted
];
pub const SYN_SEGMENT_LEN: usize = TCP_HEADER_LEN + SYN_OPTIONS.len();
pub const SYN_PACKET_LEN: usize = IPV4_HEADER_LEN + SYN_SEGMENT_LEN;

pub const IPPROTO_TCP: u8 = 6;
pub const DEFAULT_SEQUENCE: u32 = 0xf494_32e6;

const IP_IDENTIFICATION: u16 = 0x5d48;
const IP_DONT_FRAGMENT: u16 = 0x4000;
const IP_TTL: u8 = 64;
const TCP_WINDOW: u16 = 0x2000;

/// TCP flag bits.
pub mod tcp_flags {
    pub const SYN: u8 = 0x02;
    pub const ACK: u8 = 0x10;
}

/// One's-complement sum of `data` as 16-bit big-endian words, folded to
/// 16 bits. An odd trailing byte is padded with zero.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// RFC 1071 internet checksum.
///
/// A buffer whose checksum field already holds the correct value sums to
/// `0xFFFF`, so its checksum is zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Build an IPv4 header for a TCP payload of `payload_len` bytes.
pub fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut header = [0u8; IPV4_HEADER_LEN];

    header[0] = 0x45; // Version 4, IHL 5
    header[1] = 0x00; // DSCP/ECN
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&IP_IDENTIFICATION.to_be_bytes());
    header[6..8].copy_from_slice(&IP_DONT_FRAGMENT.to_be_bytes());
    header[8] = IP_TTL;
    header[9] = IPPROTO_TCP;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let checksum = internet_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// Build a TCP SYN segment with its checksum computed over the IPv4
/// pseudo-header.
pub fn build_syn_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    sequence: u32,
) -> [u8; SYN_SEGMENT_LEN] {
    let mut segment = [0u8; SYN_SEGMENT_LEN];

    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..8].copy_from_slice(&sequence.to_be_bytes());
    // Acknowledgement number stays zero
    segment[12] = ((SYN_SEGMENT_LEN / 4) as u8) << 4; // Data offset
    segment[13] = tcp_flags::SYN;
    segment[14..16].copy_from_slice(&TCP_WINDOW.to_be_bytes());
    // Checksum and urgent pointer filled below / left zero
    segment[TCP_HEADER_LEN..].copy_from_slice(&SYN_OPTIONS);

    let checksum = tcp_checksum(src, dst, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}

/// TCP checksum including the IPv4 pseudo-header.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(segment, sum_words(&pseudo, 0));
    !fold(sum)
}

/// Complete IPv4 packet carrying a SYN from `src:src_port` to `dst:dst_port`.
pub fn build_syn_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> [u8; SYN_PACKET_LEN] {
    let mut packet = [0u8; SYN_PACKET_LEN];
    packet[..IPV4_HEADER_LEN].copy_from_slice(&build_ipv4_header(src, dst, SYN_SEGMENT_LEN));
    packet[IPV4_HEADER_LEN..].copy_from_slice(&build_syn_segment(
        src,
        dst,
        src_port,
        dst_port,
        DEFAULT_SEQUENCE,
    ));
    packet
}

/// The fields of an inbound IPv4/TCP packet the prober matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpReply {
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub flags: u8,
}

impl TcpReply {
    /// Parse a packet as delivered by a raw TCP socket (IP header included).
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let version_ihl = *packet.first()?;
        if version_ihl >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(version_ihl & 0x0F) * 4;
        if ihl < IPV4_HEADER_LEN || packet.len() < ihl + TCP_HEADER_LEN {
            return None;
        }
        if packet[9] != IPPROTO_TCP {
            return None;
        }

        let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let tcp = &packet[ihl..];
        Some(Self {
            source,
            source_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            destination_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            flags: tcp[13],
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const DST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    /// Build the SYN-ACK a server at `from:from_port` would send back.
    pub(crate) fn syn_ack(from: Ipv4Addr, to: Ipv4Addr, from_port: u16, to_port: u16) -> Vec<u8> {
        let mut segment = build_syn_segment(from, to, from_port, to_port, 1).to_vec();
        segment[13] = tcp_flags::SYN | tcp_flags::ACK;
        let mut packet = build_ipv4_header(from, to, segment.len()).to_vec();
        packet.append(&mut segment);
        packet
    }

    #[test]
    fn checksum_matches_rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];

        assert_eq!(ones_complement_sum(&data), 0xddf2);
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn checksum_pads_odd_length() {
        assert_eq!(ones_complement_sum(&[0xab]), 0xab00);
    }

    #[test]
    fn ipv4_header_validates_to_ffff() {
        let header = build_ipv4_header(SRC, DST, SYN_SEGMENT_LEN);

        assert_eq!(ones_complement_sum(&header), 0xFFFF);
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn random_headers_validate_to_ffff() {
        let mut rng = rand::rng();
        for _ in 0..256 {
            let src = Ipv4Addr::from(rng.random::<u32>());
            let dst = Ipv4Addr::from(rng.random::<u32>());
            let len = rng.random_range(0..1400usize);

            let header = build_ipv4_header(src, dst, len);

            assert_eq!(ones_complement_sum(&header), 0xFFFF);
        }
    }

    #[test]
    fn ipv4_header_fields() {
        let header = build_ipv4_header(SRC, DST, SYN_SEGMENT_LEN);

        assert_eq!(header[0], 0x45);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), SYN_PACKET_LEN as u16);
        assert_eq!(header[9], IPPROTO_TCP);
        assert_eq!(&header[12..16], &SRC.octets());
        assert_eq!(&header[16..20], &DST.octets());
    }

    #[test]
    fn syn_segment_checksum_validates_with_pseudo_header() {
        let segment = build_syn_segment(SRC, DST, 56591, 443, DEFAULT_SEQUENCE);

        assert_eq!(tcp_checksum(SRC, DST, &segment), 0);
    }

    #[test]
    fn syn_segment_fields() {
        let segment = build_syn_segment(SRC, DST, 56591, 80, DEFAULT_SEQUENCE);

        assert_eq!(u16::from_be_bytes([segment[0], segment[1]]), 56591);
        assert_eq!(u16::from_be_bytes([segment[2], segment[3]]), 80);
        assert_eq!(
            u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            DEFAULT_SEQUENCE
        );
        assert_eq!(segment[12] >> 4, 8);
        assert_eq!(segment[13], tcp_flags::SYN);
        assert_eq!(&segment[20..], &SYN_OPTIONS);
    }

    #[test]
    fn syn_packet_round_trips_through_reply_parser() {
        let packet = build_syn_packet(SRC, DST, 56591, 443);

        let parsed = TcpReply::parse(&packet).unwrap();

        assert_eq!(parsed.source, SRC);
        assert_eq!(parsed.source_port, 56591);
        assert_eq!(parsed.destination_port, 443);
        assert_eq!(parsed.flags, tcp_flags::SYN);
    }

    #[test]
    fn reply_parser_rejects_non_tcp_and_short_packets() {
        let mut packet = syn_ack(DST, SRC, 443, 56591);
        packet[9] = 17;

        assert!(TcpReply::parse(&packet).is_none());
        assert!(TcpReply::parse(&packet[..30]).is_none());
        assert!(TcpReply::parse(&[]).is_none());
    }
}
