use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;

pub const IPV4_HEADER_LEN: usize = 20;
pub const ICMP_HEADER_LEN: usize = 8;
pub const TOKEN_LEN: usize = 16;
pub const ECHO_PACKET_LEN: usize = ICMP_HEADER_LEN + TOKEN_LEN;

/// ICMP Echo message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub token: [u8; TOKEN_LEN],
}

impl EchoPacket {
    pub fn echo_request(identifier: u16, sequence: u16, token: [u8; TOKEN_LEN]) -> Self {
        let mut packet = Self {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            token,
        };

        packet.checksum = internet_checksum(&packet.to_bytes());
        packet
    }

    pub fn to_bytes(&self) -> [u8; ECHO_PACKET_LEN] {
        let mut bytes = [0u8; ECHO_PACKET_LEN];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        BigEndian::write_u16(&mut bytes[4..6], self.identifier);
        BigEndian::write_u16(&mut bytes[6..8], self.sequence);
        bytes[ICMP_HEADER_LEN..].copy_from_slice(&self.token);
        bytes
    }

    /// Decodes a bare ICMP echo message (no IP header in front).
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ECHO_PACKET_LEN {
            return None;
        }

        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&data[ICMP_HEADER_LEN..ECHO_PACKET_LEN]);

        Some(Self {
            icmp_type: data[0],
            code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            identifier: BigEndian::read_u16(&data[4..6]),
            sequence: BigEndian::read_u16(&data[6..8]),
            token,
        })
    }
}

/// Builds a complete, checksummed Echo Request.
pub fn build_echo_request(identifier: u16, sequence: u16, token: [u8; TOKEN_LEN]) -> [u8; ECHO_PACKET_LEN] {
    EchoPacket::echo_request(identifier, sequence, token).to_bytes()
}

/// Fixed part of an inbound IPv4 header. Options are skipped, not decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN || data[0] >> 4 != 4 {
            return None;
        }

        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > data.len() {
            return None;
        }

        Some(Self {
            header_len,
            total_len: BigEndian::read_u16(&data[2..4]),
            ttl: data[8],
            protocol: data[9],
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }
}

/// The fields of an inbound Echo Reply the engine correlates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub source: Ipv4Addr,
    pub ttl: u8,
}

/// Decodes a datagram read from a raw IPv4 ICMP socket (IP header included).
///
/// Returns `None` for anything that is not an Echo Reply: truncated buffers,
/// non-ICMP payloads, and every other ICMP type, including our own requests
/// looped back on the socket.
pub fn parse_inbound_datagram(data: &[u8]) -> Option<EchoReply> {
    let ip = Ipv4Header::parse(data)?;
    if ip.protocol != IPPROTO_ICMP {
        return None;
    }

    let icmp = &data[ip.header_len..];
    if icmp.len() < ICMP_HEADER_LEN || icmp[0] != ICMP_ECHO_REPLY {
        return None;
    }

    Some(EchoReply {
        icmp_type: icmp[0],
        identifier: BigEndian::read_u16(&icmp[4..6]),
        sequence: BigEndian::read_u16(&icmp[6..8]),
        source: ip.source,
        ttl: ip.ttl,
    })
}

/// RFC 1071 Internet checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }

    // Odd trailing byte is the high half of a zero-padded word
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// True when `data` (checksum field included) sums to zero.
pub fn verify_checksum(data: &[u8]) -> bool {
    internet_checksum(data) == 0
}
