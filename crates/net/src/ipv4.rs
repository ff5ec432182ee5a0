use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Packet as WireIpv4Packet, Ipv4Repr};

use crate::error::{NetError, Result};

pub const IPV4_HEADER_LEN: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// A 20-byte IPv4 header with no options, plus the trailing payload. Header
/// encode/decode goes through `smoltcp`'s `Ipv4Repr`/`Ipv4Packet`, the same
/// way the teacher's `nat.rs` builds and parses IPv4 headers.
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    pub fn new(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        let mut pkt = Self {
            ttl,
            protocol,
            checksum: 0,
            source,
            destination,
            payload,
        };
        pkt.recompute_checksum();
        pkt
    }

    pub fn total_length(&self) -> u16 {
        (IPV4_HEADER_LEN + self.payload.len()) as u16
    }

    fn repr(&self) -> Ipv4Repr {
        Ipv4Repr {
            src_addr: Ipv4Address::from(self.source),
            dst_addr: Ipv4Address::from(self.destination),
            next_header: IpProtocol::from(self.protocol),
            payload_len: self.payload.len(),
            hop_limit: self.ttl,
        }
    }

    fn header_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut header = [0u8; IPV4_HEADER_LEN];
        let mut packet = WireIpv4Packet::new_unchecked(&mut header[..]);
        self.repr().emit(&mut packet, &ChecksumCapabilities::default());
        header
    }

    pub fn recompute_checksum(&mut self) {
        let header = self.header_bytes();
        let packet = WireIpv4Packet::new_unchecked(&header[..]);
        self.checksum = packet.checksum();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IPV4_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let packet = WireIpv4Packet::new_checked(bytes)
            .map_err(|_| NetError::InvalidFrame("malformed ipv4 header".into()))?;
        Ok(Self {
            ttl: packet.hop_limit(),
            protocol: u8::from(packet.next_header()),
            checksum: packet.checksum(),
            source: packet.src_addr().into(),
            destination: packet.dst_addr().into(),
            payload: packet.payload().to_vec(),
        })
    }

    pub fn verify_checksum(&self) -> bool {
        let header = self.header_bytes();
        match WireIpv4Packet::new_checked(&header[..]) {
            Ok(packet) => packet.verify_checksum(),
            Err(_) => false,
        }
    }
}

/// Standard one's-complement 16-bit internet checksum over `data`. Kept
/// hand-rolled for `icmp.rs`'s intentional Data-only checksum, which covers
/// a region `smoltcp`'s checksum helpers have no notion of.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
