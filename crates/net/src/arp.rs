use std::net::Ipv4Addr;

use smoltcp::wire::{ArpHardwareType, ArpOperation, ArpPacket as WireArpPacket, EthernetProtocol};

use crate::error::{NetError, Result};
use crate::mac::MacAddr;

pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOpcode {
    Request,
    Reply,
}

impl ArpOpcode {
    fn to_wire(self) -> ArpOperation {
        match self {
            ArpOpcode::Request => ArpOperation::Request,
            ArpOpcode::Reply => ArpOperation::Reply,
        }
    }

    fn from_wire(op: ArpOperation) -> Result<Self> {
        match op {
            ArpOperation::Request => Ok(ArpOpcode::Request),
            ArpOperation::Reply => Ok(ArpOpcode::Reply),
            ArpOperation::Unknown(other) => {
                Err(NetError::InvalidFrame(format!("unknown arp opcode {other}")))
            }
        }
    }
}

/// A 28-byte Ethernet/IPv4 ARP packet, read and written through `smoltcp`'s
/// wire accessors the way the teacher builds Ethernet/IPv4 headers in
/// `nat.rs`.
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub opcode: ArpOpcode,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut buf = [0u8; ARP_PACKET_LEN];
        {
            let mut wire = WireArpPacket::new_unchecked(&mut buf[..]);
            wire.set_hardware_type(ArpHardwareType::Ethernet);
            wire.set_protocol_type(EthernetProtocol::Ipv4);
            wire.set_hardware_len(6);
            wire.set_protocol_len(4);
            wire.set_operation(self.opcode.to_wire());
            wire.set_source_hardware_addr(self.sender_mac.as_slice());
            wire.set_source_protocol_addr(&self.sender_ip.octets());
            wire.set_target_hardware_addr(self.target_mac.as_slice());
            wire.set_target_protocol_addr(&self.target_ip.octets());
        }
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ARP_PACKET_LEN {
            return Err(NetError::InvalidFrame("arp packet shorter than 28 bytes".into()));
        }
        let wire = WireArpPacket::new_unchecked(bytes);
        let opcode = ArpOpcode::from_wire(wire.operation())?;
        let sender_mac = MacAddr::from_slice(wire.source_hardware_addr())
            .ok_or_else(|| NetError::InvalidFrame("bad arp sender mac".into()))?;
        let sender_ip = ipv4_from_slice(wire.source_protocol_addr())?;
        let target_mac = MacAddr::from_slice(wire.target_hardware_addr())
            .ok_or_else(|| NetError::InvalidFrame("bad arp target mac".into()))?;
        let target_ip = ipv4_from_slice(wire.target_protocol_addr())?;
        Ok(Self {
            opcode,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }
}

fn ipv4_from_slice(bytes: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = bytes
        .try_into()
        .map_err(|_| NetError::InvalidFrame("bad arp ipv4 address".into()))?;
    Ok(Ipv4Addr::from(octets))
}
