use smoltcp::wire::{EthernetFrame as WireFrame, EthernetProtocol};

use crate::error::{NetError, Result};
use crate::mac::MacAddr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

const ETH_HEADER_LEN: usize = 14;
const TPID_8021Q: u16 = 0x8100;
const TPID_QINQ: u16 = 0x88a8;

/// Size of the VLAN tag region carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanTagging {
    Untagged,
    Tagged,
    DoubleTagged,
}

impl VlanTagging {
    fn byte_len(self) -> usize {
        match self {
            VlanTagging::Untagged => 0,
            VlanTagging::Tagged => 4,
            VlanTagging::DoubleTagged => 8,
        }
    }
}

/// A mutable Ethernet frame buffer: dst(6) | src(6) | [vlan tag] | ethertype(2) | payload.
///
/// Address and ethertype fields are read and written through `smoltcp`'s
/// wire types the same way the teacher's `nat.rs` builds and parses
/// frames. `smoltcp` has no 802.1Q/QinQ wire support, so the tag region's
/// offset math below is ours.
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    buf: Vec<u8>,
    tagging: VlanTagging,
}

impl EthernetFrame {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Self {
        let mut buf = vec![0u8; ETH_HEADER_LEN + payload.len()];
        {
            let mut wire = WireFrame::new_unchecked(&mut buf[..]);
            wire.set_dst_addr(dst.to_wire());
            wire.set_src_addr(src.to_wire());
            wire.set_ethertype(EthernetProtocol::from(ethertype));
        }
        buf[ETH_HEADER_LEN..].copy_from_slice(payload);
        Self {
            buf,
            tagging: VlanTagging::Untagged,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ETH_HEADER_LEN {
            return Err(NetError::InvalidFrame("shorter than 14 bytes".into()));
        }
        let tagging = match u16::from_be_bytes([bytes[12], bytes[13]]) {
            TPID_8021Q => VlanTagging::Tagged,
            TPID_QINQ => VlanTagging::DoubleTagged,
            _ => VlanTagging::Untagged,
        };
        let min_len = ETH_HEADER_LEN + tagging.byte_len();
        if bytes.len() < min_len {
            return Err(NetError::InvalidFrame("truncated tag region".into()));
        }
        Ok(Self {
            buf: bytes.to_vec(),
            tagging,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn wire(&self) -> WireFrame<&[u8]> {
        WireFrame::new_unchecked(&self.buf[..])
    }

    fn wire_mut(&mut self) -> WireFrame<&mut [u8]> {
        WireFrame::new_unchecked(&mut self.buf[..])
    }

    pub fn destination(&self) -> MacAddr {
        MacAddr::from_wire(self.wire().dst_addr())
    }

    pub fn source(&self) -> MacAddr {
        MacAddr::from_wire(self.wire().src_addr())
    }

    pub fn set_destination(&mut self, mac: MacAddr) {
        self.wire_mut().set_dst_addr(mac.to_wire());
    }

    pub fn set_source(&mut self, mac: MacAddr) {
        self.wire_mut().set_src_addr(mac.to_wire());
    }

    fn ethertype_offset(&self) -> usize {
        12 + self.tagging.byte_len()
    }

    /// For untagged frames this reads through `smoltcp`'s own ethertype
    /// accessor; a tagged frame's ethertype sits past the tag region
    /// smoltcp doesn't model, so that case is read directly.
    pub fn ethertype(&self) -> u16 {
        if self.tagging == VlanTagging::Untagged {
            u16::from(self.wire().ethertype())
        } else {
            let off = self.ethertype_offset();
            u16::from_be_bytes([self.buf[off], self.buf[off + 1]])
        }
    }

    pub fn tagging(&self) -> VlanTagging {
        self.tagging
    }

    pub fn payload(&self) -> &[u8] {
        if self.tagging == VlanTagging::Untagged {
            self.wire().payload()
        } else {
            &self.buf[self.ethertype_offset() + 2..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_header_and_payload() {
        let dst = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let src = MacAddr::new([6, 5, 4, 3, 2, 1]);
        let frame = EthernetFrame::new(dst, src, ETHERTYPE_IPV4, b"Hello");
        let bytes = frame.as_bytes().to_vec();
        let parsed = EthernetFrame::parse(&bytes).unwrap();
        assert_eq!(parsed.destination(), dst);
        assert_eq!(parsed.source(), src);
        assert_eq!(parsed.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(parsed.payload(), b"Hello");
        assert_eq!(parsed.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(EthernetFrame::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn detects_8021q_tag() {
        let mut bytes = vec![0u8; 18];
        bytes[12] = 0x81;
        bytes[13] = 0x00;
        bytes[16] = 0x08;
        bytes[17] = 0x00;
        let frame = EthernetFrame::parse(&bytes).unwrap();
        assert_eq!(frame.tagging(), VlanTagging::Tagged);
        assert_eq!(frame.ethertype(), ETHERTYPE_IPV4);
    }
}
