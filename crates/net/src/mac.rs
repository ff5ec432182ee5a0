use std::fmt;

use rand::Rng;
use smoltcp::wire::EthernetAddress;

pub const MAC_LEN: usize = 6;
pub const BROADCAST: MacAddr = MacAddr(EthernetAddress([0xff; MAC_LEN]));

/// A 6-byte Ethernet hardware address, backed by `smoltcp::wire::EthernetAddress`
/// the way the teacher's `policy.rs` uses that type directly rather than a
/// hand-rolled newtype.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(EthernetAddress);

impl MacAddr {
    pub const fn new(bytes: [u8; MAC_LEN]) -> Self {
        Self(EthernetAddress(bytes))
    }

    pub const fn zero() -> Self {
        Self(EthernetAddress([0; MAC_LEN]))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_broadcast()
    }

    pub fn bytes(&self) -> [u8; MAC_LEN] {
        self.0.0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Synthesizes a locally-unique MAC with the fabric's `42:69` OUI
    /// prefix, matching the source's port-assignment convention.
    pub fn random() -> Self {
        let mut bytes = [0u8; MAC_LEN];
        bytes[0] = 0x42;
        bytes[1] = 0x69;
        rand::thread_rng().fill(&mut bytes[2..]);
        Self(EthernetAddress(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MAC_LEN {
            return None;
        }
        Some(Self(EthernetAddress::from_bytes(bytes)))
    }

    pub(crate) fn to_wire(self) -> EthernetAddress {
        self.0
    }

    pub(crate) fn from_wire(addr: EthernetAddress) -> Self {
        Self(addr)
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.bytes();
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
