use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::error::{NetError, Result};

/// A pool of IPv4 addresses drawn from a /24 range, handed out to tunnel
/// clients on connect and released on disconnect.
///
/// Held as an explicit handle owned by a `FabricServer` rather than a
/// process-wide static, so multiple independent fabrics (as in tests) never
/// share allocation state.
pub struct IpPool {
    addresses: Mutex<Vec<(Ipv4Addr, bool)>>,
}

impl IpPool {
    /// Builds a pool covering `base`'s /24, excluding the network and
    /// broadcast addresses (`.0` and `.255`).
    pub fn new_slash24(base: Ipv4Addr) -> Self {
        let octets = base.octets();
        let addresses = (1..255)
            .map(|host| (Ipv4Addr::new(octets[0], octets[1], octets[2], host), false))
            .collect();
        Self {
            addresses: Mutex::new(addresses),
        }
    }

    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut addresses = self.addresses.lock().expect("ip pool lock poisoned");
        let slot = addresses
            .iter_mut()
            .find(|(_, used)| !*used)
            .ok_or_else(|| NetError::RouteConfig("ip pool exhausted".into()))?;
        slot.1 = true;
        Ok(slot.0)
    }

    pub fn release(&self, ip: Ipv4Addr) {
        let mut addresses = self.addresses.lock().expect("ip pool lock poisoned");
        if let Some(slot) = addresses.iter_mut().find(|(addr, _)| *addr == ip) {
            slot.1 = false;
        }
    }
}
