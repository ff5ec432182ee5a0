use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::capability::{run_chain, Capability};
use crate::error::{NetError, Result};
use crate::frame::EthernetFrame;
use crate::mac::MacAddr;
use crate::vport::{DeliveryTracker, VPort};

/// Shared state and plumbing common to every Ethernet device: its owned
/// ports, its MAC-learning table, and its capability pipeline.
///
/// Concrete devices (`VSwitch`, `IpDevice`, `VRouter`) embed this by
/// composition and implement [`DeviceReceive`] to supply their own
/// default forwarding behavior; [`dispatch_receive`] ties the two
/// together the same way for every device kind.
pub struct EthernetDeviceBase {
    pub name: String,
    ports: Vec<VPort>,
    mac_table: RwLock<HashMap<MacAddr, usize>>,
    capabilities: RwLock<Vec<Arc<dyn Capability>>>,
    tracker: DeliveryTracker,
}

impl EthernetDeviceBase {
    pub fn new(name: impl Into<String>, num_ports: usize, tracker: DeliveryTracker) -> Self {
        let name = name.into();
        let ports = (0..num_ports)
            .map(|i| VPort::new(format!("{name}/p{i}"), MacAddr::random(), tracker.clone()))
            .collect();
        Self {
            name,
            ports,
            mac_table: RwLock::new(HashMap::new()),
            capabilities: RwLock::new(Vec::new()),
            tracker,
        }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn ports(&self) -> &[VPort] {
        &self.ports
    }

    pub fn port(&self, index: usize) -> Option<&VPort> {
        self.ports.get(index)
    }

    pub fn port_index_of(&self, port: &VPort) -> Option<usize> {
        self.ports.iter().position(|p| p.mac() == port.mac())
    }

    pub async fn add_capability(&self, capability: Arc<dyn Capability>) {
        self.capabilities.write().await.push(capability);
    }

    /// Finds the first unpaired port and links it to `peer`.
    pub fn attach_peer(&self, peer: &VPort) -> Result<VPort> {
        let local = self
            .ports
            .iter()
            .find(|p| !p.is_connected())
            .ok_or(NetError::NoFreePort)?;
        VPort::link(local, peer);
        Ok(local.clone())
    }

    /// Links a specific local port (by index) to `peer`.
    pub fn connect_ports(&self, local_index: usize, peer: &VPort) -> Result<VPort> {
        let local = self.ports.get(local_index).ok_or(NetError::PortNotFound)?;
        if local.is_connected() {
            return Err(NetError::RouteConfig(format!(
                "port {local_index} is already connected"
            )));
        }
        VPort::link(local, peer);
        Ok(local.clone())
    }

    /// Disconnects the local port at `index`, purging its mac_table entries.
    pub async fn disconnect_port(&self, index: usize) -> Result<()> {
        let port = self.ports.get(index).ok_or(NetError::PortNotFound)?;
        port.unlink();
        self.mac_table.write().await.retain(|_, v| *v != index);
        Ok(())
    }

    /// Returns the index of the local port whose peer is `peer`, if any.
    pub fn port_index_for_peer(&self, peer: &VPort) -> Option<usize> {
        self.ports.iter().position(|p| p.peer_is(peer))
    }

    /// Finds the local port whose peer is `peer`, clears both sides of the
    /// link via [`Self::disconnect_port`], and purges any mac_table entry
    /// pointing at the freed port.
    pub async fn disconnect(&self, peer: &VPort) -> Result<()> {
        let index = self.port_index_for_peer(peer).ok_or(NetError::PortNotFound)?;
        self.disconnect_port(index).await
    }

    /// Records `mac` as reachable via `ingress` if not already known, logging
    /// once per newly-learned address. Broadcast addresses are never learned.
    pub async fn learn(&self, ingress: usize, mac: MacAddr) {
        if mac.is_broadcast() {
            return;
        }
        let already_known = self.mac_table.read().await.get(&mac).copied() == Some(ingress);
        if already_known {
            return;
        }
        self.mac_table.write().await.insert(mac, ingress);
        trace!(device = %self.name, port = ingress, mac = %mac, "learned new mac address");
    }

    pub async fn lookup(&self, mac: MacAddr) -> Option<usize> {
        self.mac_table.read().await.get(&mac).copied()
    }

    pub async fn capability_chain(&self) -> Vec<Arc<dyn Capability>> {
        self.capabilities.read().await.clone()
    }

    /// Rewrites the frame's source MAC to the egress port's own MAC, then
    /// writes it out on that port.
    pub fn write_from_port(&self, index: usize, mut frame: EthernetFrame) -> Result<()> {
        let port = self.ports.get(index).ok_or(NetError::PortNotFound)?;
        frame.set_source(port.mac());
        port.write(frame)
    }

    /// Writes a copy of `frame` to every port other than `ingress`.
    pub fn flood(&self, ingress: usize, frame: &EthernetFrame) {
        for (index, _port) in self.ports.iter().enumerate() {
            if index == ingress {
                continue;
            }
            let copy = frame.clone();
            let _ = self.write_from_port(index, copy);
        }
    }
}

/// Implemented by every concrete device kind to supply the behavior that
/// runs after MAC learning and the capability chain both decline a frame.
#[async_trait]
pub trait DeviceReceive: Send + Sync {
    fn base(&self) -> &EthernetDeviceBase;

    async fn default_receive(&self, ingress: usize, frame: EthernetFrame);
}

/// The shared receive pipeline every device kind runs for every inbound
/// frame: learn the source MAC, walk the capability chain, and fall back to
/// the device's own default forwarding if nothing in the chain terminated
/// the frame.
pub async fn dispatch_receive<D: DeviceReceive + ?Sized>(
    device: &D,
    ingress: usize,
    frame: EthernetFrame,
) {
    let base = device.base();
    base.learn(ingress, frame.source()).await;

    if let Some(port) = base.port(ingress) {
        let chain = base.capability_chain().await;
        if run_chain(&chain, port, &frame).await {
            return;
        }
    }

    device.default_receive(ingress, frame).await;
}

/// Wires each of `ports`' `on_receive` handlers to dispatch into the owning
/// device's shared receive pipeline via a captured `Weak` reference. Used by
/// every concrete device's `Arc::new_cyclic` constructor.
pub fn install_receive_handlers<D>(ports: &[VPort], weak_self: std::sync::Weak<D>)
where
    D: DeviceReceive + 'static,
{
    for (index, port) in ports.iter().enumerate() {
        let weak = weak_self.clone();
        port.set_on_receive(Arc::new(move |frame: EthernetFrame| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(device) = weak.upgrade() {
                    dispatch_receive(device.as_ref(), index, frame).await;
                }
            })
        }));
    }
}
