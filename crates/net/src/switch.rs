use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::device::{install_receive_handlers, DeviceReceive, EthernetDeviceBase};
use crate::error::Result;
use crate::frame::EthernetFrame;
use crate::vport::{DeliveryTracker, VPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    Access,
    Trunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortVlanConfig {
    pub mode: PortMode,
    pub vlan: u16,
}

impl Default for PortVlanConfig {
    fn default() -> Self {
        Self {
            mode: PortMode::Access,
            vlan: 1,
        }
    }
}

/// An L2 learning switch: broadcasts unknown/broadcast destinations,
/// unicasts to a port once its MAC has been learned.
///
/// VLAN access/trunk policy is tracked per port but not yet enforced on the
/// forwarding path; see the design notes for why this core ships the policy
/// table ahead of policy enforcement.
pub struct VSwitch {
    base: EthernetDeviceBase,
    port_mode: RwLock<HashMap<usize, PortVlanConfig>>,
}

impl VSwitch {
    pub fn new(name: impl Into<String>, num_ports: usize, tracker: DeliveryTracker) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let base = EthernetDeviceBase::new(name, num_ports, tracker);
            let switch = Self {
                base,
                port_mode: RwLock::new(HashMap::new()),
            };
            install_receive_handlers(switch.base.ports(), weak_self.clone());
            switch
        })
    }

    pub fn base(&self) -> &EthernetDeviceBase {
        &self.base
    }

    pub fn attach_peer(&self, peer: &VPort) -> Result<VPort> {
        self.base.attach_peer(peer)
    }

    pub async fn disconnect_port(&self, index: usize) -> Result<()> {
        self.base.disconnect_port(index).await?;
        self.port_mode.write().await.remove(&index);
        Ok(())
    }

    /// Finds the local port whose peer is `peer`, unlinks it, purges its
    /// mac_table entry, and resets its VLAN mode back to the Access/VLAN-1
    /// default (removing the `port_mode` entry restores that default, since
    /// [`Self::port_mode`] falls back to it for any unconfigured port).
    pub async fn disconnect(&self, peer: &VPort) -> Result<()> {
        let index = self
            .base
            .port_index_for_peer(peer)
            .ok_or(crate::error::NetError::PortNotFound)?;
        self.disconnect_port(index).await
    }

    pub async fn set_port_mode(&self, index: usize, config: PortVlanConfig) {
        self.port_mode.write().await.insert(index, config);
    }

    pub async fn port_mode(&self, index: usize) -> PortVlanConfig {
        self.port_mode
            .read()
            .await
            .get(&index)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeviceReceive for VSwitch {
    fn base(&self) -> &EthernetDeviceBase {
        &self.base
    }

    async fn default_receive(&self, ingress: usize, frame: EthernetFrame) {
        let destination = frame.destination();
        if destination.is_broadcast() {
            trace!(device = %self.base.name, ingress, "flooding broadcast frame");
            self.base.flood(ingress, &frame);
            return;
        }
        match self.base.lookup(destination).await {
            Some(egress) => {
                trace!(device = %self.base.name, ingress, egress, "forwarding unicast frame");
                let _ = self.base.write_from_port(egress, frame);
            }
            None => {
                trace!(device = %self.base.name, ingress, "unknown unicast destination, flooding");
                self.base.flood(ingress, &frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddr;

    #[tokio::test]
    async fn floods_unknown_unicast_to_every_port_but_ingress() {
        let tracker = DeliveryTracker::new();
        let switch = VSwitch::new("sw", 3, tracker.clone());
        let outside_a = VPort::new("a", MacAddr::random(), tracker.clone());
        let outside_b = VPort::new("b", MacAddr::random(), tracker.clone());
        let outside_c = VPort::new("c", MacAddr::random(), tracker.clone());
        switch.attach_peer(&outside_a).unwrap();
        switch.attach_peer(&outside_b).unwrap();
        switch.attach_peer(&outside_c).unwrap();

        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for peer in [&outside_b, &outside_c] {
            let hits = hits.clone();
            peer.set_on_receive(Arc::new(move |_f| {
                let hits = hits.clone();
                Box::pin(async move {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }));
        }
        let a_hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let a_hits = a_hits.clone();
            outside_a.set_on_receive(Arc::new(move |_f| {
                let a_hits = a_hits.clone();
                Box::pin(async move {
                    a_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }));
        }

        let unknown_mac = MacAddr::random();
        let frame = EthernetFrame::new(unknown_mac, outside_a.mac(), 0x1001, b"x");
        outside_a.write(frame).unwrap();
        tracker.all_settled().await;

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(a_hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn two_switches_learn_four_macs_on_first_exchange() {
        // S1: two 10-port switches linked together, p1 attaches to sw1, p2
        // attaches to sw2, p1 sends a frame to p2 and p2 replies. Flooding
        // the first frame (neither switch has learned anything yet) teaches
        // sw1 p1's own mac on the ingress port, and teaches sw2 sw1's
        // link-port mac on the port the flooded copy arrived on (flooding
        // goes through write_from_port, which rewrites the source address
        // to the egress port's own mac before it crosses the link). p2's
        // reply then teaches sw2 p2's own mac and sw1 sw2's link-port mac
        // the same way, for four newly-learned (device, mac) pairs in
        // total, none of them relearned a second time.
        let tracker = DeliveryTracker::new();
        let sw1 = VSwitch::new("sw1", 10, tracker.clone());
        let sw2 = VSwitch::new("sw2", 10, tracker.clone());

        // Link the switches directly port-to-port; each switch's own port
        // already has its dispatch handler installed from construction.
        VPort::link(&sw1.base().ports()[0], &sw2.base().ports()[0]);

        let p1_mac = MacAddr::new([0x42, 0x69, 0, 0, 0, 1]);
        let p1 = VPort::new("p1", p1_mac, tracker.clone());
        let p2_mac = MacAddr::new([0x42, 0x69, 0, 0, 0, 2]);
        let p2 = VPort::new("p2", p2_mac, tracker.clone());
        let p1_local = sw1.attach_peer(&p1).unwrap();
        let p2_local = sw2.attach_peer(&p2).unwrap();

        let p2_received = Arc::new(std::sync::Mutex::new(Vec::<Vec<u8>>::new()));
        {
            let p2_received = p2_received.clone();
            p2.set_on_receive(Arc::new(move |frame: EthernetFrame| {
                let p2_received = p2_received.clone();
                Box::pin(async move {
                    p2_received.lock().unwrap().push(frame.payload().to_vec());
                })
            }));
        }

        let frame = EthernetFrame::new(p2_mac, p1_mac, 0x1001, b"Hello");
        p1.write(frame).unwrap();
        tracker.all_settled().await;

        assert_eq!(p2_received.lock().unwrap().len(), 1);
        assert_eq!(p2_received.lock().unwrap()[0], b"Hello");

        // sw1 learned p1 on p1's own port. The flooded copy that reached sw2
        // crossed the inter-switch link via write_from_port, which rewrote
        // its source to sw1's link-port mac, so sw2 learned that mac on the
        // link port it arrived on (link ports are both index 0 by
        // construction), never p1_mac itself.
        let sw1_link_index = 0;
        let sw2_link_index = 0;
        let sw1_link_mac = sw1.base().port(sw1_link_index).unwrap().mac();
        let sw2_link_mac = sw2.base().port(sw2_link_index).unwrap().mac();
        let p1_index_on_sw1 = sw1.base().port_index_of(&p1_local).unwrap();
        let p2_index_on_sw2 = sw2.base().port_index_of(&p2_local).unwrap();
        assert_eq!(sw1.base().lookup(p1_mac).await, Some(p1_index_on_sw1));
        assert_eq!(sw2.base().lookup(sw1_link_mac).await, Some(sw2_link_index));

        let p1_received = Arc::new(std::sync::Mutex::new(Vec::<Vec<u8>>::new()));
        {
            let p1_received = p1_received.clone();
            p1.set_on_receive(Arc::new(move |frame: EthernetFrame| {
                let p1_received = p1_received.clone();
                Box::pin(async move {
                    p1_received.lock().unwrap().push(frame.payload().to_vec());
                })
            }));
        }

        let reply = EthernetFrame::new(p1_mac, p2_mac, 0x1001, b"Hi back");
        p2.write(reply).unwrap();
        tracker.all_settled().await;

        assert_eq!(p1_received.lock().unwrap().len(), 1);
        assert_eq!(p1_received.lock().unwrap()[0], b"Hi back");

        // p2's reply teaches sw2 p2's own mac, and teaches sw1 sw2's
        // link-port mac the same way the first frame taught sw2 sw1's, for
        // four learned (device, mac) pairs overall; p1's entries are
        // unchanged by the reply.
        assert_eq!(sw2.base().lookup(p2_mac).await, Some(p2_index_on_sw2));
        assert_eq!(sw1.base().lookup(sw2_link_mac).await, Some(sw1_link_index));
        assert_eq!(sw1.base().lookup(p1_mac).await, Some(p1_index_on_sw1));
        assert_eq!(sw2.base().lookup(sw1_link_mac).await, Some(sw2_link_index));
    }

    #[tokio::test]
    async fn disconnect_resets_port_mode_and_purges_mac_table() {
        let tracker = DeliveryTracker::new();
        let switch = VSwitch::new("sw", 2, tracker.clone());
        let peer = VPort::new("peer", MacAddr::random(), tracker);
        switch.attach_peer(&peer).unwrap();
        switch
            .set_port_mode(
                0,
                PortVlanConfig {
                    mode: PortMode::Trunk,
                    vlan: 42,
                },
            )
            .await;
        switch.base().learn(0, peer.mac()).await;

        switch.disconnect(&peer).await.unwrap();

        assert!(!peer.is_connected());
        assert_eq!(switch.base().lookup(peer.mac()).await, None);
        assert_eq!(switch.port_mode(0).await, PortVlanConfig::default());
    }
}
