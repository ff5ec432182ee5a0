use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::arp::{ArpOpcode, ArpPacket, ARP_PACKET_LEN};
use crate::device::{install_receive_handlers, DeviceReceive, EthernetDeviceBase};
use crate::error::{NetError, Result};
use crate::frame::{EthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::icmp::{IcmpPayload, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
use crate::ipv4::{Ipv4Packet, PROTO_ICMP};
use crate::mac::MacAddr;
use crate::vport::{DeliveryTracker, VPort};

const ARP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ARP_POLL_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct IpNet {
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl IpNet {
    pub fn new(address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { address, mask }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(self.address) & mask == u32::from(ip) & mask
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.mask).count_ones()
    }
}

/// State and operations shared by [`IpDevice`] and `VRouter`: per-port IP
/// assignment, ARP table, and the ARP resolver used to discover next-hop
/// MACs.
pub struct IpDeviceCore {
    pub base: EthernetDeviceBase,
    port_ips: RwLock<HashMap<usize, IpNet>>,
    arp_table: RwLock<HashMap<Ipv4Addr, MacAddr>>,
}

impl IpDeviceCore {
    pub fn new(base: EthernetDeviceBase) -> Self {
        Self {
            base,
            port_ips: RwLock::new(HashMap::new()),
            arp_table: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_port_ip(&self, index: usize, net: IpNet) {
        self.port_ips.write().await.insert(index, net);
    }

    pub async fn port_ip(&self, index: usize) -> Option<IpNet> {
        self.port_ips.read().await.get(&index).copied()
    }

    pub async fn port_owning(&self, ip: Ipv4Addr) -> Option<usize> {
        self.port_ips
            .read()
            .await
            .iter()
            .find(|(_, net)| net.address == ip)
            .map(|(index, _)| *index)
    }

    /// Finds the port whose attached subnet contains `ip`, used by the
    /// router to locate an egress interface for a next-hop address.
    pub async fn port_owning_net_containing(&self, ip: Ipv4Addr) -> Option<usize> {
        self.port_ips
            .read()
            .await
            .iter()
            .find(|(_, net)| net.contains(ip))
            .map(|(index, _)| *index)
    }

    pub async fn learn_arp(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.arp_table.write().await.insert(ip, mac);
    }

    pub async fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp_table.read().await.get(&ip).copied()
    }

    async fn candidate_ports(&self, ip: Ipv4Addr) -> Vec<usize> {
        let port_ips = self.port_ips.read().await;
        let matching: Vec<usize> = port_ips
            .iter()
            .filter(|(_, net)| net.contains(ip))
            .map(|(index, _)| *index)
            .collect();
        if matching.is_empty() {
            (0..self.base.ports().len()).collect()
        } else {
            matching
        }
    }

    /// Resolves `ip` to a MAC address, consulting the ARP table first and
    /// falling back to flooding an ARP request on every candidate port,
    /// then polling for up to 5 seconds.
    pub async fn arp_resolve(&self, ip: Ipv4Addr) -> Result<MacAddr> {
        if let Some(mac) = self.arp_lookup(ip).await {
            return Ok(mac);
        }

        let candidates = self.candidate_ports(ip).await;
        let sender = self
            .port_ip(*candidates.first().unwrap_or(&0))
            .await
            .or(self.port_ip(0).await);
        let (sender_ip, sender_mac) = match sender {
            Some(net) => (
                net.address,
                self.base
                    .port(*candidates.first().unwrap_or(&0))
                    .map(|p| p.mac())
                    .unwrap_or_else(MacAddr::zero),
            ),
            None => (Ipv4Addr::UNSPECIFIED, MacAddr::zero()),
        };

        let request = ArpPacket {
            opcode: ArpOpcode::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::zero(),
            target_ip: ip,
        };
        for index in &candidates {
            let frame = EthernetFrame::new(
                crate::mac::BROADCAST,
                sender_mac,
                ETHERTYPE_ARP,
                &request.to_bytes(),
            );
            let _ = self.base.write_from_port(*index, frame);
        }

        for _ in 0..ARP_POLL_ITERATIONS {
            tokio::time::sleep(ARP_POLL_INTERVAL).await;
            if let Some(mac) = self.arp_lookup(ip).await {
                return Ok(mac);
            }
        }
        Err(NetError::ArpTimeout)
    }
}

/// Implemented by any device whose IpDeviceCore the ARP/ForwardArp/ICMP
/// capabilities need to reach back into.
pub trait IpCapable: Send + Sync {
    fn ip_core(&self) -> &IpDeviceCore;
}

/// An IP-aware Ethernet device terminating ARP and ICMP Echo locally for
/// its own port addresses, and forwarding everything else by MAC table or
/// flood, same as a plain switch.
pub struct IpDevice {
    core: IpDeviceCore,
}

impl IpDevice {
    pub fn new(name: impl Into<String>, num_ports: usize, tracker: DeliveryTracker) -> Arc<Self> {
        Arc::new_cyclic(|weak_self: &Weak<IpDevice>| {
            let base = EthernetDeviceBase::new(name, num_ports, tracker);
            let device = Self {
                core: IpDeviceCore::new(base),
            };
            install_receive_handlers(device.core.base.ports(), weak_self.clone());
            device
        })
    }

    pub fn core(&self) -> &IpDeviceCore {
        &self.core
    }

    pub fn base(&self) -> &EthernetDeviceBase {
        &self.core.base
    }

    pub fn attach_peer(&self, peer: &VPort) -> Result<VPort> {
        self.core.base.attach_peer(peer)
    }

    pub async fn set_port_ip(&self, index: usize, net: IpNet) {
        self.core.set_port_ip(index, net).await;
    }
}

impl IpCapable for IpDevice {
    fn ip_core(&self) -> &IpDeviceCore {
        &self.core
    }
}

#[async_trait]
impl DeviceReceive for IpDevice {
    fn base(&self) -> &EthernetDeviceBase {
        &self.core.base
    }

    async fn default_receive(&self, ingress: usize, frame: EthernetFrame) {
        let destination = frame.destination();
        if destination.is_broadcast() {
            self.core.base.flood(ingress, &frame);
            return;
        }
        match self.core.base.lookup(destination).await {
            Some(egress) => {
                let _ = self.core.base.write_from_port(egress, frame);
            }
            None => self.core.base.flood(ingress, &frame),
        }
    }
}

/// ARP capability: terminates requests/replies addressed to one of this
/// device's own port IPs; passes everything else through.
pub struct ArpCapability<D: IpCapable> {
    device: Weak<D>,
}

impl<D: IpCapable> ArpCapability<D> {
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            device: Arc::downgrade(device),
        }
    }
}

#[async_trait]
impl<D: IpCapable + Send + Sync + 'static> crate::capability::Capability for ArpCapability<D> {
    fn matches(&self, _port: &VPort, frame: &EthernetFrame) -> bool {
        frame.ethertype() == ETHERTYPE_ARP && frame.payload().len() >= ARP_PACKET_LEN
    }

    async fn handle(
        &self,
        port: &VPort,
        frame: &EthernetFrame,
    ) -> crate::capability::CapabilityStatus {
        use crate::capability::CapabilityStatus;
        let Some(device) = self.device.upgrade() else {
            return CapabilityStatus::Pass;
        };
        let core = device.ip_core();
        let Ok(packet) = ArpPacket::parse(frame.payload()) else {
            return CapabilityStatus::Fail;
        };
        let Some(port_index) = core.base.port_index_of(port) else {
            return CapabilityStatus::Pass;
        };
        let Some(own_net) = core.port_ip(port_index).await else {
            return CapabilityStatus::Pass;
        };

        match packet.opcode {
            ArpOpcode::Reply if packet.target_ip == own_net.address => {
                core.learn_arp(packet.sender_ip, packet.sender_mac).await;
                debug!(ip = %packet.sender_ip, mac = %packet.sender_mac, "learned arp entry");
                CapabilityStatus::Done
            }
            ArpOpcode::Request if packet.target_ip == own_net.address => {
                let reply = ArpPacket {
                    opcode: ArpOpcode::Reply,
                    sender_mac: port.mac(),
                    sender_ip: own_net.address,
                    target_mac: packet.sender_mac,
                    target_ip: packet.sender_ip,
                };
                let reply_frame = EthernetFrame::new(
                    packet.sender_mac,
                    port.mac(),
                    ETHERTYPE_ARP,
                    &reply.to_bytes(),
                );
                let _ = port.write(reply_frame);
                CapabilityStatus::Done
            }
            _ => CapabilityStatus::Pass,
        }
    }
}

/// ForwardArp capability: for ARP traffic not addressed to our own IPs,
/// forward by MAC table or flood, same as ordinary switch traffic.
pub struct ForwardArpCapability<D: IpCapable> {
    device: Weak<D>,
}

impl<D: IpCapable> ForwardArpCapability<D> {
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            device: Arc::downgrade(device),
        }
    }
}

#[async_trait]
impl<D: IpCapable + Send + Sync + 'static> crate::capability::Capability
    for ForwardArpCapability<D>
{
    fn matches(&self, _port: &VPort, frame: &EthernetFrame) -> bool {
        frame.ethertype() == ETHERTYPE_ARP
    }

    async fn handle(
        &self,
        port: &VPort,
        frame: &EthernetFrame,
    ) -> crate::capability::CapabilityStatus {
        use crate::capability::CapabilityStatus;
        let Some(device) = self.device.upgrade() else {
            return CapabilityStatus::Pass;
        };
        let core = device.ip_core();
        let Ok(packet) = ArpPacket::parse(frame.payload()) else {
            return CapabilityStatus::Fail;
        };
        if core.port_owning(packet.target_ip).await.is_some() {
            return CapabilityStatus::Pass;
        }
        let Some(ingress) = core.base.port_index_of(port) else {
            return CapabilityStatus::Pass;
        };
        match core.base.lookup(frame.destination()).await {
            Some(egress) => {
                let _ = core.base.write_from_port(egress, frame.clone());
            }
            None => core.base.flood(ingress, frame),
        }
        CapabilityStatus::Done
    }
}

/// ICMP capability: answers Echo Requests addressed to our own port IPs
/// with an Echo Reply; passes everything else through.
pub struct IcmpCapability<D: IpCapable> {
    device: Weak<D>,
}

impl<D: IpCapable> IcmpCapability<D> {
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            device: Arc::downgrade(device),
        }
    }
}

#[async_trait]
impl<D: IpCapable + Send + Sync + 'static> crate::capability::Capability for IcmpCapability<D> {
    fn matches(&self, _port: &VPort, frame: &EthernetFrame) -> bool {
        frame.ethertype() == ETHERTYPE_IPV4
    }

    async fn handle(
        &self,
        port: &VPort,
        frame: &EthernetFrame,
    ) -> crate::capability::CapabilityStatus {
        use crate::capability::CapabilityStatus;
        let Some(device) = self.device.upgrade() else {
            return CapabilityStatus::Pass;
        };
        let core = device.ip_core();
        let Ok(ip_packet) = Ipv4Packet::parse(frame.payload()) else {
            return CapabilityStatus::Fail;
        };
        if ip_packet.protocol != PROTO_ICMP {
            return CapabilityStatus::Pass;
        }
        let Some(port_index) = core.base.port_index_of(port) else {
            return CapabilityStatus::Pass;
        };
        let Some(own_net) = core.port_ip(port_index).await else {
            return CapabilityStatus::Pass;
        };
        if ip_packet.destination != own_net.address {
            return CapabilityStatus::Pass;
        }
        let Ok(icmp) = IcmpPayload::parse(&ip_packet.payload) else {
            return CapabilityStatus::Fail;
        };
        if icmp.icmp_type != ICMP_TYPE_ECHO_REQUEST {
            return CapabilityStatus::Pass;
        }

        let reply_icmp = IcmpPayload::new_echo_reply(icmp.data);
        let reply_ip = Ipv4Packet::new(
            own_net.address,
            ip_packet.source,
            PROTO_ICMP,
            64,
            reply_icmp.to_bytes(),
        );
        let reply_frame = EthernetFrame::new(
            frame.source(),
            port.mac(),
            ETHERTYPE_IPV4,
            &reply_ip.to_bytes(),
        );
        let _ = port.write(reply_frame);
        CapabilityStatus::Done
    }
}
