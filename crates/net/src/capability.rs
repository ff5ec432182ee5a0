use async_trait::async_trait;

use crate::frame::EthernetFrame;
use crate::vport::VPort;

/// Outcome of a capability processing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    /// Processing is finished; no further capability or default handling runs.
    Done,
    /// Processing must stop; the frame is dropped.
    Fail,
    /// This capability does not apply; try the next one.
    Pass,
}

/// An ordered per-frame handler installed on an Ethernet device.
///
/// `matches` must be a cheap, side-effect-free precondition check: a
/// capability whose `matches` returns `false` must not be invoked.
#[async_trait]
pub trait Capability: Send + Sync {
    fn matches(&self, port: &VPort, frame: &EthernetFrame) -> bool;

    async fn handle(&self, port: &VPort, frame: &EthernetFrame) -> CapabilityStatus;
}

/// Walks an ordered capability chain for one inbound frame.
///
/// Returns `true` if some capability returned `Done` or `Fail` (i.e. the
/// device's default `on_receive` must not run), `false` if the chain fell
/// through entirely on `Pass`.
pub async fn run_chain(
    capabilities: &[std::sync::Arc<dyn Capability>],
    port: &VPort,
    frame: &EthernetFrame,
) -> bool {
    for capability in capabilities {
        if !capability.matches(port, frame) {
            continue;
        }
        match capability.handle(port, frame).await {
            CapabilityStatus::Done | CapabilityStatus::Fail => return true,
            CapabilityStatus::Pass => continue,
        }
    }
    false
}
