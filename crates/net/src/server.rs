use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::ippool::IpPool;
use crate::tunnel::accept_client;
use crate::vport::{DeliveryTracker, VPort};

/// Owns the shared IP pool and a small pool of candidate tunnel rx_ports,
/// and runs one [`accept_client`] loop per port, recycling each slot after
/// its client disconnects.
///
/// This resolves an ambiguity the distilled design left implicit: the
/// remote-vPort handshake is, by construction, single-client-per-socket, so
/// serving several concurrent tunnel clients means running several of those
/// loops side by side rather than demultiplexing one socket.
pub struct FabricServer {
    ip_pool: Arc<IpPool>,
    base_port: u16,
    max_clients: u16,
    tracker: DeliveryTracker,
}

impl FabricServer {
    pub fn new(
        base_port: u16,
        max_clients: u16,
        subnet_base: Ipv4Addr,
        tracker: DeliveryTracker,
    ) -> Self {
        Self {
            ip_pool: Arc::new(IpPool::new_slash24(subnet_base)),
            base_port,
            max_clients,
            tracker,
        }
    }

    /// Runs forever, serving `max_clients` concurrent tunnel slots. `attach`
    /// is invoked for every newly-handshaken client's vPort (typically to
    /// wire it into a switch or router); `detach` is invoked with the same
    /// vPort when that client disconnects, before its rx_port slot is
    /// recycled for the next client (so the caller can purge any device
    /// state, e.g. a switch's mac_table, pointing at the freed port).
    /// Both must be cheap to clone.
    pub async fn run<F, D>(&self, attach: F, detach: D) -> Result<()>
    where
        F: Fn(VPort) + Send + Sync + Clone + 'static,
        D: Fn(VPort) + Send + Sync + Clone + 'static,
    {
        let mut slots = Vec::with_capacity(self.max_clients as usize);
        for offset in 0..self.max_clients {
            let rx_port = self.base_port + offset;
            let ip_pool = self.ip_pool.clone();
            let tracker = self.tracker.clone();
            let attach = attach.clone();
            let detach = detach.clone();
            slots.push(tokio::spawn(async move {
                loop {
                    let assigned_ip = match ip_pool.allocate() {
                        Ok(ip) => ip,
                        Err(err) => {
                            warn!(?err, rx_port, "no free ip to assign, slot idling");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    let connect_hook = attach.clone();
                    let detach_hook = detach.clone();
                    let ip_pool_for_release = ip_pool.clone();
                    let result = accept_client(
                        rx_port,
                        assigned_ip,
                        tracker.clone(),
                        move |vport| connect_hook(vport),
                        move |vport| {
                            detach_hook(vport);
                            ip_pool_for_release.release(assigned_ip);
                        },
                    )
                    .await;
                    if let Err(err) = result {
                        warn!(?err, rx_port, "tunnel slot ended, re-accepting");
                        ip_pool.release(assigned_ip);
                    }
                }
            }));
        }
        for slot in slots {
            let _ = slot.await;
        }
        Ok(())
    }
}
