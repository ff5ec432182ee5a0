use std::net::Ipv4Addr;
use std::path::PathBuf;

use exu_net::server::FabricServer;
use exu_net::switch::VSwitch;
use exu_net::vport::DeliveryTracker;
use tracing::{info, warn};

use crate::config;

pub async fn run(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    subnet: Option<Ipv4Addr>,
    max_clients: Option<u16>,
) -> anyhow::Result<()> {
    let cfg =
        config::load_server_config(config_path.as_deref(), port, subnet, max_clients)?;
    info!(
        port = cfg.port,
        subnet = %cfg.subnet_base,
        max_clients = cfg.max_clients,
        "starting fabric server"
    );

    let tracker = DeliveryTracker::new();
    let switch = VSwitch::new("fabric", cfg.max_clients as usize, tracker.clone());
    let fabric_server = FabricServer::new(cfg.port, cfg.max_clients, cfg.subnet_base, tracker);

    let attach_switch = switch.clone();
    let detach_switch = switch;
    fabric_server
        .run(
            move |vport| {
                if let Err(err) = attach_switch.attach_peer(&vport) {
                    warn!(?err, "failed to attach tunnel client to fabric");
                }
            },
            move |vport| {
                let detach_switch = detach_switch.clone();
                tokio::spawn(async move {
                    if let Err(err) = detach_switch.disconnect(&vport).await {
                        warn!(?err, "failed to detach disconnected tunnel client from fabric");
                    }
                });
            },
        )
        .await?;

    Ok(())
}
