use std::net::SocketAddr;
use std::path::PathBuf;

use exu_net::tap::TapDevice;
use exu_net::tunnel::client_handshake;
use tracing::{info, warn};

use crate::config;

const MAX_DATAGRAM: usize = 4096;

/// Starts a TAP client: creates (or reuses) the named host TAP interface,
/// handshakes with a fabric server to obtain an address, then forwards
/// frames bidirectionally between the TAP device and the server's tunnel
/// socket until either side closes.
pub async fn run(
    config_path: Option<PathBuf>,
    server_override: Option<String>,
    tap_name_override: Option<String>,
) -> anyhow::Result<()> {
    let cfg = config::load_client_config(config_path.as_deref(), server_override, tap_name_override)?;
    let server_addr: SocketAddr = cfg.server.parse()?;

    let mut tap = TapDevice::create(&cfg.tap_name).await?;
    let mac = TapDevice::hardware_address(&cfg.tap_name)?;
    info!(tap = %cfg.tap_name, %mac, %server_addr, "tap interface ready, starting handshake");

    let (listener, dialer, assigned_ip) = client_handshake(server_addr, mac).await?;
    info!(%assigned_ip, "fabric assigned address");
    tap.assign_address(assigned_ip).await?;

    let mut tap_buf = [0u8; MAX_DATAGRAM];
    let mut net_buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = tap.read_frame(&mut tap_buf) => {
                match result {
                    Ok(0) => {
                        warn!("tap interface closed, exiting");
                        break;
                    }
                    Ok(n) => {
                        if let Err(err) = dialer.send(&tap_buf[..n]).await {
                            warn!(?err, "failed to forward frame to fabric, exiting");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(?err, "failed to read from tap interface, exiting");
                        break;
                    }
                }
            }
            result = listener.recv_from(&mut net_buf) => {
                match result {
                    Ok((n, _from)) => {
                        if let Err(err) = tap.write_frame(&net_buf[..n]).await {
                            warn!(?err, "failed to write frame to tap interface, exiting");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(?err, "tunnel socket read failed, exiting");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
