use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::frame::EthernetFrame;
use crate::mac::MacAddr;
use crate::vport::{DeliveryTracker, VPort};

const HANDSHAKE_MAGIC: u8 = 0x42;
const HANDSHAKE_LEN: usize = 9;
const MAX_DATAGRAM: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the handshake and bidirectional pump for exactly one tunnel client
/// bound to `rx_port`, then returns when the client disconnects. Matches
/// the source's one-dedicated-socket-per-client design: there is no
/// multiplexing or source-address filtering within a single accept call.
///
/// `on_connect` is invoked once the vPort has been created, typically to
/// attach it into a switch or router; `on_disconnect` runs when the loop
/// exits for any reason.
pub async fn accept_client<F, G>(
    rx_port: u16,
    assigned_ip: Ipv4Addr,
    tracker: DeliveryTracker,
    on_connect: F,
    on_disconnect: G,
) -> Result<()>
where
    F: Fn(VPort) + Send + Sync + 'static,
    G: FnOnce(VPort) + Send + 'static,
{
    let rx = UdpSocket::bind(("0.0.0.0", rx_port)).await?;
    let mut handshake_buf = [0u8; HANDSHAKE_LEN];
    let (len, client_addr) = rx.recv_from(&mut handshake_buf).await?;
    if len != HANDSHAKE_LEN || handshake_buf[0] != HANDSHAKE_MAGIC {
        return Err(NetError::InvalidMagic);
    }
    let client_rx_port = u16::from_le_bytes([handshake_buf[1], handshake_buf[2]]);
    let client_mac = MacAddr::from_slice(&handshake_buf[3..9])
        .ok_or_else(|| NetError::InvalidFrame("bad handshake mac".into()))?;

    let tx_addr = SocketAddr::new(client_addr.ip(), client_rx_port);
    let tx = UdpSocket::bind(("0.0.0.0", 0)).await?;
    tx.connect(tx_addr).await?;
    tx.send(&assigned_ip.octets()).await?;
    let tx = Arc::new(tx);

    info!(%client_addr, %client_mac, %assigned_ip, "tunnel client handshake complete");

    let vport = VPort::new(format!("tunnel/{rx_port}"), client_mac, tracker);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<()>();

    let tx_for_receive = tx.clone();
    let error_tx_for_receive = error_tx.clone();
    vport.set_on_receive(Arc::new(move |frame: EthernetFrame| {
        let tx = tx_for_receive.clone();
        let error_tx = error_tx_for_receive.clone();
        Box::pin(async move {
            if tx.send(frame.as_bytes()).await.is_err() {
                let _ = error_tx.send(());
            }
        })
    }));

    on_connect(vport.clone());

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        if !vport.is_connected() {
            on_connect(vport.clone());
            tokio::task::yield_now().await;
            continue;
        }
        if error_rx.try_recv().is_ok() {
            warn!(%client_addr, "tunnel write path signaled an error, closing");
            break;
        }
        match tokio::time::timeout(READ_TIMEOUT, rx.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => match EthernetFrame::parse(&buf[..n]) {
                Ok(frame) => {
                    if let Err(err) = vport.write(frame) {
                        debug!(%client_addr, ?err, "failed to deliver frame from tunnel");
                    }
                }
                Err(err) => debug!(%client_addr, ?err, "dropping malformed tunnel frame"),
            },
            Ok(Err(err)) => {
                warn!(%client_addr, ?err, "tunnel socket read failed, closing");
                break;
            }
            Err(_timeout) => continue,
        }
    }

    vport.unlink();
    on_disconnect(vport);
    Ok(())
}

const CLIENT_IP_WAIT: Duration = Duration::from_secs(5);

/// Performs the client side of the tunnel handshake against `server_addr`.
/// Returns a `listener` socket (bound to a random local port, advertised in
/// the handshake, used to receive the IP assignment and all subsequent
/// inbound frames) and a `dialer` socket (connected to the server's
/// well-known port, used for the handshake itself and all outbound
/// frames), along with the assigned IPv4 address.
pub async fn client_handshake(
    server_addr: SocketAddr,
    mac: MacAddr,
) -> Result<(UdpSocket, UdpSocket, Ipv4Addr)> {
    let listener = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let listener_port = listener.local_addr()?.port();

    let dialer = UdpSocket::bind(("0.0.0.0", 0)).await?;
    dialer.connect(server_addr).await?;

    let mut handshake = [0u8; HANDSHAKE_LEN];
    handshake[0] = HANDSHAKE_MAGIC;
    handshake[1..3].copy_from_slice(&listener_port.to_le_bytes());
    handshake[3..9].copy_from_slice(&mac.bytes());
    dialer.send(&handshake).await?;

    let mut ip_buf = [0u8; 4];
    let (n, _) = tokio::time::timeout(CLIENT_IP_WAIT, listener.recv_from(&mut ip_buf))
        .await
        .map_err(|_| NetError::IoError(io::Error::new(io::ErrorKind::TimedOut, "server did not assign an ip in time")))??;
    if n != 4 {
        return Err(NetError::InvalidFrame("short ip assignment datagram".into()));
    }

    Ok((listener, dialer, Ipv4Addr::from(ip_buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_handshake_with_bad_magic() {
        let rx_port = 16554;
        let tracker = DeliveryTracker::new();
        let server = tokio::spawn(accept_client(
            rx_port,
            Ipv4Addr::new(10, 0, 0, 5),
            tracker,
            |_vport| {},
            |_vport| {},
        ));

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        client
            .send_to(&[0u8; HANDSHAKE_LEN], ("127.0.0.1", rx_port))
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(NetError::InvalidMagic)));
    }

    #[tokio::test]
    async fn valid_handshake_assigns_ip_and_creates_vport() {
        let rx_port = 16555;
        let tracker = DeliveryTracker::new();
        let connected = Arc::new(std::sync::Mutex::new(false));
        let connected_clone = connected.clone();

        let server = tokio::spawn(accept_client(
            rx_port,
            Ipv4Addr::new(10, 0, 0, 7),
            tracker,
            move |_vport| {
                *connected_clone.lock().unwrap() = true;
            },
            |_vport| {},
        ));

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_port = client.local_addr().unwrap().port();
        let mut handshake = [0u8; HANDSHAKE_LEN];
        handshake[0] = HANDSHAKE_MAGIC;
        handshake[1..3].copy_from_slice(&client_port.to_le_bytes());
        handshake[3..9].copy_from_slice(MacAddr::random().as_slice());
        client
            .send_to(&handshake, ("127.0.0.1", rx_port))
            .await
            .unwrap();

        let mut ip_buf = [0u8; 4];
        let (n, _) = client.recv_from(&mut ip_buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(Ipv4Addr::from(ip_buf), Ipv4Addr::new(10, 0, 0, 7));

        assert!(*connected.lock().unwrap());
        server.abort();
    }

    #[tokio::test]
    async fn client_handshake_round_trips_with_accept_client() {
        let rx_port = 16556;
        let tracker = DeliveryTracker::new();
        let server = tokio::spawn(accept_client(
            rx_port,
            Ipv4Addr::new(10, 0, 0, 9),
            tracker,
            |_vport| {},
            |_vport| {},
        ));

        let client_mac = MacAddr::random();
        let server_addr: SocketAddr = ("127.0.0.1", rx_port).into();
        let (_listener, _dialer, assigned_ip) =
            client_handshake(server_addr, client_mac).await.unwrap();
        assert_eq!(assigned_ip, Ipv4Addr::new(10, 0, 0, 9));

        server.abort();
    }
}
