//! Host TAP interface management: out-of-core collaborator that shells out
//! to the `ip` tool to create and address a `tapN` device, and opens its
//! file descriptor for raw frame I/O. Kept deliberately modest in scope.

use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::{NetError, Result};
use crate::mac::MacAddr;

/// A host TAP device, opened for raw Ethernet frame read/write.
pub struct TapDevice {
    name: String,
    file: tokio::fs::File,
}

#[cfg(unix)]
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
#[cfg(unix)]
const IFF_TAP: i16 = 0x0002;
#[cfg(unix)]
const IFF_NO_PI: i16 = 0x1000;

impl TapDevice {
    /// Creates (or reuses) a TAP interface named `name` and opens its file
    /// descriptor for raw frame I/O, via `ip tuntap add`. The interface is
    /// left unaddressed and down; call [`TapDevice::assign_address`] once
    /// the fabric has handed out an IP (tunnel clients don't know their
    /// address until after the handshake completes).
    #[cfg(unix)]
    pub async fn create(name: &str) -> Result<Self> {
        let status = Command::new("ip")
            .args(["tuntap", "add", "dev", name, "mode", "tap"])
            .status()?;
        if !status.success() {
            return Err(NetError::IoError(io::Error::other(format!(
                "ip tuntap add failed for {name}"
            ))));
        }

        let file = open_tap_fd(name)?;

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Assigns `address`/24 to the interface and brings it up, via
    /// `ip addr add` then `ip link set up`.
    #[cfg(unix)]
    pub async fn assign_address(&self, address: Ipv4Addr) -> Result<()> {
        let status = Command::new("ip")
            .args(["addr", "add", &format!("{address}/24"), "dev", &self.name])
            .status()?;
        if !status.success() {
            return Err(NetError::IoError(io::Error::other(format!(
                "ip addr add failed for {}",
                self.name
            ))));
        }

        let status = Command::new("ip")
            .args(["link", "set", "dev", &self.name, "up"])
            .status()?;
        if !status.success() {
            return Err(NetError::IoError(io::Error::other(format!(
                "ip link set up failed for {}",
                self.name
            ))));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn create(_name: &str) -> Result<Self> {
        Err(NetError::IoError(io::Error::other(
            "TAP devices are only supported on unix hosts",
        )))
    }

    #[cfg(not(unix))]
    pub async fn assign_address(&self, _address: Ipv4Addr) -> Result<()> {
        Err(NetError::IoError(io::Error::other(
            "TAP devices are only supported on unix hosts",
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads the interface's own hardware address via `ip address show`,
    /// parsing the `link/ether ` line the way tunnel clients discover the
    /// MAC to present in their handshake.
    pub fn hardware_address(name: &str) -> Result<MacAddr> {
        let output = Command::new("ip")
            .args(["address", "show", name])
            .output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mac = text
            .lines()
            .find_map(|line| line.trim().strip_prefix("link/ether "))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(parse_mac_text)
            .ok_or_else(|| NetError::IoError(io::Error::other(format!("no mac found for {name}"))))?;
        Ok(mac)
    }

    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        Ok(self.file.read(buf).await?)
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.file.write_all(frame).await?;
        Ok(())
    }
}

fn parse_mac_text(text: &str) -> Option<MacAddr> {
    let mut bytes = [0u8; 6];
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(MacAddr::new(bytes))
}

#[cfg(unix)]
fn open_tap_fd(name: &str) -> Result<tokio::fs::File> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

    let mut ifr = Ifreq::default();
    let name_bytes = name.as_bytes();
    ifr.name[..name_bytes.len()].copy_from_slice(name_bytes);
    ifr.flags = IFF_TAP | IFF_NO_PI;

    let res = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr as *const Ifreq) };
    if res < 0 {
        return Err(NetError::IoError(io::Error::last_os_error()));
    }

    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(NetError::IoError(io::Error::last_os_error()));
    }
    Ok(tokio::fs::File::from_std(file))
}

#[cfg(unix)]
#[repr(C)]
struct Ifreq {
    name: [u8; 16],
    flags: i16,
    _pad: [u8; 22],
}

#[cfg(unix)]
impl Default for Ifreq {
    fn default() -> Self {
        Self {
            name: [0; 16],
            flags: 0,
            _pad: [0; 22],
        }
    }
}
