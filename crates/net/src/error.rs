use std::io;

use thiserror::Error;

/// Every failure kind the fabric dataplane and its collaborators can raise.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("vport is not connected to a peer")]
    NotConnected,

    #[error("port not found on this device")]
    PortNotFound,

    #[error("no free port available")]
    NoFreePort,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid handshake magic byte")]
    InvalidMagic,

    #[error("invalid route configuration: {0}")]
    RouteConfig(String),

    #[error("arp resolution timed out")]
    ArpTimeout,

    #[error("io error: {0}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            NetError::NotConnected.to_string(),
            "vport is not connected to a peer"
        );
        assert_eq!(
            NetError::PortNotFound.to_string(),
            "port not found on this device"
        );
        assert_eq!(NetError::NoFreePort.to_string(), "no free port available");
        assert_eq!(
            NetError::InvalidFrame("too short".into()).to_string(),
            "invalid frame: too short"
        );
        assert_eq!(
            NetError::InvalidMagic.to_string(),
            "invalid handshake magic byte"
        );
        assert_eq!(
            NetError::RouteConfig("missing via/interface".into()).to_string(),
            "invalid route configuration: missing via/interface"
        );
        assert_eq!(
            NetError::ArpTimeout.to_string(),
            "arp resolution timed out"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded");
        let net_err: NetError = io_err.into();
        assert!(matches!(net_err, NetError::IoError(_)));
    }
}
