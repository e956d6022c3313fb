//! Error taxonomy shared by every layer of the simulated stack.

use thiserror::Error;

/// Errors surfaced by configuration, socket, diagnostic and codec operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetError {
    /// Malformed address, or an address of the wrong family for the target.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no such interface: {0}")]
    InvalidInterface(u32),
    #[error("address already in use")]
    AddressInUse,
    #[error("no free ephemeral port")]
    PortsExhausted,
    #[error("no route to host")]
    NoRoute,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("socket is not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    /// A PDU or capture file failed to decode.
    #[error("malformed PDU: {0}")]
    MalformedPdu(&'static str),
    #[error("use of closed socket")]
    UseOfClosedSocket,
    /// A receive or accept is already suspended on this socket.
    #[error("another receive is already pending on this socket")]
    ReceivePending,
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
