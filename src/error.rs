//! Crate-wide error type.
//!
//! One variant per failure class the engine can surface. Network and crypto
//! failures that a peer could trigger carry an [`ErrorKind`] tag so the shell
//! can distinguish a transport hiccup from a security-relevant event.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used in `security_error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Discovery,
    Dial,
    Handshake,
    FrameParse,
    Decryption,
    Policy,
    Transfer,
    Backpressure,
    Identity,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("frame parse error: {0}")]
    FrameParse(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    /// The per-socket send queue is full; the session stays intact.
    #[error("peer_slow: send queue full for device {0}")]
    Backpressure(String),

    #[error("identity store error: {0}")]
    Identity(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("peer_offline: device {0} is offline")]
    PeerOffline(String),

    #[error("no active session with device {0}")]
    NotConnected(String),

    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("delete window expired for message {0}")]
    DeleteWindowExpired(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::Dial(_) => ErrorKind::Dial,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::FrameParse(_) => ErrorKind::FrameParse,
            Error::Decryption(_) => ErrorKind::Decryption,
            Error::Policy(_) => ErrorKind::Policy,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::Backpressure(_) => ErrorKind::Backpressure,
            Error::Identity(_) => ErrorKind::Identity,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::FrameParse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
