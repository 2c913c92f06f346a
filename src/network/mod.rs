//! Networking: wire protocol, frame codec, connection manager, TCP listener
//! and the file-transfer engine.

pub mod codec;
pub mod connection;
pub mod file_transfer;
pub mod protocol;
pub mod server;

pub use connection::{ConnectionManager, InboundFrame};
pub use file_transfer::{FileTransfer, FileTransferService, TransferStatus};
pub use protocol::{ControlMessage, DeleteScope, MessageBody};

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

/// Send/receive buffer size for control and stream sockets.
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Tune a socket for LAN transfers: no Nagle, large buffers, TCP keepalive.
/// Failures degrade performance, not correctness, so they only log.
pub(crate) fn optimize_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }

    let socket_ref = socket2::SockRef::from(stream);

    if let Err(e) = socket_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %e, "failed to set send buffer size");
    }
    if let Err(e) = socket_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %e, "failed to set recv buffer size");
    }

    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    if let Err(e) = socket_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive");
    }
}
