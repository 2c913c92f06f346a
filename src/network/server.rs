//! TCP listener.
//!
//! Accepts peer connections and classifies each socket by its first line:
//! a `FILE_STREAM:` header detaches the socket to the file-transfer engine,
//! anything else must be the plaintext HELLO_SECURE opening the handshake.

use crate::events::{Event, EventBus};
use crate::network::codec::{self, FrameReader};
use crate::network::connection::{ConnectionManager, HANDSHAKE_TIMEOUT};
use crate::network::file_transfer::FileTransferService;
use crate::network::optimize_socket;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Run the accept loop until the task is cancelled.
pub(crate) async fn serve(
    listener: TcpListener,
    connections: Arc<ConnectionManager>,
    transfers: Arc<FileTransferService>,
    events: EventBus,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(%peer_addr, "accepted connection");
                let connections = Arc::clone(&connections);
                let transfers = Arc::clone(&transfers);
                let events = events.clone();
                tokio::spawn(async move {
                    handle_socket(stream, peer_addr, connections, transfers, events).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    connections: Arc<ConnectionManager>,
    transfers: Arc<FileTransferService>,
    events: EventBus,
) {
    optimize_socket(&stream);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let first_line = match timeout(HANDSHAKE_TIMEOUT, reader.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(%peer_addr, error = %e, "failed to read first line");
            return;
        }
        Err(_) => {
            debug!(%peer_addr, "first frame timed out");
            return;
        }
    };

    // Raw file streams never enter the NDJSON path.
    if let Some(file_id) = codec::parse_file_stream_header(&first_line) {
        let file_id = file_id.to_string();
        let (read_half, residual) = reader.into_parts();
        transfers.accept_stream(&file_id, residual, read_half).await;
        return;
    }

    let first_frame = match codec::decode_frame(&first_line) {
        Ok(frame) => frame,
        Err(e) => {
            events.emit(Event::SecurityError {
                kind: crate::error::ErrorKind::Handshake,
                peer: None,
                detail: format!("{} sent an unparseable first frame: {}", peer_addr, e),
            });
            return;
        }
    };

    if let Err(e) = connections
        .accept_handshake(first_frame, reader, write_half, peer_addr)
        .await
    {
        debug!(%peer_addr, error = %e, "inbound handshake failed");
    }
}
