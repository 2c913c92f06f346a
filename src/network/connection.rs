//! Connection manager.
//!
//! Keeps the per-peer session table: at most one active session per device
//! id, each bound to one TCP socket and one ephemeral session key. Dialing,
//! the mutual HELLO_SECURE exchange, the per-socket reader task and the
//! serialized write queue all live here, as do the heartbeat and the
//! promote-on-traffic rule.
//!
//! Writes are serialized through a bounded per-socket queue so frames are
//! never interleaved mid-bytes; a full queue fails the send and leaves the
//! session intact.

use crate::crypto::{self, Keypair, SessionCrypto};
use crate::discovery::peers::PeerRegistry;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::identity::IdentityStore;
use crate::network::codec::{self, FrameReader};
use crate::network::protocol::{now_ms, ControlMessage, ID_HELLO};
use crate::network::optimize_socket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// TCP connect timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// From connected to ESTABLISHED.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// PING cadence; a peer missing one full round goes offline.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const HEARTBEAT_GRACE_MS: i64 = 2_000;

/// Bound of the per-socket write queue.
const SEND_QUEUE_FRAMES: usize = 64;

/// Consecutive decryption failures that tear the session down.
const MAX_DECRYPT_FAILURES: u32 = 3;

/// A decoded control frame attributed to the session it arrived on.
#[derive(Debug)]
pub struct InboundFrame {
    pub peer: String,
    pub msg: ControlMessage,
}

struct PeerConnection {
    crypto: SessionCrypto,
    tx: mpsc::Sender<Vec<u8>>,
    last_activity: Arc<AtomicI64>,
    epoch: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct ConnectionManager {
    identity: Arc<IdentityStore>,
    peers: PeerRegistry,
    events: EventBus,
    inbound: mpsc::Sender<InboundFrame>,
    sessions: RwLock<HashMap<String, PeerConnection>>,
    epochs: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        identity: Arc<IdentityStore>,
        peers: PeerRegistry,
        events: EventBus,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            peers,
            events,
            inbound,
            sessions: RwLock::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        })
    }

    /// Whether a writable session to this peer exists right now.
    pub async fn has_session(&self, device_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(device_id)
            .map(|c| !c.tx.is_closed())
            .unwrap_or(false)
    }

    /// Crypto state of the current session, used by the file engine to key
    /// dedicated stream sockets.
    pub async fn session_crypto(&self, device_id: &str) -> Option<SessionCrypto> {
        self.sessions
            .read()
            .await
            .get(device_id)
            .map(|c| c.crypto.clone())
    }

    /// Queue a frame to a peer. Every frame on an established session is
    /// sealed in the encrypted envelope; without a session the send fails, and
    /// sensitive payloads never fall back to plaintext.
    pub async fn send(&self, device_id: &str, msg: ControlMessage) -> Result<()> {
        let sessions = self.sessions.read().await;
        let conn = sessions
            .get(device_id)
            .filter(|c| !c.tx.is_closed())
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;

        let envelope = crypto::encrypt_control(&conn.crypto, &msg)?;
        let line = codec::encode_frame(&envelope)?;

        conn.tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Backpressure(device_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => Error::NotConnected(device_id.to_string()),
        })
    }

    /// Return once a writable session to the peer exists, dialing and
    /// handshaking if necessary.
    pub async fn ensure_session(self: &Arc<Self>, device_id: &str) -> Result<()> {
        if self.has_session(device_id).await {
            return Ok(());
        }
        let addr = self
            .peers
            .dial_addr(device_id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        self.dial(device_id, addr).await?;
        Ok(())
    }

    /// Dial a peer and run the outbound side of the handshake.
    async fn dial(self: &Arc<Self>, device_id: &str, addr: SocketAddr) -> Result<()> {
        debug!(peer = device_id, %addr, "dialing");
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Dial(format!("connect to {} failed: {}", addr, e))),
            Err(_) => return Err(Error::Dial(format!("connect to {} timed out", addr))),
        };
        optimize_socket(&stream);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        // Our HELLO_SECURE is the key-exchange frame itself: plaintext, once.
        let keypair = Keypair::generate();
        let hello = self.local_hello(&keypair);
        write_half
            .write_all(&codec::encode_frame(&hello)?)
            .await
            .map_err(|e| {
                self.handshake_failed(device_id, &format!("failed to send HELLO_SECURE: {}", e))
            })?;

        let line = match timeout(HANDSHAKE_TIMEOUT, reader.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(self.handshake_failed(device_id, "connection closed during handshake"))
            }
            Ok(Err(e)) => {
                return Err(self.handshake_failed(device_id, &format!("read failed: {}", e)))
            }
            Err(_) => return Err(self.handshake_failed(device_id, "handshake timed out")),
        };

        let frame = codec::decode_frame(&line)
            .map_err(|e| self.handshake_failed(device_id, &e.to_string()))?;

        match frame {
            ControlMessage::HelloSecure {
                from,
                public_key,
                display_name,
                platform,
                app_version,
                profile_image,
                ..
            } => {
                if from != device_id {
                    warn!(expected = device_id, got = %from, "peer identified as a different device");
                }
                let key = keypair
                    .agree(&public_key)
                    .map_err(|e| self.handshake_failed(&from, &e.to_string()))?;
                self.peers
                    .learn_identity(&from, &display_name, &platform, &app_version, profile_image)
                    .await;
                self.install_session(&from, SessionCrypto::new(key), reader, write_half)
                    .await;
                Ok(())
            }
            other => Err(self.handshake_failed(
                device_id,
                &format!("expected HELLO_SECURE, got {}", other.type_name()),
            )),
        }
    }

    /// Run the inbound side of the handshake for an accepted socket whose
    /// first frame has already been read by the listener.
    pub(crate) async fn accept_handshake(
        self: &Arc<Self>,
        first_frame: ControlMessage,
        reader: FrameReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let (from, public_key, display_name, platform, app_version, profile_image) =
            match first_frame {
                ControlMessage::HelloSecure {
                    from,
                    public_key,
                    display_name,
                    platform,
                    app_version,
                    profile_image,
                    ..
                } => (
                    from,
                    public_key,
                    display_name,
                    platform,
                    app_version,
                    profile_image,
                ),
                other => {
                    return Err(self.handshake_failed(
                        &peer_addr.to_string(),
                        &format!("expected HELLO_SECURE, got {}", other.type_name()),
                    ))
                }
            };

        debug!(peer = %from, %peer_addr, "inbound handshake");

        let keypair = Keypair::generate();
        let hello = self.local_hello(&keypair);
        write_half
            .write_all(&codec::encode_frame(&hello)?)
            .await
            .map_err(|e| {
                self.handshake_failed(&from, &format!("failed to send HELLO_SECURE: {}", e))
            })?;

        let key = keypair
            .agree(&public_key)
            .map_err(|e| self.handshake_failed(&from, &e.to_string()))?;

        self.peers
            .learn_identity(&from, &display_name, &platform, &app_version, profile_image)
            .await;
        self.install_session(&from, SessionCrypto::new(key), reader, write_half)
            .await;
        Ok(())
    }

    fn handshake_failed(&self, peer: &str, detail: &str) -> Error {
        self.events.emit(Event::SecurityError {
            kind: crate::error::ErrorKind::Handshake,
            peer: Some(peer.to_string()),
            detail: detail.to_string(),
        });
        Error::Handshake(detail.to_string())
    }

    fn local_hello(&self, keypair: &Keypair) -> ControlMessage {
        let identity = self.identity.identity();
        ControlMessage::HelloSecure {
            from: identity.device_id,
            id: ID_HELLO.to_string(),
            ts: now_ms(),
            public_key: keypair.public_spki(),
            display_name: identity.display_name,
            platform: identity.platform,
            app_version: identity.app_version,
            profile_image: identity.profile_image,
        }
    }

    /// Install an established session, superseding any older one for the
    /// same peer. The old reader is aborted before the new entry goes in so
    /// no stale frames surface after the swap.
    async fn install_session(
        self: &Arc<Self>,
        device_id: &str,
        session: SessionCrypto,
        reader: FrameReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
    ) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let last_activity = Arc::new(AtomicI64::new(now_ms()));

        let (tx, rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_FRAMES);
        let writer = tokio::spawn(write_loop(write_half, rx));
        let reader = tokio::spawn(read_loop(
            Arc::clone(self),
            device_id.to_string(),
            session.clone(),
            reader,
            Arc::clone(&last_activity),
            epoch,
        ));

        let conn = PeerConnection {
            crypto: session,
            tx,
            last_activity,
            epoch,
            reader,
            writer,
        };

        {
            let mut sessions = self.sessions.write().await;
            if let Some(old) = sessions.remove(device_id) {
                info!(peer = device_id, "superseding existing session");
                old.reader.abort();
                old.writer.abort();
            }
            sessions.insert(device_id.to_string(), conn);
        }

        if self.peers.touch_online(device_id).await {
            if let Some(peer) = self.peers.get(device_id).await {
                self.events.emit(Event::DeviceFound { peer });
            }
        }
        info!(peer = device_id, "session established");
        self.events.emit(Event::DeviceConnected {
            device_id: device_id.to_string(),
        });
    }

    /// Drop the session for a peer if `epoch` still names the current one.
    async fn teardown(self: &Arc<Self>, device_id: &str, epoch: u64) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(device_id)
                .map(|conn| conn.epoch == epoch)
                .unwrap_or(false);
            if current {
                sessions.remove(device_id)
            } else {
                None
            }
        };
        if let Some(conn) = removed {
            conn.writer.abort();
            info!(peer = device_id, "session closed");
            self.events.emit(Event::DeviceDisconnected {
                device_id: device_id.to_string(),
            });
        }
    }

    /// Explicitly drop a session regardless of epoch.
    pub async fn close_session(self: &Arc<Self>, device_id: &str) {
        let removed = self.sessions.write().await.remove(device_id);
        if let Some(conn) = removed {
            conn.reader.abort();
            conn.writer.abort();
            self.events.emit(Event::DeviceDisconnected {
                device_id: device_id.to_string(),
            });
        }
    }

    /// Close every session; used at shutdown.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, conn) in sessions.drain() {
            conn.reader.abort();
            conn.writer.abort();
        }
    }

    /// One heartbeat round: liveness-check and PING every online peer.
    pub async fn heartbeat_pulse(self: &Arc<Self>) {
        let self_id = self.identity.device_id();
        for device_id in self.peers.online_ids().await {
            let stale = {
                let sessions = self.sessions.read().await;
                sessions.get(&device_id).map(|conn| {
                    let idle = now_ms() - conn.last_activity.load(Ordering::Relaxed);
                    idle > HEARTBEAT_INTERVAL.as_millis() as i64 + HEARTBEAT_GRACE_MS
                })
            };

            if stale == Some(true) {
                debug!(peer = %device_id, "heartbeat missed, marking offline");
                self.close_session(&device_id).await;
                if self.peers.mark_offline(&device_id).await {
                    self.events.emit(Event::DeviceLost {
                        device_id: device_id.clone(),
                    });
                }
                continue;
            }

            match self.ensure_session(&device_id).await {
                Ok(()) => {
                    if let Err(e) = self.send(&device_id, ControlMessage::ping(&self_id)).await {
                        debug!(peer = %device_id, error = %e, "heartbeat send failed");
                    }
                }
                Err(e) => {
                    debug!(peer = %device_id, error = %e, "heartbeat dial failed, marking offline");
                    if self.peers.mark_offline(&device_id).await {
                        self.events.emit(Event::DeviceLost {
                            device_id: device_id.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Spawn the periodic heartbeat task.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would ping before discovery settles.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                mgr.heartbeat_pulse().await;
            }
        })
    }
}

/// Drain the per-socket write queue; the single writer per socket keeps
/// frames contiguous on the wire.
async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_half.write_all(&line).await {
            warn!(error = %e, "socket write failed");
            break;
        }
        if let Err(e) = write_half.flush().await {
            warn!(error = %e, "socket flush failed");
            break;
        }
    }
}

/// Per-socket reader: decode, decrypt, enforce the plaintext policy, answer
/// heartbeats, forward the rest to the router.
async fn read_loop(
    mgr: Arc<ConnectionManager>,
    peer: String,
    session: SessionCrypto,
    mut reader: FrameReader<OwnedReadHalf>,
    last_activity: Arc<AtomicI64>,
    epoch: u64,
) {
    let mut decrypt_failures: u32 = 0;

    loop {
        let msg = match reader.next_frame().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "read loop ended");
                break;
            }
        };

        last_activity.store(now_ms(), Ordering::Relaxed);
        if mgr.peers.touch_online(&peer).await {
            if let Some(record) = mgr.peers.get(&peer).await {
                mgr.events.emit(Event::DeviceFound { peer: record });
            }
        }

        let inner = match msg {
            ControlMessage::Encrypted { iv, tag, payload } => {
                match crypto::decrypt_control(&session, &iv, &tag, &payload) {
                    Ok(inner) => {
                        decrypt_failures = 0;
                        inner
                    }
                    Err(e) => {
                        decrypt_failures += 1;
                        mgr.events.emit(Event::SecurityError {
                            kind: e.kind(),
                            peer: Some(peer.clone()),
                            detail: e.to_string(),
                        });
                        if decrypt_failures >= MAX_DECRYPT_FAILURES {
                            warn!(peer = %peer, "too many decryption failures, closing session");
                            break;
                        }
                        continue;
                    }
                }
            }
            plain if plain.is_sensitive() => {
                // Sensitive types must arrive enveloped; drop and flag.
                mgr.events.emit(Event::SecurityError {
                    kind: crate::error::ErrorKind::Policy,
                    peer: Some(peer.clone()),
                    detail: format!("plaintext {} rejected", plain.type_name()),
                });
                continue;
            }
            plain => plain,
        };

        match inner {
            ControlMessage::Ping { .. } => {
                let pong = ControlMessage::pong(&mgr.identity.device_id());
                if let Err(e) = mgr.send(&peer, pong).await {
                    debug!(peer = %peer, error = %e, "failed to answer ping");
                }
            }
            ControlMessage::Pong { .. } => {}
            ControlMessage::HelloSecure { .. } => {
                warn!(peer = %peer, "duplicate HELLO_SECURE ignored");
            }
            other => {
                if mgr
                    .inbound
                    .send(InboundFrame {
                        peer: peer.clone(),
                        msg: other,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    mgr.teardown(&peer, epoch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageBody;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    struct TestNode {
        _config: TempDir,
        identity: Arc<IdentityStore>,
        peers: PeerRegistry,
        events: tokio::sync::mpsc::Receiver<Event>,
        inbound: tokio::sync::mpsc::Receiver<InboundFrame>,
        connections: Arc<ConnectionManager>,
    }

    fn test_node(name: &str) -> TestNode {
        let config = TempDir::new().unwrap();
        let identity = Arc::new(IdentityStore::new(
            config.path().to_path_buf(),
            "0.1.0".to_string(),
        ));
        identity.update_display_name(name).unwrap();
        let peers = PeerRegistry::new(&identity.device_id());
        let (bus, events) = EventBus::new(64);
        let (inbound_tx, inbound) = mpsc::channel(64);
        let connections =
            ConnectionManager::new(Arc::clone(&identity), peers.clone(), bus, inbound_tx);
        TestNode {
            _config: config,
            identity,
            peers,
            events,
            inbound,
            connections,
        }
    }

    /// Accept one control connection on behalf of `node`.
    fn accept_one(node: &TestNode, listener: TcpListener) -> JoinHandle<()> {
        let connections = Arc::clone(&node.connections);
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            optimize_socket(&stream);
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let line = reader.next_line().await.unwrap().unwrap();
            let first = codec::decode_frame(&line).unwrap();
            connections
                .accept_handshake(first, reader, write_half, peer_addr)
                .await
                .unwrap();
        })
    }

    async fn register_peer(node: &TestNode, other: &TestNode, port: u16) {
        node.peers
            .upsert_discovered(crate::discovery::peers::PeerRecord {
                device_id: other.identity.device_id(),
                display_name: other.identity.display_name(),
                hostname: "localhost".into(),
                addresses: vec![Ipv4Addr::LOCALHOST.into()],
                port,
                platform: "test".into(),
                app_version: "0.1.0".into(),
                last_seen: now_ms(),
                online: true,
                profile_image: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_loopback_handshake_and_encrypted_message() {
        let alice = test_node("Alice");
        let mut bob = test_node("Bob");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = accept_one(&bob, listener);

        register_peer(&alice, &bob, port).await;

        let bob_id = bob.identity.device_id();
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept.await.unwrap();

        assert!(alice.connections.has_session(&bob_id).await);
        assert!(bob
            .connections
            .has_session(&alice.identity.device_id())
            .await);

        // A sensitive frame crosses encrypted and arrives intact.
        let msg = ControlMessage::Message {
            from: alice.identity.device_id(),
            id: "m-1".into(),
            ts: now_ms(),
            body: MessageBody::Text {
                text: "hello".into(),
            },
        };
        alice.connections.send(&bob_id, msg.clone()).await.unwrap();

        let frame = bob.inbound.recv().await.unwrap();
        assert_eq!(frame.peer, alice.identity.device_id());
        assert_eq!(frame.msg, msg);

        // Bob learned Alice's display name during the handshake.
        let record = bob.peers.get(&alice.identity.device_id()).await.unwrap();
        assert_eq!(record.display_name, "Alice");
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let alice = test_node("Alice");
        let err = alice
            .connections
            .send(
                "nobody",
                ControlMessage::Message {
                    from: alice.identity.device_id(),
                    id: "m".into(),
                    ts: 0,
                    body: MessageBody::Text { text: "x".into() },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_ensure_session_unknown_peer() {
        let alice = test_node("Alice");
        let err = alice.connections.ensure_session("ghost").await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_message_order_preserved_under_burst() {
        let alice = test_node("Alice");
        let mut bob = test_node("Bob");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = accept_one(&bob, listener);
        register_peer(&alice, &bob, port).await;

        let bob_id = bob.identity.device_id();
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept.await.unwrap();

        let total = 100;
        let mut sent = 0usize;
        while sent < total {
            let msg = ControlMessage::Message {
                from: alice.identity.device_id(),
                id: format!("m-{}", sent),
                ts: now_ms(),
                body: MessageBody::Text {
                    text: sent.to_string(),
                },
            };
            match alice.connections.send(&bob_id, msg).await {
                Ok(()) => sent += 1,
                // Queue full: yield until the writer drains.
                Err(Error::Backpressure(_)) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected send error: {}", e),
            }
        }

        for i in 0..total {
            let frame = bob.inbound.recv().await.unwrap();
            match frame.msg {
                ControlMessage::Message { id, .. } => assert_eq!(id, format!("m-{}", i)),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_second_handshake_supersedes_first() {
        let alice = test_node("Alice");
        let mut bob = test_node("Bob");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bob_id = bob.identity.device_id();

        let accept = accept_one(&bob, listener);
        register_peer(&alice, &bob, port).await;
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept.await.unwrap();

        // Same peer, new socket: the fresh handshake must supersede.
        let listener2 = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port2 = listener2.local_addr().unwrap().port();
        let accept2 = accept_one(&bob, listener2);
        register_peer(&alice, &bob, port2).await;
        alice.connections.close_session(&bob_id).await;
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept2.await.unwrap();

        // Bob holds exactly one session for Alice, the newer one; frames
        // still flow.
        let msg = ControlMessage::Message {
            from: alice.identity.device_id(),
            id: "after".into(),
            ts: now_ms(),
            body: MessageBody::Text { text: "hi".into() },
        };
        alice.connections.send(&bob_id, msg.clone()).await.unwrap();
        let frame = bob.inbound.recv().await.unwrap();
        assert_eq!(frame.msg, msg);
        assert_eq!(bob.connections.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let alice = test_node("Alice");
        let bob = test_node("Bob");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = accept_one(&bob, listener);
        register_peer(&alice, &bob, port).await;

        let bob_id = bob.identity.device_id();
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept.await.unwrap();

        let before = {
            let sessions = alice.connections.sessions.read().await;
            sessions[&bob_id].last_activity.load(Ordering::Relaxed)
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        alice
            .connections
            .send(&bob_id, ControlMessage::ping(&alice.identity.device_id()))
            .await
            .unwrap();

        // Bob's reader answers with PONG; Alice's activity clock advances.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = {
            let sessions = alice.connections.sessions.read().await;
            sessions[&bob_id].last_activity.load(Ordering::Relaxed)
        };
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_disconnect_emits_device_disconnected() {
        let alice = test_node("Alice");
        let mut bob = test_node("Bob");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = accept_one(&bob, listener);
        register_peer(&alice, &bob, port).await;

        let bob_id = bob.identity.device_id();
        alice.connections.ensure_session(&bob_id).await.unwrap();
        accept.await.unwrap();

        alice.connections.close_session(&bob_id).await;

        // Bob's reader observes EOF and removes its session.
        let alice_id = alice.identity.device_id();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !bob.connections.has_session(&alice_id).await {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "session never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut saw_disconnect = false;
        while let Ok(ev) = bob.events.try_recv() {
            if matches!(ev, Event::DeviceDisconnected { ref device_id } if *device_id == alice_id)
            {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }
}
