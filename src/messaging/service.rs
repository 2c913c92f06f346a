//! Messaging engine.
//!
//! Chat messages get a fresh UUID and a millisecond timestamp and travel
//! encrypted over the control session. The receiver acks every message with
//! MESSAGE_DELIVERED (queued only after `message_received` has been emitted
//! locally) and, on an explicit `mark_read`, with MESSAGE_READ. Remote
//! deletion is allowed for fifteen minutes after the send, against online
//! peers only; nothing is ever queued for later delivery.

use crate::discovery::peers::PeerRegistry;
use crate::error::{Error, Result};
use crate::events::{DeliveryStatus, Event, EventBus};
use crate::network::connection::ConnectionManager;
use crate::network::protocol::{now_ms, ControlMessage, DeleteScope, MessageBody, ID_ACK};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Remote delete is honored this long after the original send, sender clock.
pub const DELETE_WINDOW_MS: i64 = 15 * 60 * 1000;

/// An accepted outbound message, as echoed back to the host.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: String,
    pub to: String,
    pub ts: i64,
}

#[derive(Debug, Clone)]
struct SentRecord {
    peer: String,
    ts: i64,
    status: DeliveryStatus,
}

pub struct MessagingService {
    self_id: String,
    connections: Arc<ConnectionManager>,
    peers: PeerRegistry,
    events: EventBus,
    /// Outbound messages by id, for the ack pipeline and the delete window.
    sent: RwLock<HashMap<String, SentRecord>>,
    /// Inbound message ids we have already acked as read.
    read_acked: RwLock<HashSet<String>>,
}

impl MessagingService {
    pub fn new(
        self_id: String,
        connections: Arc<ConnectionManager>,
        peers: PeerRegistry,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            connections,
            peers,
            events,
            sent: RwLock::new(HashMap::new()),
            read_acked: RwLock::new(HashSet::new()),
        })
    }

    /// Send a chat payload to a peer, returning the canonical message id the
    /// receiver will see.
    pub async fn send_message(&self, peer: &str, body: MessageBody) -> Result<OutgoingMessage> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now_ms();

        let msg = ControlMessage::Message {
            from: self.self_id.clone(),
            id: id.clone(),
            ts,
            body: body.clone(),
        };
        self.connections.ensure_session(peer).await?;
        self.connections.send(peer, msg).await?;

        self.sent.write().await.insert(
            id.clone(),
            SentRecord {
                peer: peer.to_string(),
                ts,
                status: DeliveryStatus::Sent,
            },
        );

        self.events.emit(Event::MessageSent {
            to: peer.to_string(),
            id: id.clone(),
            ts,
            body,
        });
        debug!(peer = %peer, id = %id, "message sent");

        Ok(OutgoingMessage {
            id,
            to: peer.to_string(),
            ts,
        })
    }

    /// Ack a received message as read. Idempotent: repeated calls for the
    /// same id are accepted but send nothing new.
    pub async fn mark_read(&self, peer: &str, msg_id: &str) -> Result<()> {
        if self.read_acked.read().await.contains(msg_id) {
            return Ok(());
        }

        let ack = ControlMessage::MessageRead {
            from: self.self_id.clone(),
            id: ID_ACK.to_string(),
            ts: now_ms(),
            ack_id: msg_id.to_string(),
        };
        self.connections.ensure_session(peer).await?;
        self.connections.send(peer, ack).await?;

        self.read_acked.write().await.insert(msg_id.to_string());
        Ok(())
    }

    /// Ask the peer to delete a message we sent. Only within the fifteen
    /// minute window, and only while the peer is online; queueing for later
    /// is out of scope.
    pub async fn delete_remote(&self, peer: &str, msg_id: &str) -> Result<()> {
        let record = self
            .sent
            .read()
            .await
            .get(msg_id)
            .cloned()
            .ok_or_else(|| Error::MessageNotFound(msg_id.to_string()))?;
        if record.peer != peer {
            return Err(Error::MessageNotFound(msg_id.to_string()));
        }
        if !within_delete_window(record.ts, now_ms()) {
            return Err(Error::DeleteWindowExpired(msg_id.to_string()));
        }
        if !self.peers.is_online(peer).await {
            return Err(Error::PeerOffline(peer.to_string()));
        }

        let msg = ControlMessage::MessageDelete {
            from: self.self_id.clone(),
            id: ID_ACK.to_string(),
            ts: now_ms(),
            ack_id: msg_id.to_string(),
            scope: DeleteScope::Everyone,
        };
        self.connections.ensure_session(peer).await?;
        self.connections.send(peer, msg).await?;
        info!(peer = %peer, id = %msg_id, "remote delete requested");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Router-driven handlers
    // ------------------------------------------------------------------

    /// Inbound MESSAGE: surface it, then ack delivery. The ack is queued
    /// strictly after the local `message_received` emit.
    pub async fn handle_message(&self, peer: &str, id: &str, ts: i64, body: MessageBody) {
        self.events.emit(Event::MessageReceived {
            from: peer.to_string(),
            id: id.to_string(),
            ts,
            body,
        });

        let ack = ControlMessage::MessageDelivered {
            from: self.self_id.clone(),
            id: ID_ACK.to_string(),
            ts: now_ms(),
            ack_id: id.to_string(),
        };
        if let Err(e) = self.connections.send(peer, ack).await {
            debug!(peer = %peer, id = %id, error = %e, "delivery ack failed");
        }
    }

    pub async fn handle_delivered(&self, peer: &str, ack_id: &str) {
        self.advance_status(peer, ack_id, DeliveryStatus::Delivered)
            .await;
    }

    pub async fn handle_read(&self, peer: &str, ack_id: &str) {
        self.advance_status(peer, ack_id, DeliveryStatus::Read).await;
    }

    /// Inbound MESSAGE_DELETE: honored unconditionally.
    pub async fn handle_delete(&self, peer: &str, ack_id: &str, scope: DeleteScope) {
        self.events.emit(Event::MessageDeleted {
            peer: peer.to_string(),
            id: ack_id.to_string(),
            scope,
        });
        info!(peer = %peer, id = %ack_id, "message deleted by sender");
    }

    /// Move a sent message forward in the delivery pipeline. Acks never move
    /// a message backwards, and acks from the wrong peer are dropped.
    async fn advance_status(&self, peer: &str, ack_id: &str, status: DeliveryStatus) {
        let mut sent = self.sent.write().await;
        match sent.get_mut(ack_id) {
            Some(record) if record.peer == peer && status > record.status => {
                record.status = status;
                self.events.emit(Event::MessageStatusUpdated {
                    id: ack_id.to_string(),
                    status,
                });
            }
            Some(_) => {}
            None => debug!(id = %ack_id, "ack for unknown message"),
        }
    }
}

fn within_delete_window(sent_ts: i64, now: i64) -> bool {
    now.saturating_sub(sent_ts) <= DELETE_WINDOW_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::peers::PeerRecord;
    use crate::identity::IdentityStore;
    use crate::network::codec::{self, FrameReader};
    use crate::network::connection::InboundFrame;
    use crate::network::optimize_socket;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_delete_window_arithmetic() {
        let sent = 1_700_000_000_000i64;
        assert!(within_delete_window(sent, sent));
        assert!(within_delete_window(sent, sent + DELETE_WINDOW_MS));
        assert!(!within_delete_window(sent, sent + DELETE_WINDOW_MS + 1));
        // A skewed clock that reads earlier than the send never blocks.
        assert!(within_delete_window(sent, sent - 5_000));
    }

    struct Chat {
        _config: TempDir,
        identity: Arc<IdentityStore>,
        peers: PeerRegistry,
        events: mpsc::Receiver<Event>,
        messaging: Arc<MessagingService>,
        port: u16,
    }

    /// A node with a listener and a router wired for messaging frames only.
    async fn chat_node(name: &str) -> Chat {
        let config = TempDir::new().unwrap();
        let identity = Arc::new(IdentityStore::new(
            config.path().to_path_buf(),
            "0.1.0".to_string(),
        ));
        identity.update_display_name(name).unwrap();
        let peers = PeerRegistry::new(&identity.device_id());
        let (bus, events) = EventBus::new(256);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(256);
        let connections =
            ConnectionManager::new(Arc::clone(&identity), peers.clone(), bus.clone(), inbound_tx);
        let messaging = MessagingService::new(
            identity.device_id(),
            Arc::clone(&connections),
            peers.clone(),
            bus,
        );

        // Accept loop: handshake every inbound control socket.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                optimize_socket(&stream);
                let (read_half, write_half) = stream.into_split();
                let mut reader = FrameReader::new(read_half);
                let line = match reader.next_line().await {
                    Ok(Some(line)) => line,
                    _ => continue,
                };
                let first = match codec::decode_frame(&line) {
                    Ok(first) => first,
                    Err(_) => continue,
                };
                let _ = accept_connections
                    .accept_handshake(first, reader, write_half, peer_addr)
                    .await;
            }
        });

        // Router restricted to the messaging frames.
        let router_messaging = Arc::clone(&messaging);
        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                match frame.msg {
                    ControlMessage::Message { id, ts, body, .. } => {
                        router_messaging
                            .handle_message(&frame.peer, &id, ts, body)
                            .await;
                    }
                    ControlMessage::MessageDelivered { ack_id, .. } => {
                        router_messaging.handle_delivered(&frame.peer, &ack_id).await;
                    }
                    ControlMessage::MessageRead { ack_id, .. } => {
                        router_messaging.handle_read(&frame.peer, &ack_id).await;
                    }
                    ControlMessage::MessageDelete { ack_id, scope, .. } => {
                        router_messaging
                            .handle_delete(&frame.peer, &ack_id, scope)
                            .await;
                    }
                    _ => {}
                }
            }
        });

        Chat {
            _config: config,
            identity,
            peers,
            events,
            messaging,
            port,
        }
    }

    async fn introduce(a: &Chat, b: &Chat) {
        a.peers
            .upsert_discovered(PeerRecord {
                device_id: b.identity.device_id(),
                display_name: b.identity.display_name(),
                hostname: "localhost".into(),
                addresses: vec![Ipv4Addr::LOCALHOST.into()],
                port: b.port,
                platform: "test".into(),
                app_version: "0.1.0".into(),
                last_seen: now_ms(),
                online: true,
                profile_image: None,
            })
            .await;
    }

    async fn next_event_matching<F>(chat: &mut Chat, mut predicate: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout(deadline, chat.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_message_ack_pipeline() {
        let mut alice = chat_node("Alice").await;
        let mut bob = chat_node("Bob").await;
        introduce(&alice, &bob).await;
        introduce(&bob, &alice).await;

        let bob_id = bob.identity.device_id();
        let alice_id = alice.identity.device_id();

        let out = alice
            .messaging
            .send_message(
                &bob_id,
                MessageBody::Text {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();

        // Bob surfaces the message; Alice sees it move to delivered.
        let received = next_event_matching(&mut bob, |e| {
            matches!(e, Event::MessageReceived { id, .. } if *id == out.id)
        })
        .await;
        match received {
            Event::MessageReceived { from, body, .. } => {
                assert_eq!(from, alice_id);
                assert_eq!(
                    body,
                    MessageBody::Text {
                        text: "hello".into()
                    }
                );
            }
            _ => unreachable!(),
        }

        next_event_matching(&mut alice, |e| {
            matches!(
                e,
                Event::MessageStatusUpdated { id, status: DeliveryStatus::Delivered }
                    if *id == out.id
            )
        })
        .await;

        // Read receipt, idempotently.
        bob.messaging.mark_read(&alice_id, &out.id).await.unwrap();
        bob.messaging.mark_read(&alice_id, &out.id).await.unwrap();

        next_event_matching(&mut alice, |e| {
            matches!(
                e,
                Event::MessageStatusUpdated { id, status: DeliveryStatus::Read }
                    if *id == out.id
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_remote_delete() {
        let mut alice = chat_node("Alice").await;
        let mut bob = chat_node("Bob").await;
        introduce(&alice, &bob).await;
        introduce(&bob, &alice).await;

        let bob_id = bob.identity.device_id();

        let out = alice
            .messaging
            .send_message(&bob_id, MessageBody::Text { text: "oops".into() })
            .await
            .unwrap();
        next_event_matching(&mut bob, |e| {
            matches!(e, Event::MessageReceived { id, .. } if *id == out.id)
        })
        .await;

        alice.messaging.delete_remote(&bob_id, &out.id).await.unwrap();
        let deleted = next_event_matching(&mut bob, |e| {
            matches!(e, Event::MessageDeleted { id, .. } if *id == out.id)
        })
        .await;
        assert!(matches!(
            deleted,
            Event::MessageDeleted {
                scope: DeleteScope::Everyone,
                ..
            }
        ));

        // Unknown ids and offline peers fail cleanly.
        assert!(matches!(
            alice.messaging.delete_remote(&bob_id, "no-such-id").await,
            Err(Error::MessageNotFound(_))
        ));
        alice.peers.mark_offline(&bob_id).await;
        assert!(matches!(
            alice.messaging.delete_remote(&bob_id, &out.id).await,
            Err(Error::PeerOffline(_))
        ));
    }
}
