//! hyperconnect: peer-to-peer LAN file sharing and messaging.
//!
//! Nodes advertise themselves over mDNS, discover each other, and establish
//! authenticated encrypted TCP sessions carrying chat messages, delivery and
//! read receipts, and streamed file transfers. [`Node`] assembles the
//! components once at startup and exposes the host-facing operations; every
//! observable state change fans out through the typed [`events::Event`]
//! channel.

pub mod crypto;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod messaging;
pub mod network;

pub use discovery::{PeerRecord, PeerRegistry};
pub use error::{Error, Result};
pub use events::{DeliveryStatus, Event, EventBus};
pub use identity::{DeviceIdentity, IdentityStore};
pub use messaging::{MessagingService, OutgoingMessage};
pub use network::{
    ControlMessage, FileTransfer, FileTransferService, MessageBody, TransferStatus,
};

use discovery::MdnsDiscoveryService;
use network::connection::{ConnectionManager, InboundFrame};
use network::file_transfer::TransferSettings;
use network::server;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default TCP port for the control listener.
pub const DEFAULT_PORT: u16 = 47100;

/// Startup configuration for a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listener port; 0 binds an ephemeral port.
    pub port: u16,
    /// Identity/config directory; defaults to the per-user config dir.
    pub config_dir: Option<PathBuf>,
    /// Where accepted files land; defaults to the user's downloads dir.
    pub downloads_dir: Option<PathBuf>,
    /// Accept incoming transfers without asking.
    pub auto_accept: bool,
    /// Advertise and browse over mDNS. Off for tests and headless relays.
    pub enable_mdns: bool,
    /// Capacity of the outward event channel.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            config_dir: None,
            downloads_dir: None,
            auto_accept: false,
            enable_mdns: true,
            event_capacity: 256,
        }
    }
}

/// A running hyperconnect node.
pub struct Node {
    identity: Arc<IdentityStore>,
    peers: PeerRegistry,
    connections: Arc<ConnectionManager>,
    messaging: Arc<MessagingService>,
    transfers: Arc<FileTransferService>,
    discovery: Option<Arc<MdnsDiscoveryService>>,
    port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Assemble and start every component. Returns the node handle and the
    /// receiving half of the event channel.
    pub async fn start(config: NodeConfig) -> Result<(Self, mpsc::Receiver<Event>)> {
        let (events, event_rx) = EventBus::new(config.event_capacity);

        let config_dir = config
            .config_dir
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("hyperconnect")))
            .unwrap_or_else(|| PathBuf::from(".hyperconnect"));
        let identity = Arc::new(IdentityStore::new(
            config_dir,
            env!("CARGO_PKG_VERSION").to_string(),
        ));
        let device_id = identity.device_id();
        info!(device_id = %device_id, name = %identity.display_name(), "identity loaded");

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| Error::Io(format!("failed to bind port {}: {}", config.port, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Io(e.to_string()))?
            .port();
        info!(port, "control listener bound");

        let peers = PeerRegistry::new(&device_id);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(256);
        let connections = ConnectionManager::new(
            Arc::clone(&identity),
            peers.clone(),
            events.clone(),
            inbound_tx,
        );
        let messaging = MessagingService::new(
            device_id.clone(),
            Arc::clone(&connections),
            peers.clone(),
            events.clone(),
        );

        let mut settings = TransferSettings::default();
        if let Some(dir) = config.downloads_dir.clone() {
            settings.downloads_dir = dir;
        }
        settings.auto_accept = config.auto_accept;
        let transfers = FileTransferService::new(
            device_id,
            Arc::clone(&connections),
            peers.clone(),
            events.clone(),
            settings,
        );

        let discovery = if config.enable_mdns {
            let discovery = MdnsDiscoveryService::new(
                Arc::clone(&identity),
                peers.clone(),
                events.clone(),
                port,
            )?;
            discovery.advertise()?;
            discovery.browse()?;
            Some(discovery)
        } else {
            None
        };

        let tasks = vec![
            tokio::spawn(server::serve(
                listener,
                Arc::clone(&connections),
                Arc::clone(&transfers),
                events.clone(),
            )),
            connections.spawn_heartbeat(),
            tokio::spawn(route_inbound(
                inbound_rx,
                Arc::clone(&messaging),
                Arc::clone(&transfers),
            )),
        ];

        Ok((
            Self {
                identity,
                peers,
                connections,
                messaging,
                transfers,
                discovery,
                port,
                tasks,
            },
            event_rx,
        ))
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.identity()
    }

    pub fn device_id(&self) -> String {
        self.identity.device_id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Rename the device and re-publish the mDNS record.
    pub fn update_display_name(&self, name: &str) -> Result<DeviceIdentity> {
        let identity = self.identity.update_display_name(name)?;
        if let Some(discovery) = &self.discovery {
            if let Err(e) = discovery.refresh_advertisement() {
                warn!(error = %e, "failed to re-advertise after rename");
            }
        }
        Ok(identity)
    }

    pub fn update_profile_image(&self, image: &[u8]) -> DeviceIdentity {
        self.identity.update_profile_image(image)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub async fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.list().await
    }

    /// Restart the browser and run an immediate heartbeat pulse.
    pub async fn rescan(&self) -> Result<()> {
        if let Some(discovery) = &self.discovery {
            discovery.rescan()?;
        }
        self.connections.heartbeat_pulse().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub async fn send_message(&self, peer: &str, body: MessageBody) -> Result<OutgoingMessage> {
        self.messaging.send_message(peer, body).await
    }

    pub async fn mark_read(&self, peer: &str, msg_id: &str) -> Result<()> {
        self.messaging.mark_read(peer, msg_id).await
    }

    pub async fn delete_remote(&self, peer: &str, msg_id: &str) -> Result<()> {
        self.messaging.delete_remote(peer, msg_id).await
    }

    // ------------------------------------------------------------------
    // File transfer
    // ------------------------------------------------------------------

    pub async fn initiate_transfer(&self, peer: &str, path: &Path) -> Result<String> {
        self.transfers.initiate(peer, path).await
    }

    pub async fn accept_transfer(&self, file_id: &str) -> Result<()> {
        self.transfers.accept(file_id).await
    }

    pub async fn reject_transfer(&self, file_id: &str) -> Result<()> {
        self.transfers.reject(file_id).await
    }

    pub async fn cancel_transfer(&self, file_id: &str) -> Result<()> {
        self.transfers.cancel(file_id).await
    }

    pub async fn list_transfers(&self) -> Vec<FileTransfer> {
        self.transfers.list().await
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    pub async fn downloads_dir(&self) -> PathBuf {
        self.transfers.downloads_dir().await
    }

    pub async fn set_downloads_dir(&self, dir: PathBuf) {
        self.transfers.set_downloads_dir(dir).await;
    }

    pub async fn auto_accept(&self) -> bool {
        self.transfers.auto_accept().await
    }

    pub async fn set_auto_accept(&self, enabled: bool) {
        self.transfers.set_auto_accept(enabled).await;
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop discovery, close every socket, join the background tasks and
    /// flush the identity file.
    pub async fn shutdown(self) {
        info!("shutting down");
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        self.transfers.abort_all();
        self.connections.close_all().await;
        for task in &self.tasks {
            task.abort();
        }
        futures::future::join_all(self.tasks).await;
        self.identity.flush();
    }
}

/// Dispatch decoded control frames to the owning engine.
async fn route_inbound(
    mut rx: mpsc::Receiver<InboundFrame>,
    messaging: Arc<MessagingService>,
    transfers: Arc<FileTransferService>,
) {
    while let Some(InboundFrame { peer, msg }) = rx.recv().await {
        match msg {
            ControlMessage::Message { id, ts, body, .. } => {
                messaging.handle_message(&peer, &id, ts, body).await;
            }
            ControlMessage::MessageDelivered { ack_id, .. } => {
                messaging.handle_delivered(&peer, &ack_id).await;
            }
            ControlMessage::MessageRead { ack_id, .. } => {
                messaging.handle_read(&peer, &ack_id).await;
            }
            ControlMessage::MessageDelete { ack_id, scope, .. } => {
                messaging.handle_delete(&peer, &ack_id, scope).await;
            }
            ControlMessage::FileMeta {
                file_id,
                name,
                size,
                sha256,
                ..
            } => {
                transfers
                    .handle_meta(&peer, &file_id, &name, size, sha256)
                    .await;
            }
            ControlMessage::FileAccept { file_id, .. } => {
                transfers.handle_accept(&peer, &file_id).await;
            }
            ControlMessage::FileReject { file_id, .. } => {
                transfers.handle_reject(&peer, &file_id).await;
            }
            ControlMessage::FileCancel { file_id, .. } => {
                transfers.handle_cancel(&peer, &file_id).await;
            }
            other => {
                debug!(frame = other.type_name(), "unroutable frame dropped");
            }
        }
    }
}
