//! Peer registry.
//!
//! One record per known peer, keyed by device id. Discovery up-events create
//! or refresh records; down-events and heartbeat failures flip them offline
//! but never remove them (last_seen stays frozen for the shell). Any inbound
//! frame promotes its sender back online. The local device never appears in
//! the registry.

use crate::network::protocol::now_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A peer as currently known. Routing is by `device_id` only; the display
/// name is cosmetic and may collide between peers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub device_id: String,
    pub display_name: String,
    pub hostname: String,
    /// Reachable addresses, IPv4 first.
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub platform: String,
    pub app_version: String,
    /// Unix milliseconds of the last discovery event or inbound frame.
    pub last_seen: i64,
    pub online: bool,
    /// base64 image blob learned from the peer's HELLO_SECURE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

#[derive(Clone)]
pub struct PeerRegistry {
    self_id: Arc<str>,
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: Arc::from(self_id),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Insert or refresh a record from a discovery up-event. Returns true
    /// when this should surface as a `device_found` event (new peer, or a
    /// known peer coming back online). Records for the local device are
    /// ignored.
    pub async fn upsert_discovered(&self, mut record: PeerRecord) -> bool {
        if record.device_id == *self.self_id {
            return false;
        }
        record.online = true;

        let mut peers = self.peers.write().await;
        match peers.get_mut(&record.device_id) {
            Some(existing) => {
                let was_offline = !existing.online;
                record.profile_image = record
                    .profile_image
                    .take()
                    .or_else(|| existing.profile_image.take());
                *existing = record;
                was_offline
            }
            None => {
                peers.insert(record.device_id.clone(), record);
                true
            }
        }
    }

    /// Record identity metadata learned during a handshake. Creates a
    /// minimal record when the peer connected without being discovered
    /// first (it will not be dialable until discovery resolves it).
    pub async fn learn_identity(
        &self,
        device_id: &str,
        display_name: &str,
        platform: &str,
        app_version: &str,
        profile_image: Option<String>,
    ) {
        if device_id == &*self.self_id {
            return;
        }
        let mut peers = self.peers.write().await;
        let record = peers.entry(device_id.to_string()).or_insert_with(|| PeerRecord {
            device_id: device_id.to_string(),
            display_name: String::new(),
            hostname: String::new(),
            addresses: Vec::new(),
            port: 0,
            platform: String::new(),
            app_version: String::new(),
            last_seen: now_ms(),
            online: true,
            profile_image: None,
        });
        record.display_name = display_name.to_string();
        record.platform = platform.to_string();
        record.app_version = app_version.to_string();
        if profile_image.is_some() {
            record.profile_image = profile_image;
        }
    }

    /// Mark a peer online and refresh last_seen (promote-on-traffic).
    /// Returns true when the peer had been offline, i.e. `device_found`
    /// should be re-emitted.
    pub async fn touch_online(&self, device_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(device_id) {
            Some(record) => {
                let was_offline = !record.online;
                record.online = true;
                record.last_seen = now_ms();
                was_offline
            }
            None => false,
        }
    }

    /// Flip a peer offline, freezing last_seen. Returns true when the peer
    /// had been online, i.e. `device_lost` should be emitted.
    pub async fn mark_offline(&self, device_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(device_id) {
            Some(record) if record.online => {
                record.online = false;
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(device_id).cloned()
    }

    pub async fn is_online(&self, device_id: &str) -> bool {
        self.peers
            .read()
            .await
            .get(device_id)
            .map(|p| p.online)
            .unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn online_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.online)
            .map(|p| p.device_id.clone())
            .collect()
    }

    /// Address to dial for a peer, preferring IPv4.
    pub async fn dial_addr(&self, device_id: &str) -> Option<SocketAddr> {
        let peers = self.peers.read().await;
        let record = peers.get(device_id)?;
        if record.port == 0 {
            return None;
        }
        let addr = record
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| record.addresses.first())?;
        Some(SocketAddr::new(*addr, record.port))
    }
}
