//! mDNS discovery.
//!
//! Advertises the local node as a `_hyperconnect._tcp` service with identity
//! TXT records and browses for peers continuously. Up-events feed the peer
//! registry and emit `device_found`; down-events flip peers offline and emit
//! `device_lost` while retaining the record. A registration name collision
//! is retried with a random 3-digit suffix. The instance name is cosmetic;
//! routing is by the `deviceId` TXT key alone.

use crate::discovery::peers::{PeerRecord, PeerRegistry};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::identity::IdentityStore;
use crate::network::protocol::now_ms;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// mDNS service type for hyperconnect nodes.
pub const SERVICE_TYPE: &str = "_hyperconnect._tcp.local.";

const REGISTER_ATTEMPTS: usize = 4;

pub struct MdnsDiscoveryService {
    daemon: ServiceDaemon,
    identity: Arc<IdentityStore>,
    peers: PeerRegistry,
    events: EventBus,
    port: u16,
    /// Fullname of our registered instance, for unregister.
    registered: StdMutex<Option<String>>,
    browse_task: StdMutex<Option<JoinHandle<()>>>,
    /// fullname → device id, to resolve down-events.
    names: Arc<RwLock<HashMap<String, String>>>,
}

impl MdnsDiscoveryService {
    pub fn new(
        identity: Arc<IdentityStore>,
        peers: PeerRegistry,
        events: EventBus,
        port: u16,
    ) -> Result<Arc<Self>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("failed to create mDNS daemon: {}", e)))?;

        Ok(Arc::new(Self {
            daemon,
            identity,
            peers,
            events,
            port,
            registered: StdMutex::new(None),
            browse_task: StdMutex::new(None),
            names: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    /// Publish this node. Instance-name collisions are retried with a
    /// random 3-digit suffix.
    pub fn advertise(&self) -> Result<()> {
        let identity = self.identity.identity();

        let mut properties = HashMap::new();
        properties.insert("deviceId".to_string(), identity.device_id.clone());
        properties.insert("displayName".to_string(), identity.display_name.clone());
        properties.insert("platform".to_string(), identity.platform.clone());
        properties.insert("appVersion".to_string(), identity.app_version.clone());

        let addresses: Vec<IpAddr> = if_addrs::get_if_addrs()
            .unwrap_or_default()
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.addr.ip())
            .collect();
        if addresses.is_empty() {
            return Err(Error::Discovery("no network interfaces found".to_string()));
        }

        let hostname = format!("{}.local.", sanitize_host_label(&identity.display_name));

        let mut instance = identity.display_name.clone();
        let mut last_err = None;
        for attempt in 0..REGISTER_ATTEMPTS {
            let service_info = ServiceInfo::new(
                SERVICE_TYPE,
                &instance,
                &hostname,
                &addresses[..],
                self.port,
                Some(properties.clone()),
            )
            .map_err(|e| Error::Discovery(format!("invalid service info: {}", e)))?;

            let fullname = service_info.get_fullname().to_string();
            match self.daemon.register(service_info) {
                Ok(()) => {
                    *self.registered.lock().unwrap() = Some(fullname);
                    info!(instance = %instance, port = self.port, "advertising on mDNS");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "mDNS register failed, retrying with suffix");
                    instance = format!(
                        "{} {:03}",
                        identity.display_name,
                        OsRng.next_u32() % 1000
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Discovery(format!(
            "failed to register service: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Re-publish after an identity change (display name rename).
    pub fn refresh_advertisement(&self) -> Result<()> {
        let previous = self.registered.lock().unwrap().take();
        if let Some(fullname) = previous {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!(error = %e, "unregister before refresh failed");
            }
        }
        self.advertise()
    }

    /// Start (or restart) browsing for peers.
    pub fn browse(self: &Arc<Self>) -> Result<()> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("failed to browse: {}", e)))?;

        let peers = self.peers.clone();
        let events = self.events.clone();
        let names = Arc::clone(&self.names);
        let self_id = self.identity.device_id();

        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        handle_resolved(info, &peers, &events, &names, &self_id).await;
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        handle_removed(fullname, &peers, &events, &names).await;
                    }
                    _ => {}
                }
            }
        });

        let previous = self.browse_task.lock().unwrap().replace(task);
        if let Some(old) = previous {
            old.abort();
        }
        info!("mDNS browsing started");
        Ok(())
    }

    /// Restart the browser from scratch.
    pub fn rescan(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!(error = %e, "stop_browse failed");
        }
        self.browse()
    }

    /// Unpublish, stop browsing and shut the daemon down.
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!(error = %e, "stop_browse failed");
        }
        if let Some(task) = self.browse_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(fullname) = self.registered.lock().unwrap().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!(error = %e, "unregister failed");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "daemon shutdown failed");
        }
    }
}

async fn handle_resolved(
    info: ServiceInfo,
    peers: &PeerRegistry,
    events: &EventBus,
    names: &Arc<RwLock<HashMap<String, String>>>,
    self_id: &str,
) {
    let device_id = info
        .get_property_val_str("deviceId")
        .unwrap_or_else(|| info.get_fullname())
        .to_string();

    if device_id == self_id {
        return;
    }

    // Keep IPv4 first for dialing; drop link-local IPv6.
    let mut addresses: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .filter(|addr| match addr {
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                !(0xfe80..=0xfebf).contains(&segments[0])
            }
            IpAddr::V4(_) => true,
        })
        .copied()
        .collect();
    addresses.sort_by_key(|a| !a.is_ipv4());

    if addresses.is_empty() {
        warn!(device_id = %device_id, "peer resolved without usable addresses");
        return;
    }

    let record = PeerRecord {
        device_id: device_id.clone(),
        display_name: info
            .get_property_val_str("displayName")
            .unwrap_or_else(|| info.get_fullname())
            .to_string(),
        hostname: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        platform: info
            .get_property_val_str("platform")
            .unwrap_or("unknown")
            .to_string(),
        app_version: info
            .get_property_val_str("appVersion")
            .unwrap_or("unknown")
            .to_string(),
        last_seen: now_ms(),
        online: true,
        profile_image: None,
    };

    names
        .write()
        .await
        .insert(info.get_fullname().to_string(), device_id.clone());

    if peers.upsert_discovered(record.clone()).await {
        info!(device_id = %device_id, name = %record.display_name, "peer discovered");
        events.emit(Event::DeviceFound { peer: record });
    }
}

async fn handle_removed(
    fullname: String,
    peers: &PeerRegistry,
    events: &EventBus,
    names: &Arc<RwLock<HashMap<String, String>>>,
) {
    let device_id = match names.read().await.get(&fullname).cloned() {
        Some(id) => id,
        None => return,
    };

    if peers.mark_offline(&device_id).await {
        info!(device_id = %device_id, "peer lost");
        events.emit(Event::DeviceLost { device_id });
    }
}

fn sanitize_host_label(name: &str) -> String {
    let label: String = name
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect();
    if label.is_empty() {
        "hyperconnect".to_string()
    } else {
        label
    }
}
