//! Peer discovery.
//!
//! mDNS/DNS-SD advertisement and browsing of the `_hyperconnect._tcp`
//! service, plus the in-memory peer registry fed by discovery events and
//! inbound traffic.

mod mdns;
pub mod peers;

pub use mdns::MdnsDiscoveryService;
pub use peers::{PeerRecord, PeerRegistry};
