//! Device identity.
//!
//! Stable UUID device id, user-editable display name, platform tag and app
//! version, persisted in the per-user config directory.

mod store;

pub use store::{DeviceIdentity, IdentityStore};
