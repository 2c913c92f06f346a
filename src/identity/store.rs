//! Identity store.
//!
//! The device id is a UUID v4 minted on first launch and persisted to
//! `device-config.json` in the per-user config directory; it never changes
//! for the lifetime of the install. The display name and profile image are
//! user-editable. Writes are atomic (temp file + rename) and best-effort: a
//! failed write is logged and the in-memory state stays authoritative until
//! the next successful write reconciles.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    device_id: String,
    display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile_image: Option<String>,
}

/// Full in-memory identity; platform and app version are runtime values,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub display_name: String,
    pub platform: String,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

#[derive(Debug, Validate)]
struct DisplayNameRules {
    #[validate(length(min = 1, max = 64))]
    name: String,
}

pub struct IdentityStore {
    config_path: PathBuf,
    state: RwLock<DeviceIdentity>,
}

impl IdentityStore {
    /// Load the identity from `config_dir`, minting and persisting a fresh
    /// one when absent. Storage failures are logged, never fatal.
    pub fn new(config_dir: PathBuf, app_version: String) -> Self {
        if let Err(e) = fs::create_dir_all(&config_dir) {
            warn!(dir = %config_dir.display(), error = %e, "failed to create config directory");
        }
        let config_path = config_dir.join("device-config.json");

        let file = match fs::read_to_string(&config_path) {
            Ok(contents) => match serde_json::from_str::<IdentityFile>(&contents) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "corrupt identity file, minting a new identity");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "failed to read identity file");
                None
            }
        };

        let file = match file {
            Some(file) => file,
            None => {
                let file = IdentityFile {
                    device_id: Uuid::new_v4().to_string(),
                    display_name: default_display_name(),
                    profile_image: None,
                };
                if let Err(e) = write_atomic(&config_path, &file) {
                    warn!(error = %e, "failed to persist new identity, continuing in memory");
                }
                info!(device_id = %file.device_id, "minted new device identity");
                file
            }
        };

        let identity = DeviceIdentity {
            device_id: file.device_id,
            display_name: file.display_name,
            platform: detect_platform(),
            app_version,
            profile_image: file.profile_image,
        };

        Self {
            config_path,
            state: RwLock::new(identity),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.state.read().unwrap().clone()
    }

    pub fn device_id(&self) -> String {
        self.state.read().unwrap().device_id.clone()
    }

    pub fn display_name(&self) -> String {
        self.state.read().unwrap().display_name.clone()
    }

    /// Rename the device. The name is trimmed and must be 1..=64 characters.
    pub fn update_display_name(&self, name: &str) -> Result<DeviceIdentity> {
        let name = name.trim().to_string();
        DisplayNameRules { name: name.clone() }
            .validate()
            .map_err(|_| Error::Identity("display name must be 1-64 characters".to_string()))?;

        let identity = {
            let mut state = self.state.write().unwrap();
            state.display_name = name;
            state.clone()
        };
        self.persist(&identity);
        Ok(identity)
    }

    pub fn update_profile_image(&self, image: &[u8]) -> DeviceIdentity {
        let encoded = BASE64.encode(image);
        let identity = {
            let mut state = self.state.write().unwrap();
            state.profile_image = Some(encoded);
            state.clone()
        };
        self.persist(&identity);
        identity
    }

    /// Write the current state to disk; used at shutdown.
    pub fn flush(&self) {
        let identity = self.identity();
        self.persist(&identity);
    }

    fn persist(&self, identity: &DeviceIdentity) {
        let file = IdentityFile {
            device_id: identity.device_id.clone(),
            display_name: identity.display_name.clone(),
            profile_image: identity.profile_image.clone(),
        };
        if let Err(e) = write_atomic(&self.config_path, &file) {
            warn!(path = %self.config_path.display(), error = %e, "failed to persist identity, in-memory state stays authoritative");
        }
    }
}

fn write_atomic(path: &PathBuf, file: &IdentityFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| Error::Identity(format!("failed to serialize identity: {}", e)))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| Error::Identity(format!("failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Identity(format!("failed to rename into place: {}", e)))?;
    Ok(())
}

fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "hyperconnect".to_string())
}

fn detect_platform() -> String {
    if cfg!(target_os = "windows") {
        "Windows".to_string()
    } else if cfg!(target_os = "macos") {
        "macOS".to_string()
    } else if cfg!(target_os = "linux") {
        "Linux".to_string()
    } else if cfg!(target_os = "ios") {
        "iOS".to_string()
    } else if cfg!(target_os = "android") {
        "Android".to_string()
    } else {
        "Unknown".to_string()
    }
}
