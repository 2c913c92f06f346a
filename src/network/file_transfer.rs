//! File transfer engine.
//!
//! Control frames (FILE_META / FILE_ACCEPT / FILE_REJECT / FILE_CANCEL)
//! travel encrypted on the control session; the bytes themselves get a
//! dedicated TCP connection per transfer, opened by the sender once the
//! receiver accepts. The stream opens with `FILE_STREAM:<fileId>\n`, a
//! 16-byte CTR IV, then ciphertext until half-close. Integrity is an
//! end-of-transfer SHA-256 comparison against the checksum announced in
//! FILE_META.
//!
//! Progress accounting per chunk: bytes transferred are monotonic, speed is
//! bytes over elapsed time since the stream started, ETA is remaining bytes
//! over speed.

use crate::crypto::{SessionCrypto, StreamDecryptor, StreamEncryptor};
use crate::discovery::peers::PeerRegistry;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::network::codec;
use crate::network::connection::{ConnectionManager, DIAL_TIMEOUT};
use crate::network::optimize_socket;
use crate::network::protocol::{now_ms, ControlMessage, ID_ACK};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunk size for file streaming.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// A stream with no byte movement for this long fails the transfer.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl TransferStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pending | TransferStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// One transfer record, kept in memory for history display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub id: String,
    pub direction: TransferDirection,
    pub peer_device_id: String,
    pub filename: String,
    /// Source path (outbound) or target path (inbound, set on accept).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub size: u64,
    pub transferred: u64,
    pub speed_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileTransfer {
    pub fn progress_percent(&self) -> f64 {
        if self.size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred as f64 / self.size as f64) * 100.0
    }

    /// Refresh speed and ETA from elapsed wall time.
    pub fn update_metrics(&mut self, elapsed_ms: u64) {
        if elapsed_ms > 0 {
            self.speed_bps = (self.transferred as f64 / elapsed_ms as f64) * 1000.0;
            if self.speed_bps > 0.0 {
                let remaining = self.size.saturating_sub(self.transferred);
                self.eta_seconds = Some((remaining as f64 / self.speed_bps) as u64);
            }
        }
    }
}

/// Runtime configuration of the engine.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub downloads_dir: PathBuf,
    pub auto_accept: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let downloads_dir = dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(|| std::env::temp_dir().join("hyperconnect"));
        Self {
            downloads_dir,
            auto_accept: false,
        }
    }
}

/// Accepted-but-not-yet-streaming inbound transfer: everything the raw
/// stream handler needs once the header shows up.
struct PendingStream {
    peer: String,
    crypto: SessionCrypto,
    target: PathBuf,
    size: u64,
    sha256: Option<String>,
}

pub struct FileTransferService {
    self_id: String,
    transfers: Arc<RwLock<HashMap<String, FileTransfer>>>,
    pending_streams: Arc<RwLock<HashMap<String, PendingStream>>>,
    active_tasks: Arc<StdMutex<HashMap<String, JoinHandle<()>>>>,
    settings: Arc<RwLock<TransferSettings>>,
    connections: Arc<ConnectionManager>,
    peers: PeerRegistry,
    events: EventBus,
}

impl Clone for FileTransferService {
    fn clone(&self) -> Self {
        Self {
            self_id: self.self_id.clone(),
            transfers: Arc::clone(&self.transfers),
            pending_streams: Arc::clone(&self.pending_streams),
            active_tasks: Arc::clone(&self.active_tasks),
            settings: Arc::clone(&self.settings),
            connections: Arc::clone(&self.connections),
            peers: self.peers.clone(),
            events: self.events.clone(),
        }
    }
}

impl FileTransferService {
    pub fn new(
        self_id: String,
        connections: Arc<ConnectionManager>,
        peers: PeerRegistry,
        events: EventBus,
        settings: TransferSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            transfers: Arc::new(RwLock::new(HashMap::new())),
            pending_streams: Arc::new(RwLock::new(HashMap::new())),
            active_tasks: Arc::new(StdMutex::new(HashMap::new())),
            settings: Arc::new(RwLock::new(settings)),
            connections,
            peers,
            events,
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn downloads_dir(&self) -> PathBuf {
        self.settings.read().await.downloads_dir.clone()
    }

    pub async fn set_downloads_dir(&self, dir: PathBuf) {
        self.settings.write().await.downloads_dir = dir;
    }

    pub async fn auto_accept(&self) -> bool {
        self.settings.read().await.auto_accept
    }

    pub async fn set_auto_accept(&self, enabled: bool) {
        self.settings.write().await.auto_accept = enabled;
    }

    // ------------------------------------------------------------------
    // Host-facing operations
    // ------------------------------------------------------------------

    /// Start an outbound transfer: stat the file, announce FILE_META over
    /// the control session, await the peer's decision.
    pub async fn initiate(self: &Arc<Self>, peer: &str, path: &Path) -> Result<String> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::Transfer(format!("cannot stat {}: {}", path.display(), e)))?;
        if !meta.is_file() {
            return Err(Error::Transfer(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Transfer(format!("{} has no file name", path.display())))?;

        self.connections.ensure_session(peer).await?;

        let checksum = checksum_file(path.to_path_buf()).await?;
        let file_id = Uuid::new_v4().to_string();
        let record = FileTransfer {
            id: file_id.clone(),
            direction: TransferDirection::Outbound,
            peer_device_id: peer.to_string(),
            filename: filename.clone(),
            path: Some(path.to_path_buf()),
            size: meta.len(),
            transferred: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            status: TransferStatus::Pending,
            sha256: Some(checksum.clone()),
            error: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        self.transfers
            .write()
            .await
            .insert(file_id.clone(), record.clone());
        self.events.emit(Event::TransferCreated { transfer: record });

        let msg = ControlMessage::FileMeta {
            from: self.self_id.clone(),
            id: Uuid::new_v4().to_string(),
            ts: now_ms(),
            file_id: file_id.clone(),
            name: filename,
            size: meta.len(),
            sha256: Some(checksum),
        };
        // A control failure here leaves the record pending; the caller may
        // retry or cancel.
        self.connections.send(peer, msg).await?;

        info!(file_id = %file_id, "file transfer offered");
        Ok(file_id)
    }

    /// Accept a pending inbound transfer: pick a collision-free target in
    /// the downloads directory and tell the sender to start streaming.
    pub async fn accept(&self, file_id: &str) -> Result<()> {
        let (peer, filename, size, sha256) = {
            let transfers = self.transfers.read().await;
            let record = transfers
                .get(file_id)
                .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
            if record.direction != TransferDirection::Inbound
                || record.status != TransferStatus::Pending
            {
                return Err(Error::InvalidState(format!(
                    "transfer {} is not awaiting acceptance",
                    file_id
                )));
            }
            (
                record.peer_device_id.clone(),
                record.filename.clone(),
                record.size,
                record.sha256.clone(),
            )
        };

        // The stream socket reuses the control session's key.
        self.connections.ensure_session(&peer).await?;
        let crypto = self
            .connections
            .session_crypto(&peer)
            .await
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;

        let downloads = self.downloads_dir().await;
        tokio::fs::create_dir_all(&downloads).await.map_err(|e| {
            Error::Transfer(format!(
                "cannot create downloads dir {}: {}",
                downloads.display(),
                e
            ))
        })?;
        let target = resolve_target_path(&downloads, &filename);

        {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(file_id) {
                Some(record) => record.path = Some(target.clone()),
                // Raced with a concurrent cancel/reject.
                None => return Err(Error::TransferNotFound(file_id.to_string())),
            }
        }

        self.pending_streams.write().await.insert(
            file_id.to_string(),
            PendingStream {
                peer: peer.clone(),
                crypto,
                target,
                size,
                sha256,
            },
        );

        self.send_control(&peer, |from| ControlMessage::FileAccept {
            from,
            id: ID_ACK.to_string(),
            ts: now_ms(),
            file_id: file_id.to_string(),
        })
        .await?;
        info!(file_id = %file_id, "transfer accepted");
        Ok(())
    }

    /// Decline a pending inbound transfer and drop its record.
    pub async fn reject(&self, file_id: &str) -> Result<()> {
        let peer = {
            let transfers = self.transfers.read().await;
            let record = transfers
                .get(file_id)
                .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
            if record.direction != TransferDirection::Inbound
                || record.status != TransferStatus::Pending
            {
                return Err(Error::InvalidState(format!(
                    "transfer {} is not awaiting acceptance",
                    file_id
                )));
            }
            record.peer_device_id.clone()
        };

        if let Err(e) = self
            .send_control(&peer, |from| ControlMessage::FileReject {
                from,
                id: ID_ACK.to_string(),
                ts: now_ms(),
                file_id: file_id.to_string(),
            })
            .await
        {
            warn!(file_id = %file_id, error = %e, "could not notify sender of rejection");
        }

        self.pending_streams.write().await.remove(file_id);
        self.transfers.write().await.remove(file_id);
        info!(file_id = %file_id, "transfer rejected");
        Ok(())
    }

    /// Cancel a pending or active transfer from either side. Active
    /// transfers lose their dedicated stream socket immediately.
    pub async fn cancel(&self, file_id: &str) -> Result<()> {
        let peer = {
            let transfers = self.transfers.read().await;
            let record = transfers
                .get(file_id)
                .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
            if record.status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "transfer {} already finished",
                    file_id
                )));
            }
            record.peer_device_id.clone()
        };

        if let Err(e) = self
            .send_control(&peer, |from| ControlMessage::FileCancel {
                from,
                id: ID_ACK.to_string(),
                ts: now_ms(),
                file_id: file_id.to_string(),
            })
            .await
        {
            debug!(file_id = %file_id, error = %e, "could not notify peer of cancellation");
        }

        self.cancel_local(file_id).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<FileTransfer> {
        self.transfers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, file_id: &str) -> Option<FileTransfer> {
        self.transfers.read().await.get(file_id).cloned()
    }

    // ------------------------------------------------------------------
    // Control-frame handlers (router-driven)
    // ------------------------------------------------------------------

    /// Inbound FILE_META: register a pending transfer, auto-accept if so
    /// configured.
    pub async fn handle_meta(
        self: &Arc<Self>,
        peer: &str,
        file_id: &str,
        name: &str,
        size: u64,
        sha256: Option<String>,
    ) {
        if self.transfers.read().await.contains_key(file_id) {
            debug!(file_id = %file_id, "duplicate FILE_META ignored");
            return;
        }

        // Only the final path component is honored; a sender cannot steer
        // the target outside the downloads directory.
        let filename = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| file_id.to_string());

        let record = FileTransfer {
            id: file_id.to_string(),
            direction: TransferDirection::Inbound,
            peer_device_id: peer.to_string(),
            filename,
            path: None,
            size,
            transferred: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            status: TransferStatus::Pending,
            sha256,
            error: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        self.transfers
            .write()
            .await
            .insert(file_id.to_string(), record.clone());
        self.events.emit(Event::TransferCreated { transfer: record });
        info!(file_id = %file_id, peer = %peer, "incoming transfer offered");

        if self.auto_accept().await {
            if let Err(e) = self.accept(file_id).await {
                warn!(file_id = %file_id, error = %e, "auto-accept failed");
            }
        }
    }

    /// Inbound FILE_ACCEPT: open the dedicated stream and start sending.
    pub async fn handle_accept(self: &Arc<Self>, peer: &str, file_id: &str) {
        let (path, size) = {
            let mut transfers = self.transfers.write().await;
            let record = match transfers.get_mut(file_id) {
                Some(r) => r,
                None => {
                    debug!(file_id = %file_id, "FILE_ACCEPT for unknown transfer");
                    return;
                }
            };
            if record.direction != TransferDirection::Outbound
                || record.status != TransferStatus::Pending
                || record.peer_device_id != peer
            {
                debug!(file_id = %file_id, "FILE_ACCEPT in unexpected state");
                return;
            }
            let path = match record.path.clone() {
                Some(path) => path,
                None => {
                    debug!(file_id = %file_id, "outbound record has no source path");
                    return;
                }
            };
            record.status = TransferStatus::Active;
            record.updated_at = now_ms();
            (path, record.size)
        };

        let crypto = match self.connections.session_crypto(peer).await {
            Some(crypto) => crypto,
            None => {
                self.fail_transfer(file_id, "control session vanished before streaming")
                    .await;
                return;
            }
        };
        let addr = match self.peers.dial_addr(peer).await {
            Some(addr) => addr,
            None => {
                self.fail_transfer(file_id, "peer has no dialable address").await;
                return;
            }
        };

        let svc = self.clone();
        let file_id_owned = file_id.to_string();
        // Insert under the same lock the task removes itself under, so a
        // fast-finishing stream cannot race the bookkeeping.
        let mut tasks = self.active_tasks.lock().unwrap();
        let handle = tokio::spawn(async move {
            let result = svc
                .stream_out(&file_id_owned, crypto, addr, path, size)
                .await;
            svc.active_tasks.lock().unwrap().remove(&file_id_owned);
            if let Err(e) = result {
                svc.fail_transfer(&file_id_owned, &e.to_string()).await;
            }
        });
        tasks.insert(file_id.to_string(), handle);
    }

    /// Inbound FILE_REJECT: the receiver declined; terminal.
    pub async fn handle_reject(&self, peer: &str, file_id: &str) {
        let mut transfers = self.transfers.write().await;
        if let Some(record) = transfers.get_mut(file_id) {
            if record.peer_device_id == peer && !record.status.is_terminal() {
                record.status = TransferStatus::Rejected;
                record.updated_at = now_ms();
                self.events.emit(Event::TransferRejected {
                    file_id: file_id.to_string(),
                });
                info!(file_id = %file_id, "transfer rejected by peer");
            }
        }
    }

    /// Inbound FILE_CANCEL: either party may cancel; terminal.
    pub async fn handle_cancel(&self, peer: &str, file_id: &str) {
        let known = {
            let transfers = self.transfers.read().await;
            transfers
                .get(file_id)
                .map(|r| r.peer_device_id == peer && !r.status.is_terminal())
                .unwrap_or(false)
        };
        if known {
            self.cancel_local(file_id).await;
        }
    }

    /// A raw socket announced `FILE_STREAM:<fileId>`: attach it to the
    /// matching accepted transfer and start receiving.
    pub async fn accept_stream<R>(self: &Arc<Self>, file_id: &str, residual: Vec<u8>, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending = self.pending_streams.write().await.remove(file_id);
        let pending = match pending {
            Some(p) => p,
            None => {
                warn!(file_id = %file_id, "file stream for unknown or unaccepted transfer");
                return;
            }
        };

        {
            let mut transfers = self.transfers.write().await;
            if let Some(record) = transfers.get_mut(file_id) {
                record.status = TransferStatus::Active;
                record.updated_at = now_ms();
            }
        }

        let svc = self.clone();
        let file_id_owned = file_id.to_string();
        let mut tasks = self.active_tasks.lock().unwrap();
        let handle = tokio::spawn(async move {
            let result = svc.stream_in(&file_id_owned, pending, residual, stream).await;
            svc.active_tasks.lock().unwrap().remove(&file_id_owned);
            if let Err(e) = result {
                svc.fail_transfer(&file_id_owned, &e.to_string()).await;
            }
        });
        tasks.insert(file_id.to_string(), handle);
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    async fn stream_out(
        &self,
        file_id: &str,
        crypto: SessionCrypto,
        addr: std::net::SocketAddr,
        path: PathBuf,
        size: u64,
    ) -> Result<()> {
        let mut stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Transfer(format!("stream dial failed: {}", e))),
            Err(_) => return Err(Error::Transfer("stream dial timed out".to_string())),
        };
        optimize_socket(&stream);

        let (mut encryptor, iv) = StreamEncryptor::new(&crypto, CHUNK_SIZE);
        let mut header = codec::file_stream_header(file_id);
        header.extend_from_slice(&iv);
        stream
            .write_all(&header)
            .await
            .map_err(|e| Error::Transfer(format!("stream header write failed: {}", e)))?;

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Transfer(format!("cannot open {}: {}", path.display(), e)))?;

        let start = Instant::now();
        let mut transferred = 0u64;
        loop {
            let n = match timeout(
                STREAM_IDLE_TIMEOUT,
                encryptor.encrypt_chunk(&mut file, &mut stream),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(Error::Transfer("stream idle timeout".to_string())),
            };
            if n == 0 {
                break;
            }
            transferred += n as u64;
            self.record_progress(file_id, transferred, start, None).await;
        }

        stream
            .flush()
            .await
            .map_err(|e| Error::Transfer(format!("stream flush failed: {}", e)))?;
        stream
            .shutdown()
            .await
            .map_err(|e| Error::Transfer(format!("stream close failed: {}", e)))?;

        if transferred != size {
            return Err(Error::Transfer(format!(
                "file changed size during transfer: sent {} of {}",
                transferred, size
            )));
        }

        self.complete_transfer(file_id, transferred, start).await;
        Ok(())
    }

    async fn stream_in<R>(
        &self,
        file_id: &str,
        pending: PendingStream,
        residual: Vec<u8>,
        mut stream: R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        // The 16-byte IV precedes the ciphertext; part of it may already sit
        // in the residual buffer from header parsing.
        let mut pre = residual;
        while pre.len() < 16 {
            let mut chunk = [0u8; 4096];
            let n = match timeout(STREAM_IDLE_TIMEOUT, stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::Transfer(format!("stream read failed: {}", e))),
                Err(_) => return Err(Error::Transfer("stream idle timeout".to_string())),
            };
            if n == 0 {
                return Err(Error::Transfer("stream ended before IV".to_string()));
            }
            pre.extend_from_slice(&chunk[..n]);
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&pre[..16]);
        let mut carry = pre.split_off(16);

        let mut decryptor = StreamDecryptor::new(&pending.crypto, &iv);
        let mut file = tokio::fs::File::create(&pending.target).await.map_err(|e| {
            Error::Transfer(format!(
                "cannot create {}: {}",
                pending.target.display(),
                e
            ))
        })?;
        let mut hasher = Sha256::new();
        let start = Instant::now();
        let mut transferred = 0u64;

        // Ciphertext bytes that rode in with the header.
        if !carry.is_empty() {
            decryptor.apply(&mut carry);
            hasher.update(&carry);
            file.write_all(&carry)
                .await
                .map_err(|e| Error::Transfer(format!("file write failed: {}", e)))?;
            transferred += carry.len() as u64;
            self.record_progress(file_id, transferred, start, None).await;
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match timeout(STREAM_IDLE_TIMEOUT, stream.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::Transfer(format!("stream read failed: {}", e))),
                Err(_) => return Err(Error::Transfer("stream idle timeout".to_string())),
            };
            if n == 0 {
                break;
            }
            decryptor.apply(&mut buf[..n]);
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| Error::Transfer(format!("file write failed: {}", e)))?;
            transferred += n as u64;
            if transferred > pending.size {
                return Err(Error::Transfer(format!(
                    "stream exceeded declared size of {} bytes",
                    pending.size
                )));
            }
            self.record_progress(file_id, transferred, start, None).await;
        }

        file.flush()
            .await
            .map_err(|e| Error::Transfer(format!("file flush failed: {}", e)))?;

        if transferred != pending.size {
            return Err(Error::Transfer(format!(
                "short stream: got {} of {} bytes",
                transferred, pending.size
            )));
        }

        let digest = format!("{:x}", hasher.finalize());
        if let Some(expected) = &pending.sha256 {
            if &digest != expected {
                return Err(Error::Transfer("checksum mismatch".to_string()));
            }
        }

        {
            let mut transfers = self.transfers.write().await;
            if let Some(record) = transfers.get_mut(file_id) {
                record.sha256 = Some(digest);
            }
        }
        self.complete_transfer(file_id, transferred, start).await;
        info!(file_id = %file_id, peer = %pending.peer, "file received");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Record bookkeeping
    // ------------------------------------------------------------------

    async fn record_progress(
        &self,
        file_id: &str,
        transferred: u64,
        start: Instant,
        sha256: Option<String>,
    ) {
        let mut transfers = self.transfers.write().await;
        if let Some(record) = transfers.get_mut(file_id) {
            // Progress never moves backwards.
            record.transferred = record.transferred.max(transferred);
            record.updated_at = now_ms();
            record.update_metrics(start.elapsed().as_millis() as u64);
            self.events.emit(Event::TransferProgress {
                file_id: file_id.to_string(),
                transferred: record.transferred,
                size: record.size,
                percent: record.progress_percent(),
                speed_bps: record.speed_bps,
                eta_seconds: record.eta_seconds,
                sha256,
            });
        }
    }

    async fn complete_transfer(&self, file_id: &str, transferred: u64, start: Instant) {
        let record = {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(file_id) {
                Some(record) if !record.status.is_terminal() => {
                    record.status = TransferStatus::Completed;
                    record.transferred = transferred;
                    record.eta_seconds = Some(0);
                    record.updated_at = now_ms();
                    record.update_metrics(start.elapsed().as_millis() as u64);
                    Some(record.clone())
                }
                _ => None,
            }
        };
        if let Some(record) = record {
            self.events.emit(Event::TransferProgress {
                file_id: file_id.to_string(),
                transferred: record.transferred,
                size: record.size,
                percent: 100.0,
                speed_bps: record.speed_bps,
                eta_seconds: Some(0),
                sha256: record.sha256.clone(),
            });
            self.events.emit(Event::TransferCompleted { transfer: record });
            info!(file_id = %file_id, "transfer completed");
        }
    }

    async fn fail_transfer(&self, file_id: &str, error: &str) {
        let mut transfers = self.transfers.write().await;
        if let Some(record) = transfers.get_mut(file_id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = TransferStatus::Failed;
            record.error = Some(error.to_string());
            record.updated_at = now_ms();
            self.events.emit(Event::TransferFailed {
                file_id: file_id.to_string(),
                error: error.to_string(),
            });
            warn!(file_id = %file_id, error = %error, "transfer failed");
        }
    }

    async fn cancel_local(&self, file_id: &str) {
        if let Some(handle) = self.active_tasks.lock().unwrap().remove(file_id) {
            handle.abort();
        }
        self.pending_streams.write().await.remove(file_id);

        let mut transfers = self.transfers.write().await;
        if let Some(record) = transfers.get_mut(file_id) {
            if !record.status.is_terminal() {
                record.status = TransferStatus::Cancelled;
                record.updated_at = now_ms();
                self.events.emit(Event::TransferCancelled {
                    file_id: file_id.to_string(),
                });
                info!(file_id = %file_id, "transfer cancelled");
            }
        }
    }

    async fn send_control<F>(&self, peer: &str, build: F) -> Result<()>
    where
        F: FnOnce(String) -> ControlMessage,
    {
        self.connections
            .send(peer, build(self.self_id.clone()))
            .await
    }

    /// Abort every in-flight stream; used at shutdown.
    pub fn abort_all(&self) {
        let mut tasks = self.active_tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

/// Streaming SHA-256 of a file, off the async runtime.
pub(crate) async fn checksum_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .map_err(|e| Error::Transfer(format!("cannot open {}: {}", path.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| Error::Transfer(format!("read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Transfer(format!("checksum task failed: {}", e)))?
}

/// Pick a target path in `dir`, suffixing ` (n)` on the stem until the name
/// is free.
fn resolve_target_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1u32.. {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted");
}
