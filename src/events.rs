//! Outward event bus.
//!
//! Every observable state change fans out through one typed channel to the
//! embedding shell. Delivery is best-effort and non-blocking: when the sink
//! is full the event is dropped and logged, never awaited.

use crate::discovery::peers::PeerRecord;
use crate::error::ErrorKind;
use crate::network::file_transfer::FileTransfer;
use crate::network::protocol::{DeleteScope, MessageBody};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Delivery state of a sent message, advanced by inbound acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    DeviceFound { peer: PeerRecord },
    #[serde(rename_all = "camelCase")]
    DeviceLost { device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceConnected { device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceDisconnected { device_id: String },

    #[serde(rename_all = "camelCase")]
    MessageReceived {
        from: String,
        id: String,
        ts: i64,
        body: MessageBody,
    },
    #[serde(rename_all = "camelCase")]
    MessageSent {
        to: String,
        id: String,
        ts: i64,
        body: MessageBody,
    },
    #[serde(rename_all = "camelCase")]
    MessageStatusUpdated { id: String, status: DeliveryStatus },
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        peer: String,
        id: String,
        scope: DeleteScope,
    },

    #[serde(rename_all = "camelCase")]
    TransferCreated { transfer: FileTransfer },
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        file_id: String,
        transferred: u64,
        size: u64,
        percent: f64,
        speed_bps: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TransferCompleted { transfer: FileTransfer },
    #[serde(rename_all = "camelCase")]
    TransferFailed { file_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    TransferCancelled { file_id: String },
    #[serde(rename_all = "camelCase")]
    TransferRejected { file_id: String },

    #[serde(rename_all = "camelCase")]
    SecurityError {
        kind: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
        detail: String,
    },
}

impl Event {
    /// Event name as the shell sees it, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::DeviceFound { .. } => "device_found",
            Event::DeviceLost { .. } => "device_lost",
            Event::DeviceConnected { .. } => "device_connected",
            Event::DeviceDisconnected { .. } => "device_disconnected",
            Event::MessageReceived { .. } => "message_received",
            Event::MessageSent { .. } => "message_sent",
            Event::MessageStatusUpdated { .. } => "message_status_updated",
            Event::MessageDeleted { .. } => "message_deleted",
            Event::TransferCreated { .. } => "transfer_created",
            Event::TransferProgress { .. } => "transfer_progress",
            Event::TransferCompleted { .. } => "transfer_completed",
            Event::TransferFailed { .. } => "transfer_failed",
            Event::TransferCancelled { .. } => "transfer_cancelled",
            Event::TransferRejected { .. } => "transfer_rejected",
            Event::SecurityError { .. } => "security_error",
        }
    }
}

/// Cloneable sending half of the event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Non-blocking emit; a full or closed sink drops the event.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(ev) => {
                    warn!(event = ev.name(), "event sink full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}
