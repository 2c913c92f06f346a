//! Control-frame protocol.
//!
//! Every control socket carries newline-delimited JSON frames. Each frame is
//! one [`ControlMessage`]; the `type` tag selects the variant. Sensitive
//! variants never travel in the clear; they are wrapped in the
//! `ENCRYPTED_MESSAGE` envelope ([`ControlMessage::Encrypted`]) whose
//! plaintext is the JSON encoding of the inner message.
//!
//! Common fields on every frame: `from` (sender device id), `id` (a UUID for
//! user-origin frames, a literal tag like `"ping"` for protocol frames) and
//! `ts` (unix milliseconds).

use serde::{Deserialize, Serialize};

/// Literal `id` values for protocol (non-user-origin) frames.
pub const ID_HELLO: &str = "hello";
pub const ID_PING: &str = "ping";
pub const ID_PONG: &str = "pong";
pub const ID_ACK: &str = "ack";

/// Current unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Chat message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Emoji {
        emoji: String,
    },
    #[serde(rename_all = "camelCase")]
    Reply {
        text: String,
        reply_to: String,
    },
    #[serde(rename_all = "camelCase")]
    FileRef {
        file_id: String,
    },
}

/// Scope of a remote message deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    Local,
    Everyone,
}

/// A single control frame. Unknown `type` tags fail deserialization and are
/// dropped by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Key-exchange frame; the only frame legal in plaintext, exactly once
    /// per socket direction.
    #[serde(rename = "HELLO_SECURE", rename_all = "camelCase")]
    HelloSecure {
        from: String,
        id: String,
        ts: i64,
        /// base64(SPKI/DER) X25519 public key.
        public_key: String,
        display_name: String,
        platform: String,
        app_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile_image: Option<String>,
    },

    #[serde(rename = "PING")]
    Ping { from: String, id: String, ts: i64 },

    #[serde(rename = "PONG")]
    Pong { from: String, id: String, ts: i64 },

    #[serde(rename = "MESSAGE")]
    Message {
        from: String,
        id: String,
        ts: i64,
        body: MessageBody,
    },

    #[serde(rename = "MESSAGE_DELIVERED", rename_all = "camelCase")]
    MessageDelivered {
        from: String,
        id: String,
        ts: i64,
        ack_id: String,
    },

    #[serde(rename = "MESSAGE_READ", rename_all = "camelCase")]
    MessageRead {
        from: String,
        id: String,
        ts: i64,
        ack_id: String,
    },

    #[serde(rename = "MESSAGE_DELETE", rename_all = "camelCase")]
    MessageDelete {
        from: String,
        id: String,
        ts: i64,
        ack_id: String,
        scope: DeleteScope,
    },

    #[serde(rename = "FILE_META", rename_all = "camelCase")]
    FileMeta {
        from: String,
        id: String,
        ts: i64,
        file_id: String,
        name: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },

    #[serde(rename = "FILE_ACCEPT", rename_all = "camelCase")]
    FileAccept {
        from: String,
        id: String,
        ts: i64,
        file_id: String,
    },

    #[serde(rename = "FILE_REJECT", rename_all = "camelCase")]
    FileReject {
        from: String,
        id: String,
        ts: i64,
        file_id: String,
    },

    #[serde(rename = "FILE_CANCEL", rename_all = "camelCase")]
    FileCancel {
        from: String,
        id: String,
        ts: i64,
        file_id: String,
    },

    /// Envelope carrying an AES-256-GCM sealed inner frame. `iv` is 12
    /// bytes, `tag` 16 bytes, all base64.
    #[serde(rename = "ENCRYPTED_MESSAGE")]
    Encrypted {
        iv: String,
        tag: String,
        payload: String,
    },
}

impl ControlMessage {
    pub fn ping(from: &str) -> Self {
        ControlMessage::Ping {
            from: from.to_string(),
            id: ID_PING.to_string(),
            ts: now_ms(),
        }
    }

    pub fn pong(from: &str) -> Self {
        ControlMessage::Pong {
            from: from.to_string(),
            id: ID_PONG.to_string(),
            ts: now_ms(),
        }
    }

    /// Whether this frame type must only ever travel inside the encrypted
    /// envelope. A plaintext instance of a sensitive type is rejected by the
    /// receiver.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            ControlMessage::Message { .. }
                | ControlMessage::FileMeta { .. }
                | ControlMessage::FileAccept { .. }
                | ControlMessage::FileReject { .. }
                | ControlMessage::MessageDelete { .. }
        )
    }

    /// Wire tag, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::HelloSecure { .. } => "HELLO_SECURE",
            ControlMessage::Ping { .. } => "PING",
            ControlMessage::Pong { .. } => "PONG",
            ControlMessage::Message { .. } => "MESSAGE",
            ControlMessage::MessageDelivered { .. } => "MESSAGE_DELIVERED",
            ControlMessage::MessageRead { .. } => "MESSAGE_READ",
            ControlMessage::MessageDelete { .. } => "MESSAGE_DELETE",
            ControlMessage::FileMeta { .. } => "FILE_META",
            ControlMessage::FileAccept { .. } => "FILE_ACCEPT",
            ControlMessage::FileReject { .. } => "FILE_REJECT",
            ControlMessage::FileCancel { .. } => "FILE_CANCEL",
            ControlMessage::Encrypted { .. } => "ENCRYPTED_MESSAGE",
        }
    }
}
