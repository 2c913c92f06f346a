//! Chat messaging: send/receive, the delivered/read ack pipeline, and
//! time-limited remote deletion.

mod service;

pub use service::{MessagingService, OutgoingMessage, DELETE_WINDOW_MS};
