//! Message acquisition — the `MessageSource` seam and the IMAP fetcher.

pub mod imap;
pub mod message;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::FetchError;
use crate::model::Mailbox;

/// A normalized message as pulled off the wire, before classification.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// IMAP UID within the selected mailbox.
    pub uid: u32,
    /// RFC 5322 Message-ID, synthesized as `<uid>@<host>` when absent.
    pub message_id: String,
    pub subject: String,
    /// Lowercased sender address.
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Plain text preferred; falls back to the HTML part.
    pub body: String,
    /// True when `body` came from an HTML part.
    pub body_is_html: bool,
    /// Lowercase header name → raw value.
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    /// Ordered message-id chain from the References header.
    pub references: Vec<String>,
    pub has_attachments: bool,
    pub size_bytes: usize,
}

impl RawMessage {
    /// Case-insensitive header lookup. `name` must be lowercase.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether a header is present. `name` must be lowercase.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }
}

/// One fetch cycle's worth of messages, in UID-ascending order.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub messages: Vec<RawMessage>,
    /// True when the batch bound cut the result off; more messages remain.
    pub truncated: bool,
}

/// Fetcher tuning, drawn from [`crate::config::SyncConfig`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub since_days: u32,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub socket_timeout: Duration,
}

/// Source of new messages for a mailbox. Implemented by the IMAP fetcher;
/// tests substitute scripted batches.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch messages with UID greater than `last_uid`, bounded by the
    /// batch size and recency window. Performs no database I/O.
    async fn fetch(
        &self,
        mailbox: &Mailbox,
        password: &SecretString,
        last_uid: u32,
    ) -> Result<FetchBatch, FetchError>;
}
