//! Core data model: mailboxes, emails, threads, and bounce records.
//!
//! All entities are tenanted by `user_id` and scoped by `mailbox_id`; the
//! engine treats both as opaque identifiers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Mailbox ─────────────────────────────────────────────────────────

/// Sync health of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxStatus {
    /// Syncing normally.
    Active,
    /// Last cycle hit a fatal error; retried on subsequent cycles.
    Error,
    /// User-disabled; the scheduler skips it. Terminal.
    Disabled,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "error" => Self::Error,
            "disabled" => Self::Disabled,
            _ => Self::Active,
        }
    }
}

/// A user-owned IMAP mailbox. Created externally; the engine reads the
/// connection config and writes back checkpoint and status.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: String,
    pub user_id: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    /// Base64 envelope produced by the credential cipher. Never logged.
    pub encrypted_password: String,
    pub status: MailboxStatus,
    /// Highest IMAP UID whose processing has been durably acknowledged.
    pub last_synced_uid: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ── Email ───────────────────────────────────────────────────────────

/// Message classification categories, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Delivery failure report from a mail server.
    Bounce,
    /// Receipts, password resets, order confirmations.
    Transactional,
    /// Activity digests, reminders, alerts.
    Notification,
    /// List mail with list headers.
    Newsletter,
    /// Promotional bulk mail.
    Marketing,
    /// Person-to-person mail.
    Human,
    /// Nothing matched.
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bounce => "bounce",
            Self::Transactional => "transactional",
            Self::Notification => "notification",
            Self::Newsletter => "newsletter",
            Self::Marketing => "marketing",
            Self::Human => "human",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bounce" => Self::Bounce,
            "transactional" => Self::Transactional,
            "notification" => Self::Notification,
            "newsletter" => Self::Newsletter,
            "marketing" => Self::Marketing,
            "human" => Self::Human,
            _ => Self::Unknown,
        }
    }
}

/// A persisted email. Created exactly once per `(mailbox_id, uid)`; the
/// read flags are mutated only by the external API.
#[derive(Debug, Clone)]
pub struct Email {
    pub id: String,
    pub user_id: String,
    pub mailbox_id: String,
    pub uid: u32,
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    /// Lowercased sender address.
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub category: Category,
    pub category_confidence: f64,
    pub in_reply_to: Option<String>,
    /// Ordered message-id chain from the References header.
    pub references: Vec<String>,
    /// Plain-text preview, at most 300 chars.
    pub body_preview: String,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub received_at: DateTime<Utc>,
    pub size_bytes: i64,
    /// Lowercase header name → raw value.
    pub headers: HashMap<String, String>,
}

// ── Thread ──────────────────────────────────────────────────────────

/// A conversation: emails related by reply chains or normalized subject.
///
/// `first_message_at` is immutable; the other aggregates are recomputed
/// after every insert into the thread.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    pub mailbox_id: String,
    /// Original subject of the first message.
    pub subject: String,
    pub normalized_subject: String,
    /// Deduplicated, lowercased participant addresses.
    pub participants: Vec<String>,
    pub message_count: i64,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub is_unread: bool,
    pub is_archived: bool,
}

/// Recomputed thread aggregates written after each insert.
#[derive(Debug, Clone)]
pub struct ThreadAggregate {
    pub message_count: i64,
    pub last_message_at: DateTime<Utc>,
    pub participants: Vec<String>,
    pub is_unread: bool,
}

// ── Bounces ─────────────────────────────────────────────────────────

/// Permanent vs transient delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BounceType {
    Hard,
    Soft,
    Unknown,
}

impl BounceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "hard" => Self::Hard,
            "soft" => Self::Soft,
            _ => Self::Unknown,
        }
    }
}

/// Per-recipient bounce rollup, unique on `(user_id, mailbox_id, recipient)`.
#[derive(Debug, Clone)]
pub struct BounceAggregate {
    pub id: String,
    pub user_id: String,
    pub mailbox_id: String,
    /// The failed recipient address (lowercased, validated).
    pub recipient: String,
    pub bounce_type: BounceType,
    /// Numeric SMTP code as text, or "UNKNOWN".
    pub error_code: String,
    /// Cleaned diagnostic, at most 300 chars.
    pub reason: String,
    pub failure_count: i64,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// Append-only record of one processed bounce message.
#[derive(Debug, Clone)]
pub struct BounceEvent {
    pub id: String,
    pub bounce_id: String,
    pub user_id: String,
    pub message_uid: u32,
    pub error_code: String,
    pub diagnostic: String,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_defaults_to_active() {
        assert_eq!(MailboxStatus::parse("error"), MailboxStatus::Error);
        assert_eq!(MailboxStatus::parse("garbage"), MailboxStatus::Active);
    }

    #[test]
    fn category_str_is_stable() {
        assert_eq!(Category::parse(Category::Bounce.as_str()), Category::Bounce);
        assert_eq!(Category::parse("not-a-category"), Category::Unknown);
    }
}
