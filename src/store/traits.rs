//! Unified `Store` trait — single async interface for all persistence.
//!
//! The engine is designed to be correct under per-operation atomicity: it
//! relies on unique-constraint enforcement for the email keys and on
//! `increment_bounce_failure` being a single atomic update. No multi-row
//! transactions are required.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    BounceAggregate, BounceEvent, Email, Mailbox, MailboxStatus, Thread, ThreadAggregate,
};

/// Partial update for a mailbox record.
///
/// `last_error` uses a nested `Option` so a patch can distinguish
/// "leave unchanged" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct MailboxPatch {
    pub last_synced_uid: Option<u32>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: Option<MailboxStatus>,
    pub last_error: Option<Option<String>>,
}

/// Backend-agnostic persistence trait covering mailboxes, emails, threads,
/// and bounce records.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Mailboxes ───────────────────────────────────────────────────

    /// Get a mailbox by ID.
    async fn get_mailbox(&self, id: &str) -> Result<Option<Mailbox>, StoreError>;

    /// Insert a new mailbox (provisioning / tests).
    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), StoreError>;

    /// Apply a partial update to a mailbox.
    async fn update_mailbox(&self, id: &str, patch: MailboxPatch) -> Result<(), StoreError>;

    /// IDs of all mailboxes the scheduler should trigger (not disabled).
    async fn list_active_mailbox_ids(&self) -> Result<Vec<String>, StoreError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Look up an email by its IMAP UID within a mailbox.
    async fn find_email(&self, mailbox_id: &str, uid: u32) -> Result<Option<Email>, StoreError>;

    /// Look up an email by RFC 5322 Message-ID within a mailbox.
    async fn find_email_by_message_id(
        &self,
        mailbox_id: &str,
        message_id: &str,
    ) -> Result<Option<Email>, StoreError>;

    /// Look up emails whose Message-ID is in `ids`, within a mailbox.
    async fn find_emails_by_message_ids(
        &self,
        mailbox_id: &str,
        ids: &[String],
    ) -> Result<Vec<Email>, StoreError>;

    /// Insert a new email.
    ///
    /// Unique on `(mailbox_id, uid)` and `(mailbox_id, message_id)`; a
    /// violation of either surfaces as [`StoreError::Constraint`].
    async fn insert_email(&self, email: &Email) -> Result<(), StoreError>;

    /// All emails in a thread (used to recompute thread aggregates).
    async fn list_emails_in_thread(&self, thread_id: &str) -> Result<Vec<Email>, StoreError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Most recent thread with the given normalized subject whose
    /// `last_message_at` is at or after `since`.
    async fn find_thread_by_normalized_subject(
        &self,
        mailbox_id: &str,
        normalized: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Thread>, StoreError>;

    /// Insert a new thread.
    async fn insert_thread(&self, thread: &Thread) -> Result<(), StoreError>;

    /// Get a thread by ID.
    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError>;

    /// Write recomputed aggregates for a thread.
    async fn update_thread(&self, id: &str, aggregate: ThreadAggregate)
        -> Result<(), StoreError>;

    // ── Bounces ─────────────────────────────────────────────────────

    /// Look up the bounce aggregate for a recipient.
    async fn find_bounce(
        &self,
        user_id: &str,
        mailbox_id: &str,
        recipient: &str,
    ) -> Result<Option<BounceAggregate>, StoreError>;

    /// Insert a new bounce aggregate (`failure_count` starts at 1).
    async fn insert_bounce(&self, bounce: &BounceAggregate) -> Result<(), StoreError>;

    /// Atomically increment `failure_count` and set `last_failed_at`.
    async fn increment_bounce_failure(
        &self,
        bounce_id: &str,
        last_failed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append a bounce event.
    async fn insert_bounce_event(&self, event: &BounceEvent) -> Result<(), StoreError>;

    /// All events for a bounce aggregate, oldest first.
    async fn list_bounce_events(&self, bounce_id: &str) -> Result<Vec<BounceEvent>, StoreError>;
}
