//! Persister — idempotent email writes, thread aggregates, and bounce
//! rollups.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::bounce::BounceData;
use crate::classify::Classification;
use crate::error::StoreError;
use crate::fetch::RawMessage;
use crate::model::{BounceAggregate, BounceEvent, Category, Email, Mailbox, ThreadAggregate};
use crate::store::Store;

/// What a persist call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    /// The message was already stored (same UID, or same Message-ID under
    /// a different UID after a folder move). No side effects.
    Duplicate,
}

/// Writes one classified message: email row, thread aggregate, and — for
/// bounces with a validated recipient — the per-recipient rollup plus an
/// event. Idempotent on `(mailbox_id, uid)`.
pub struct Persister {
    store: Arc<dyn Store>,
}

impl Persister {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn persist(
        &self,
        mailbox: &Mailbox,
        msg: &RawMessage,
        classification: Classification,
        thread_id: &str,
        bounce: Option<&BounceData>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        // 1. Dedup guard on (mailbox_id, uid).
        if self.store.find_email(&mailbox.id, msg.uid).await?.is_some() {
            return Ok(PersistOutcome::Duplicate);
        }

        // 2. Insert. A unique violation here means the same message arrived
        //    again concurrently or under a different UID — duplicate, not
        //    an error.
        let email = build_email(mailbox, msg, classification, thread_id);
        match self.store.insert_email(&email).await {
            Ok(()) => {}
            Err(StoreError::Constraint(reason)) => {
                debug!(uid = msg.uid, reason = %reason, "Duplicate message, skipping insert");
                return Ok(PersistOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        }

        // 3. Recompute the containing thread's aggregates.
        self.refresh_thread(thread_id).await?;

        // 4. Bounce branch — only with a validated recipient.
        if classification.category == Category::Bounce {
            if let Some(bounce) = bounce {
                if let Some(recipient) = &bounce.recipient {
                    self.record_bounce(mailbox, msg, bounce, recipient, now)
                        .await?;
                }
            }
        }

        Ok(PersistOutcome::Inserted)
    }

    /// Recompute `message_count`, `last_message_at`, `participants`, and
    /// `is_unread` from the thread's full email set.
    pub async fn refresh_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let emails = self.store.list_emails_in_thread(thread_id).await?;
        if emails.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut participants = Vec::new();
        for email in &emails {
            let addresses = std::iter::once(&email.from_address)
                .chain(email.to_addresses.iter())
                .chain(email.cc_addresses.iter());
            for addr in addresses {
                let addr = addr.to_lowercase();
                if !addr.is_empty() && seen.insert(addr.clone()) {
                    participants.push(addr);
                }
            }
        }

        let last_message_at = emails
            .iter()
            .map(|e| e.received_at)
            .max()
            .unwrap_or_else(Utc::now);

        self.store
            .update_thread(
                thread_id,
                ThreadAggregate {
                    message_count: emails.len() as i64,
                    last_message_at,
                    participants,
                    is_unread: emails.iter().any(|e| !e.is_read),
                },
            )
            .await
    }

    async fn record_bounce(
        &self,
        mailbox: &Mailbox,
        msg: &RawMessage,
        bounce: &BounceData,
        recipient: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let bounce_id = match self
            .store
            .find_bounce(&mailbox.user_id, &mailbox.id, recipient)
            .await?
        {
            Some(existing) => {
                self.store.increment_bounce_failure(&existing.id, now).await?;
                existing.id
            }
            None => {
                let aggregate = BounceAggregate {
                    id: Uuid::new_v4().to_string(),
                    user_id: mailbox.user_id.clone(),
                    mailbox_id: mailbox.id.clone(),
                    recipient: recipient.to_string(),
                    bounce_type: bounce.bounce_type,
                    error_code: bounce.error_code.clone(),
                    reason: bounce.diagnostic.clone(),
                    failure_count: 1,
                    first_failed_at: now,
                    last_failed_at: now,
                };
                self.store.insert_bounce(&aggregate).await?;
                aggregate.id
            }
        };

        self.store
            .insert_bounce_event(&BounceEvent {
                id: Uuid::new_v4().to_string(),
                bounce_id,
                user_id: mailbox.user_id.clone(),
                message_uid: msg.uid,
                error_code: bounce.error_code.clone(),
                diagnostic: bounce.diagnostic.clone(),
                occurred_at: now,
            })
            .await
    }
}

// ── Field normalization ─────────────────────────────────────────────

fn build_email(
    mailbox: &Mailbox,
    msg: &RawMessage,
    classification: Classification,
    thread_id: &str,
) -> Email {
    let from_address = msg.from_address.to_lowercase();
    // Display name from the header, else the local part of the address.
    let from_name = msg
        .from_name
        .clone()
        .or_else(|| from_address.split('@').next().map(str::to_string))
        .filter(|s| !s.is_empty());

    Email {
        id: Uuid::new_v4().to_string(),
        user_id: mailbox.user_id.clone(),
        mailbox_id: mailbox.id.clone(),
        uid: msg.uid,
        message_id: msg.message_id.clone(),
        thread_id: thread_id.to_string(),
        subject: msg.subject.clone(),
        from_address,
        from_name,
        to_addresses: normalize_addresses(&msg.to),
        cc_addresses: normalize_addresses(&msg.cc),
        bcc_addresses: normalize_addresses(&msg.bcc),
        category: classification.category,
        category_confidence: classification.confidence,
        in_reply_to: msg.in_reply_to.clone(),
        references: msg.references.clone(),
        body_preview: body_preview(&msg.body),
        has_attachments: msg.has_attachments,
        is_read: false,
        is_starred: false,
        is_archived: false,
        received_at: msg.received_at,
        size_bytes: msg.size_bytes as i64,
        headers: msg.headers.clone(),
    }
}

/// Lowercase and dedup a recipient list, preserving order.
fn normalize_addresses(addresses: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .iter()
        .map(|a| a.to_lowercase())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}

/// Body preview: HTML tags become spaces, whitespace collapses, result is
/// capped at 300 chars. The full body is never persisted.
pub fn body_preview(body: &str) -> String {
    let mut text = String::with_capacity(body.len().min(1024));
    let mut in_tag = false;
    for ch in body.chars() {
        match ch {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(300)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BounceType, MailboxStatus, Thread};
    use crate::store::SqliteStore;
    use std::collections::HashMap;

    fn make_mailbox() -> Mailbox {
        Mailbox {
            id: "mb-1".into(),
            user_id: "user-1".into(),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            imap_username: "alice".into(),
            encrypted_password: "ct".into(),
            status: MailboxStatus::Active,
            last_synced_uid: 0,
            last_synced_at: None,
            last_error: None,
        }
    }

    fn make_msg(uid: u32, message_id: &str) -> RawMessage {
        RawMessage {
            uid,
            message_id: message_id.into(),
            subject: "Project plan".into(),
            from_address: "Bob@Example.com".into(),
            from_name: None,
            to: vec!["Alice@Example.com".into(), "alice@example.com".into()],
            cc: vec![],
            bcc: vec![],
            body: "Let's discuss.".into(),
            body_is_html: false,
            headers: HashMap::new(),
            received_at: Utc::now(),
            in_reply_to: None,
            references: vec![],
            has_attachments: false,
            size_bytes: 128,
        }
    }

    fn human() -> Classification {
        Classification {
            category: Category::Human,
            confidence: 0.70,
        }
    }

    async fn seed_thread(store: &SqliteStore, id: &str) {
        let now = Utc::now();
        store
            .insert_thread(&Thread {
                id: id.into(),
                user_id: "user-1".into(),
                mailbox_id: "mb-1".into(),
                subject: "Project plan".into(),
                normalized_subject: "project plan".into(),
                participants: vec![],
                message_count: 1,
                first_message_at: now,
                last_message_at: now,
                is_unread: true,
                is_archived: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_normalizes_fields_and_updates_thread() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());

        let outcome = persister
            .persist(&make_mailbox(), &make_msg(5, "m5@x"), human(), "t-1", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Inserted);

        let email = store.find_email("mb-1", 5).await.unwrap().unwrap();
        assert_eq!(email.from_address, "bob@example.com");
        assert_eq!(email.from_name.as_deref(), Some("bob"));
        assert_eq!(email.to_addresses, vec!["alice@example.com"]);
        assert!(!email.is_read);

        let thread = store.get_thread("t-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
        assert!(thread.is_unread);
        assert!(thread
            .participants
            .contains(&"bob@example.com".to_string()));
    }

    #[tokio::test]
    async fn duplicate_uid_is_a_noop() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());
        let mailbox = make_mailbox();

        persister
            .persist(&mailbox, &make_msg(5, "m5@x"), human(), "t-1", None, Utc::now())
            .await
            .unwrap();
        let outcome = persister
            .persist(&mailbox, &make_msg(5, "m5@x"), human(), "t-1", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Duplicate);

        let thread = store.get_thread("t-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
    }

    #[tokio::test]
    async fn colliding_message_id_is_a_duplicate() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());
        let mailbox = make_mailbox();

        persister
            .persist(&mailbox, &make_msg(5, "m5@x"), human(), "t-1", None, Utc::now())
            .await
            .unwrap();
        // Same Message-ID, new UID — a folder move, not a new message.
        let outcome = persister
            .persist(&mailbox, &make_msg(6, "m5@x"), human(), "t-1", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, PersistOutcome::Duplicate);
        assert!(store.find_email("mb-1", 6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn thread_aggregate_counts_all_members() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());
        let mailbox = make_mailbox();

        let early = Utc::now() - chrono::Duration::hours(2);
        let mut first = make_msg(1, "m1@x");
        first.received_at = early;
        persister
            .persist(&mailbox, &first, human(), "t-1", None, Utc::now())
            .await
            .unwrap();

        let mut second = make_msg(2, "m2@x");
        second.from_address = "carol@example.com".into();
        persister
            .persist(&mailbox, &second, human(), "t-1", None, Utc::now())
            .await
            .unwrap();

        let thread = store.get_thread("t-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.last_message_at, second.received_at);
        assert!(thread.participants.contains(&"carol@example.com".to_string()));
    }

    #[tokio::test]
    async fn bounce_branch_creates_aggregate_and_event() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());
        let mailbox = make_mailbox();

        let bounce = BounceData {
            recipient: Some("ghost@example.com".into()),
            error_code: "550".into(),
            diagnostic: "User unknown".into(),
            bounce_type: BounceType::Hard,
        };
        let classification = Classification {
            category: Category::Bounce,
            confidence: 1.0,
        };

        persister
            .persist(&mailbox, &make_msg(10, "b1@x"), classification, "t-1", Some(&bounce), Utc::now())
            .await
            .unwrap();

        let aggregate = store
            .find_bounce("user-1", "mb-1", "ghost@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.failure_count, 1);
        assert_eq!(aggregate.bounce_type, BounceType::Hard);

        // Second bounce for the same recipient increments, appends.
        persister
            .persist(&mailbox, &make_msg(11, "b2@x"), classification, "t-1", Some(&bounce), Utc::now())
            .await
            .unwrap();

        let aggregate = store
            .find_bounce("user-1", "mb-1", "ghost@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.failure_count, 2);
        let events = store.list_bounce_events(&aggregate.id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn bounce_without_recipient_records_nothing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_thread(&store, "t-1").await;
        let persister = Persister::new(store.clone());

        let bounce = BounceData {
            recipient: None,
            error_code: "UNKNOWN".into(),
            diagnostic: "No diagnostic information available".into(),
            bounce_type: BounceType::Unknown,
        };
        persister
            .persist(
                &make_mailbox(),
                &make_msg(12, "b3@x"),
                Classification {
                    category: Category::Bounce,
                    confidence: 1.0,
                },
                "t-1",
                Some(&bounce),
                Utc::now(),
            )
            .await
            .unwrap();

        let found = store.find_bounce("user-1", "mb-1", "ghost@example.com").await.unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn body_preview_strips_html_and_truncates() {
        let html = "<html><body><p>Hello   world</p><img src=\"x.png\"></body></html>";
        assert_eq!(body_preview(html), "Hello world");

        let long = "word ".repeat(200);
        assert_eq!(body_preview(&long).chars().count(), 300);
    }

    #[test]
    fn body_preview_collapses_whitespace() {
        assert_eq!(body_preview("a\n\n  b\t\tc"), "a b c");
    }
}
