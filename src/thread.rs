//! Thread resolution — reply-chain and subject-based conversation grouping.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::fetch::RawMessage;
use crate::model::{Mailbox, Thread};
use crate::store::Store;

/// Subject-based matching only applies within this window.
const SUBJECT_MATCH_WINDOW_DAYS: i64 = 7;

/// Normalized subjects at or below this length are too generic to match on.
const MIN_SUBJECT_MATCH_LEN: usize = 5;

/// Normalize a subject for fallback thread matching: lowercase, strip
/// repeated `re:`/`fwd:`/`fw:` prefixes and `[external]` tags, collapse
/// whitespace. Idempotent.
pub fn normalize_subject(subject: &str) -> String {
    let lowered = subject.to_lowercase().replace("[external]", " ");
    let mut s = lowered.trim();
    loop {
        if let Some(rest) = s.strip_prefix("re:") {
            s = rest.trim_start();
        } else if let Some(rest) = s.strip_prefix("fwd:") {
            s = rest.trim_start();
        } else if let Some(rest) = s.strip_prefix("fw:") {
            s = rest.trim_start();
        } else {
            break;
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Everyone on the message: sender plus To and Cc, lowercased, deduped
/// in order.
pub fn participants(msg: &RawMessage) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    std::iter::once(msg.from_address.to_lowercase())
        .chain(msg.to.iter().map(|a| a.to_lowercase()))
        .chain(msg.cc.iter().map(|a| a.to_lowercase()))
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}

/// Resolves each message to a thread via header chains, then subject
/// matching, creating a new thread when nothing matches.
pub struct ThreadResolver {
    store: Arc<dyn Store>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve `msg` to a thread id, creating the thread if needed.
    ///
    /// Resolving the same message twice returns the same thread id,
    /// provided the first resolution's email was persisted.
    pub async fn resolve(
        &self,
        mailbox: &Mailbox,
        msg: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        // 1. Direct parent via In-Reply-To.
        if let Some(parent_id) = &msg.in_reply_to {
            if let Some(parent) = self
                .store
                .find_email_by_message_id(&mailbox.id, parent_id)
                .await?
            {
                return Ok(parent.thread_id);
            }
        }

        // 2. Any ancestor via References, earliest reference first.
        if !msg.references.is_empty() {
            let found = self
                .store
                .find_emails_by_message_ids(&mailbox.id, &msg.references)
                .await?;
            for reference in &msg.references {
                if let Some(email) = found.iter().find(|e| &e.message_id == reference) {
                    return Ok(email.thread_id.clone());
                }
            }
        }

        // 3. Normalized-subject match within the recency window.
        let normalized = normalize_subject(&msg.subject);
        if normalized.len() > MIN_SUBJECT_MATCH_LEN {
            let since = now - Duration::days(SUBJECT_MATCH_WINDOW_DAYS);
            if let Some(thread) = self
                .store
                .find_thread_by_normalized_subject(&mailbox.id, &normalized, since)
                .await?
            {
                return Ok(thread.id);
            }
        }

        // 4. No match — start a new thread.
        let thread = new_thread(mailbox, msg, &normalized);
        self.store.insert_thread(&thread).await?;
        Ok(thread.id)
    }
}

fn new_thread(mailbox: &Mailbox, msg: &RawMessage, normalized: &str) -> Thread {
    let subject = if msg.subject.trim().is_empty() {
        "(No Subject)".to_string()
    } else {
        msg.subject.clone()
    };
    Thread {
        id: Uuid::new_v4().to_string(),
        user_id: mailbox.user_id.clone(),
        mailbox_id: mailbox.id.clone(),
        subject,
        normalized_subject: normalized.to_string(),
        participants: participants(msg),
        message_count: 1,
        first_message_at: msg.received_at,
        last_message_at: msg.received_at,
        is_unread: true,
        is_archived: false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
