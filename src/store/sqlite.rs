//! SQLite store backend — connection wrapper, migrations, and queries.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::model::{
    BounceAggregate, BounceEvent, BounceType, Category, Email, Mailbox, MailboxStatus, Thread,
    ThreadAggregate,
};
use crate::store::traits::{MailboxPatch, Store};

/// SQLite-backed [`Store`] wrapping a connection behind a Mutex.
///
/// Using `Mutex` (not `RwLock`) because rusqlite `Connection` is `!Sync`.
/// All DB access is serialized — fine for the engine's write-light,
/// per-mailbox-serialized workload.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Query(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Run all schema migrations (idempotent).
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                imap_host TEXT NOT NULL,
                imap_port INTEGER NOT NULL,
                imap_username TEXT NOT NULL,
                encrypted_password TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_synced_uid INTEGER NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_mailboxes_status ON mailboxes(status);

            CREATE TABLE IF NOT EXISTS emails (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                mailbox_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_address TEXT NOT NULL,
                from_name TEXT,
                to_addresses TEXT NOT NULL,
                cc_addresses TEXT NOT NULL,
                bcc_addresses TEXT NOT NULL,
                category TEXT NOT NULL,
                category_confidence REAL NOT NULL,
                in_reply_to TEXT,
                references_ids TEXT NOT NULL,
                body_preview TEXT NOT NULL,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                received_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                headers TEXT NOT NULL,
                UNIQUE(mailbox_id, uid),
                UNIQUE(mailbox_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id);

            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                mailbox_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                normalized_subject TEXT NOT NULL,
                participants TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 1,
                first_message_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                is_unread INTEGER NOT NULL DEFAULT 1,
                is_archived INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_threads_subject
                ON threads(mailbox_id, normalized_subject, last_message_at);

            CREATE TABLE IF NOT EXISTS bounces (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                mailbox_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                bounce_type TEXT NOT NULL,
                error_code TEXT NOT NULL,
                reason TEXT NOT NULL,
                failure_count INTEGER NOT NULL DEFAULT 1,
                first_failed_at TEXT NOT NULL,
                last_failed_at TEXT NOT NULL,
                UNIQUE(user_id, mailbox_id, recipient)
            );

            CREATE TABLE IF NOT EXISTS bounce_events (
                id TEXT PRIMARY KEY,
                bounce_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                message_uid INTEGER NOT NULL,
                error_code TEXT NOT NULL,
                diagnostic TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bounce_events_bounce
                ON bounce_events(bounce_id);",
        )
        .map_err(map_sqlite_err)?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    // ── Mailboxes ───────────────────────────────────────────────────

    async fn get_mailbox(&self, id: &str) -> Result<Option<Mailbox>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, imap_host, imap_port, imap_username, encrypted_password,
                        status, last_synced_uid, last_synced_at, last_error
                 FROM mailboxes WHERE id = ?1",
            )
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(rusqlite::params![id], row_to_mailbox)
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO mailboxes (id, user_id, imap_host, imap_port, imap_username,
                encrypted_password, status, last_synced_uid, last_synced_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                mailbox.id,
                mailbox.user_id,
                mailbox.imap_host,
                mailbox.imap_port,
                mailbox.imap_username,
                mailbox.encrypted_password,
                mailbox.status.as_str(),
                mailbox.last_synced_uid,
                mailbox.last_synced_at.map(|t| t.to_rfc3339()),
                mailbox.last_error,
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn update_mailbox(&self, id: &str, patch: MailboxPatch) -> Result<(), StoreError> {
        let conn = self.conn();

        if let Some(uid) = patch.last_synced_uid {
            conn.execute(
                "UPDATE mailboxes SET last_synced_uid = ?1 WHERE id = ?2",
                rusqlite::params![uid, id],
            )
            .map_err(map_sqlite_err)?;
        }
        if let Some(at) = patch.last_synced_at {
            conn.execute(
                "UPDATE mailboxes SET last_synced_at = ?1 WHERE id = ?2",
                rusqlite::params![at.to_rfc3339(), id],
            )
            .map_err(map_sqlite_err)?;
        }
        if let Some(status) = patch.status {
            conn.execute(
                "UPDATE mailboxes SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), id],
            )
            .map_err(map_sqlite_err)?;
        }
        if let Some(last_error) = patch.last_error {
            conn.execute(
                "UPDATE mailboxes SET last_error = ?1 WHERE id = ?2",
                rusqlite::params![last_error, id],
            )
            .map_err(map_sqlite_err)?;
        }
        Ok(())
    }

    async fn list_active_mailbox_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id FROM mailboxes WHERE status != 'disabled' ORDER BY id")
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_err)
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn find_email(&self, mailbox_id: &str, uid: u32) -> Result<Option<Email>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EMAIL_COLUMNS} FROM emails WHERE mailbox_id = ?1 AND uid = ?2"
            ))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(rusqlite::params![mailbox_id, uid], row_to_email)
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn find_email_by_message_id(
        &self,
        mailbox_id: &str,
        message_id: &str,
    ) -> Result<Option<Email>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EMAIL_COLUMNS} FROM emails WHERE mailbox_id = ?1 AND message_id = ?2"
            ))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(rusqlite::params![mailbox_id, message_id], row_to_email)
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn find_emails_by_message_ids(
        &self,
        mailbox_id: &str,
        ids: &[String],
    ) -> Result<Vec<Email>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE mailbox_id = ? AND message_id IN ({placeholders})"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&mailbox_id];
        for id in ids {
            params.push(id);
        }
        let rows = stmt
            .query_map(params.as_slice(), row_to_email)
            .map_err(map_sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_err)
    }

    async fn insert_email(&self, email: &Email) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO emails (id, user_id, mailbox_id, uid, message_id, thread_id, subject,
                from_address, from_name, to_addresses, cc_addresses, bcc_addresses,
                category, category_confidence, in_reply_to, references_ids, body_preview,
                has_attachments, is_read, is_starred, is_archived, received_at, size_bytes, headers)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            rusqlite::params![
                email.id,
                email.user_id,
                email.mailbox_id,
                email.uid,
                email.message_id,
                email.thread_id,
                email.subject,
                email.from_address,
                email.from_name,
                to_json(&email.to_addresses)?,
                to_json(&email.cc_addresses)?,
                to_json(&email.bcc_addresses)?,
                email.category.as_str(),
                email.category_confidence,
                email.in_reply_to,
                to_json(&email.references)?,
                email.body_preview,
                email.has_attachments,
                email.is_read,
                email.is_starred,
                email.is_archived,
                email.received_at.to_rfc3339(),
                email.size_bytes,
                to_json(&email.headers)?,
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn list_emails_in_thread(&self, thread_id: &str) -> Result<Vec<Email>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EMAIL_COLUMNS} FROM emails WHERE thread_id = ?1 ORDER BY received_at ASC"
            ))
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map(rusqlite::params![thread_id], row_to_email)
            .map_err(map_sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_err)
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn find_thread_by_normalized_subject(
        &self,
        mailbox_id: &str,
        normalized: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Thread>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, mailbox_id, subject, normalized_subject, participants,
                        message_count, first_message_at, last_message_at, is_unread, is_archived
                 FROM threads
                 WHERE mailbox_id = ?1 AND normalized_subject = ?2 AND last_message_at >= ?3
                 ORDER BY last_message_at DESC LIMIT 1",
            )
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(
                rusqlite::params![mailbox_id, normalized, since.to_rfc3339()],
                row_to_thread,
            )
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn insert_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO threads (id, user_id, mailbox_id, subject, normalized_subject,
                participants, message_count, first_message_at, last_message_at,
                is_unread, is_archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                thread.id,
                thread.user_id,
                thread.mailbox_id,
                thread.subject,
                thread.normalized_subject,
                to_json(&thread.participants)?,
                thread.message_count,
                thread.first_message_at.to_rfc3339(),
                thread.last_message_at.to_rfc3339(),
                thread.is_unread,
                thread.is_archived,
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, mailbox_id, subject, normalized_subject, participants,
                        message_count, first_message_at, last_message_at, is_unread, is_archived
                 FROM threads WHERE id = ?1",
            )
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(rusqlite::params![id], row_to_thread)
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn update_thread(
        &self,
        id: &str,
        aggregate: ThreadAggregate,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE threads SET message_count = ?1, last_message_at = ?2,
                participants = ?3, is_unread = ?4
             WHERE id = ?5",
            rusqlite::params![
                aggregate.message_count,
                aggregate.last_message_at.to_rfc3339(),
                to_json(&aggregate.participants)?,
                aggregate.is_unread,
                id,
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    // ── Bounces ─────────────────────────────────────────────────────

    async fn find_bounce(
        &self,
        user_id: &str,
        mailbox_id: &str,
        recipient: &str,
    ) -> Result<Option<BounceAggregate>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, mailbox_id, recipient, bounce_type, error_code, reason,
                        failure_count, first_failed_at, last_failed_at
                 FROM bounces WHERE user_id = ?1 AND mailbox_id = ?2 AND recipient = ?3",
            )
            .map_err(map_sqlite_err)?;
        let mut rows = stmt
            .query_map(
                rusqlite::params![user_id, mailbox_id, recipient],
                row_to_bounce,
            )
            .map_err(map_sqlite_err)?;
        first_row(rows.next())
    }

    async fn insert_bounce(&self, bounce: &BounceAggregate) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO bounces (id, user_id, mailbox_id, recipient, bounce_type,
                error_code, reason, failure_count, first_failed_at, last_failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                bounce.id,
                bounce.user_id,
                bounce.mailbox_id,
                bounce.recipient,
                bounce.bounce_type.as_str(),
                bounce.error_code,
                bounce.reason,
                bounce.failure_count,
                bounce.first_failed_at.to_rfc3339(),
                bounce.last_failed_at.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn increment_bounce_failure(
        &self,
        bounce_id: &str,
        last_failed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE bounces SET failure_count = failure_count + 1, last_failed_at = ?1
                 WHERE id = ?2",
                rusqlite::params![last_failed_at.to_rfc3339(), bounce_id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "bounce".into(),
                id: bounce_id.into(),
            });
        }
        Ok(())
    }

    async fn insert_bounce_event(&self, event: &BounceEvent) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO bounce_events (id, bounce_id, user_id, message_uid, error_code,
                diagnostic, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.id,
                event.bounce_id,
                event.user_id,
                event.message_uid,
                event.error_code,
                event.diagnostic,
                event.occurred_at.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn list_bounce_events(&self, bounce_id: &str) -> Result<Vec<BounceEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, bounce_id, user_id, message_uid, error_code, diagnostic, occurred_at
                 FROM bounce_events WHERE bounce_id = ?1 ORDER BY occurred_at ASC",
            )
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map(rusqlite::params![bounce_id], row_to_bounce_event)
            .map_err(map_sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_err)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const EMAIL_COLUMNS: &str = "id, user_id, mailbox_id, uid, message_id, thread_id, subject,
    from_address, from_name, to_addresses, cc_addresses, bcc_addresses,
    category, category_confidence, in_reply_to, references_ids, body_preview,
    has_attachments, is_read, is_starred, is_archived, received_at, size_bytes, headers";

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Constraint(e.to_string());
        }
    }
    StoreError::Query(e.to_string())
}

fn first_row<T>(
    row: Option<std::result::Result<T, rusqlite::Error>>,
) -> Result<Option<T>, StoreError> {
    match row {
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => Err(map_sqlite_err(e)),
        None => Ok(None),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn row_to_mailbox(row: &rusqlite::Row<'_>) -> Result<Mailbox, rusqlite::Error> {
    let status: String = row.get(6)?;
    let last_synced_at: Option<String> = row.get(8)?;
    Ok(Mailbox {
        id: row.get(0)?,
        user_id: row.get(1)?,
        imap_host: row.get(2)?,
        imap_port: row.get(3)?,
        imap_username: row.get(4)?,
        encrypted_password: row.get(5)?,
        status: MailboxStatus::parse(&status),
        last_synced_uid: row.get::<_, i64>(7)?.max(0) as u32,
        last_synced_at: last_synced_at.as_deref().map(parse_datetime),
        last_error: row.get(9)?,
    })
}

fn row_to_email(row: &rusqlite::Row<'_>) -> Result<Email, rusqlite::Error> {
    let to_addresses: String = row.get(9)?;
    let cc_addresses: String = row.get(10)?;
    let bcc_addresses: String = row.get(11)?;
    let category: String = row.get(12)?;
    let references: String = row.get(15)?;
    let received_at: String = row.get(21)?;
    let headers: String = row.get(23)?;

    Ok(Email {
        id: row.get(0)?,
        user_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        uid: row.get::<_, i64>(3)?.max(0) as u32,
        message_id: row.get(4)?,
        thread_id: row.get(5)?,
        subject: row.get(6)?,
        from_address: row.get(7)?,
        from_name: row.get(8)?,
        to_addresses: from_json(&to_addresses),
        cc_addresses: from_json(&cc_addresses),
        bcc_addresses: from_json(&bcc_addresses),
        category: Category::parse(&category),
        category_confidence: row.get(13)?,
        in_reply_to: row.get(14)?,
        references: from_json(&references),
        body_preview: row.get(16)?,
        has_attachments: row.get(17)?,
        is_read: row.get(18)?,
        is_starred: row.get(19)?,
        is_archived: row.get(20)?,
        received_at: parse_datetime(&received_at),
        size_bytes: row.get(22)?,
        headers: from_json(&headers),
    })
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> Result<Thread, rusqlite::Error> {
    let participants: String = row.get(5)?;
    let first_message_at: String = row.get(7)?;
    let last_message_at: String = row.get(8)?;
    Ok(Thread {
        id: row.get(0)?,
        user_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        subject: row.get(3)?,
        normalized_subject: row.get(4)?,
        participants: from_json(&participants),
        message_count: row.get(6)?,
        first_message_at: parse_datetime(&first_message_at),
        last_message_at: parse_datetime(&last_message_at),
        is_unread: row.get(9)?,
        is_archived: row.get(10)?,
    })
}

fn row_to_bounce(row: &rusqlite::Row<'_>) -> Result<BounceAggregate, rusqlite::Error> {
    let bounce_type: String = row.get(4)?;
    let first_failed_at: String = row.get(8)?;
    let last_failed_at: String = row.get(9)?;
    Ok(BounceAggregate {
        id: row.get(0)?,
        user_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        recipient: row.get(3)?,
        bounce_type: BounceType::parse(&bounce_type),
        error_code: row.get(5)?,
        reason: row.get(6)?,
        failure_count: row.get(7)?,
        first_failed_at: parse_datetime(&first_failed_at),
        last_failed_at: parse_datetime(&last_failed_at),
    })
}

fn row_to_bounce_event(row: &rusqlite::Row<'_>) -> Result<BounceEvent, rusqlite::Error> {
    let occurred_at: String = row.get(6)?;
    Ok(BounceEvent {
        id: row.get(0)?,
        bounce_id: row.get(1)?,
        user_id: row.get(2)?,
        message_uid: row.get::<_, i64>(3)?.max(0) as u32,
        error_code: row.get(4)?,
        diagnostic: row.get(5)?,
        occurred_at: parse_datetime(&occurred_at),
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn make_mailbox(id: &str) -> Mailbox {
        Mailbox {
            id: id.into(),
            user_id: "user-1".into(),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            imap_username: "alice@example.com".into(),
            encrypted_password: "ciphertext".into(),
            status: MailboxStatus::Active,
            last_synced_uid: 0,
            last_synced_at: None,
            last_error: None,
        }
    }

    fn make_email(mailbox_id: &str, uid: u32, message_id: &str, thread_id: &str) -> Email {
        Email {
            id: Uuid::new_v4().to_string(),
            user_id: "user-1".into(),
            mailbox_id: mailbox_id.into(),
            uid,
            message_id: message_id.into(),
            thread_id: thread_id.into(),
            subject: "Hello".into(),
            from_address: "bob@example.com".into(),
            from_name: Some("Bob".into()),
            to_addresses: vec!["alice@example.com".into()],
            cc_addresses: vec![],
            bcc_addresses: vec![],
            category: Category::Human,
            category_confidence: 0.70,
            in_reply_to: None,
            references: vec![],
            body_preview: "Hi there".into(),
            has_attachments: false,
            is_read: false,
            is_starred: false,
            is_archived: false,
            received_at: Utc::now(),
            size_bytes: 1024,
            headers: HashMap::new(),
        }
    }

    fn make_thread(id: &str, mailbox_id: &str) -> Thread {
        let now = Utc::now();
        Thread {
            id: id.into(),
            user_id: "user-1".into(),
            mailbox_id: mailbox_id.into(),
            subject: "Hello".into(),
            normalized_subject: "hello".into(),
            participants: vec!["bob@example.com".into()],
            message_count: 1,
            first_message_at: now,
            last_message_at: now,
            is_unread: true,
            is_archived: false,
        }
    }

    #[tokio::test]
    async fn mailbox_round_trip_and_patch() {
        let store = test_store();
        store.insert_mailbox(&make_mailbox("mb-1")).await.unwrap();

        let loaded = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, MailboxStatus::Active);
        assert_eq!(loaded.last_synced_uid, 0);

        store
            .update_mailbox(
                "mb-1",
                MailboxPatch {
                    last_synced_uid: Some(42),
                    status: Some(MailboxStatus::Error),
                    last_error: Some(Some("LOGIN failed".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_synced_uid, 42);
        assert_eq!(loaded.status, MailboxStatus::Error);
        assert_eq!(loaded.last_error.as_deref(), Some("LOGIN failed"));

        // Clearing last_error via Some(None)
        store
            .update_mailbox(
                "mb-1",
                MailboxPatch {
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let loaded = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert!(loaded.last_error.is_none());
    }

    #[tokio::test]
    async fn list_active_skips_disabled() {
        let store = test_store();
        store.insert_mailbox(&make_mailbox("mb-a")).await.unwrap();
        let mut disabled = make_mailbox("mb-b");
        disabled.status = MailboxStatus::Disabled;
        store.insert_mailbox(&disabled).await.unwrap();
        let mut errored = make_mailbox("mb-c");
        errored.status = MailboxStatus::Error;
        store.insert_mailbox(&errored).await.unwrap();

        let ids = store.list_active_mailbox_ids().await.unwrap();
        assert_eq!(ids, vec!["mb-a".to_string(), "mb-c".to_string()]);
    }

    #[tokio::test]
    async fn email_unique_on_uid() {
        let store = test_store();
        store.insert_thread(&make_thread("t-1", "mb-1")).await.unwrap();
        store
            .insert_email(&make_email("mb-1", 7, "<m1@x>", "t-1"))
            .await
            .unwrap();

        let dup = store
            .insert_email(&make_email("mb-1", 7, "<m2@x>", "t-1"))
            .await;
        assert!(matches!(dup, Err(StoreError::Constraint(_))));
    }

    #[tokio::test]
    async fn email_unique_on_message_id() {
        let store = test_store();
        store.insert_thread(&make_thread("t-1", "mb-1")).await.unwrap();
        store
            .insert_email(&make_email("mb-1", 7, "<m1@x>", "t-1"))
            .await
            .unwrap();

        // Same message-id, different UID — folder-move duplicate.
        let dup = store
            .insert_email(&make_email("mb-1", 8, "<m1@x>", "t-1"))
            .await;
        assert!(matches!(dup, Err(StoreError::Constraint(_))));

        // Same message-id in a different mailbox is fine.
        store
            .insert_email(&make_email("mb-2", 7, "<m1@x>", "t-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_emails_by_message_ids_filters_by_mailbox() {
        let store = test_store();
        store
            .insert_email(&make_email("mb-1", 1, "<a@x>", "t-1"))
            .await
            .unwrap();
        store
            .insert_email(&make_email("mb-1", 2, "<b@x>", "t-1"))
            .await
            .unwrap();
        store
            .insert_email(&make_email("mb-2", 1, "<c@x>", "t-2"))
            .await
            .unwrap();

        let found = store
            .find_emails_by_message_ids(
                "mb-1",
                &["<a@x>".to_string(), "<c@x>".to_string(), "<zz@x>".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message_id, "<a@x>");
    }

    #[tokio::test]
    async fn thread_subject_lookup_respects_window() {
        let store = test_store();
        let mut thread = make_thread("t-1", "mb-1");
        thread.last_message_at = Utc::now() - chrono::Duration::days(10);
        store.insert_thread(&thread).await.unwrap();

        let since = Utc::now() - chrono::Duration::days(7);
        let found = store
            .find_thread_by_normalized_subject("mb-1", "hello", since)
            .await
            .unwrap();
        assert!(found.is_none());

        let old_since = Utc::now() - chrono::Duration::days(30);
        let found = store
            .find_thread_by_normalized_subject("mb-1", "hello", old_since)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn thread_aggregate_update() {
        let store = test_store();
        store.insert_thread(&make_thread("t-1", "mb-1")).await.unwrap();

        let now = Utc::now();
        store
            .update_thread(
                "t-1",
                ThreadAggregate {
                    message_count: 3,
                    last_message_at: now,
                    participants: vec!["a@x.com".into(), "b@x.com".into()],
                    is_unread: false,
                },
            )
            .await
            .unwrap();

        let thread = store.get_thread("t-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 3);
        assert_eq!(thread.participants.len(), 2);
        assert!(!thread.is_unread);
    }

    #[tokio::test]
    async fn bounce_upsert_and_increment() {
        let store = test_store();
        let now = Utc::now();
        let bounce = BounceAggregate {
            id: "b-1".into(),
            user_id: "user-1".into(),
            mailbox_id: "mb-1".into(),
            recipient: "ghost@example.com".into(),
            bounce_type: BounceType::Hard,
            error_code: "550".into(),
            reason: "User unknown".into(),
            failure_count: 1,
            first_failed_at: now,
            last_failed_at: now,
        };
        store.insert_bounce(&bounce).await.unwrap();

        let later = now + chrono::Duration::minutes(5);
        store.increment_bounce_failure("b-1", later).await.unwrap();

        let loaded = store
            .find_bounce("user-1", "mb-1", "ghost@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.failure_count, 2);
        assert!(loaded.last_failed_at > loaded.first_failed_at);
    }

    #[tokio::test]
    async fn increment_missing_bounce_is_not_found() {
        let store = test_store();
        let result = store.increment_bounce_failure("nope", Utc::now()).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn bounce_events_append_only() {
        let store = test_store();
        let now = Utc::now();
        for (i, uid) in [10u32, 11].iter().enumerate() {
            store
                .insert_bounce_event(&BounceEvent {
                    id: format!("ev-{i}"),
                    bounce_id: "b-1".into(),
                    user_id: "user-1".into(),
                    message_uid: *uid,
                    error_code: "550".into(),
                    diagnostic: "User unknown".into(),
                    occurred_at: now + chrono::Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }

        let events = store.list_bounce_events("b-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message_uid, 10);
    }
}
