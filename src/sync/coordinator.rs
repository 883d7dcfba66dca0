//! Mailbox coordinator — drives one sync cycle per mailbox.
//!
//! Per-message failures are logged and skipped; the checkpoint never
//! advances past a failed UID, so the next cycle re-examines it (the
//! persister's dedup guard makes re-examination safe). Fetch-level and
//! credential failures are recorded on the mailbox and end the cycle.
//! Nothing propagates beyond a single mailbox cycle except store failures
//! on the mailbox record itself.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bounce::{BounceParser, NO_DIAGNOSTIC};
use crate::classify::Classifier;
use crate::config::SyncConfig;
use crate::crypto::CredentialCipher;
use crate::error::Error;
use crate::fetch::{MessageSource, RawMessage};
use crate::model::{Category, Mailbox, MailboxStatus};
use crate::persist::{Persister, PersistOutcome};
use crate::store::{MailboxPatch, Store};
use crate::thread::ThreadResolver;

/// Counters for one completed cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub fetched: usize,
    pub persisted: usize,
    pub duplicates: usize,
    pub bounces: usize,
    pub failed: usize,
}

enum MessageOutcome {
    Persisted { bounce_recorded: bool },
    Duplicate,
}

/// The sync engine: fetch → classify → thread → persist → bounce branch.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    source: Arc<dyn MessageSource>,
    cipher: Arc<dyn CredentialCipher>,
    classifier: Classifier,
    bounce_parser: BounceParser,
    resolver: ThreadResolver,
    persister: Persister,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn MessageSource>,
        cipher: Arc<dyn CredentialCipher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            classifier: Classifier::new(),
            bounce_parser: BounceParser::new(config.bounce_subject_fallback),
            resolver: ThreadResolver::new(store.clone()),
            persister: Persister::new(store.clone()),
            store,
            source,
            cipher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync cycle for a mailbox.
    pub async fn sync_mailbox(&self, mailbox_id: &str) -> Result<CycleStats, Error> {
        let Some(mailbox) = self.store.get_mailbox(mailbox_id).await? else {
            debug!(mailbox_id, "Mailbox not found, skipping");
            return Ok(CycleStats::default());
        };
        if mailbox.status == MailboxStatus::Disabled {
            debug!(mailbox_id, "Mailbox disabled, skipping");
            return Ok(CycleStats::default());
        }

        // Decrypt credentials; failure is terminal for this mailbox.
        let password = match self.cipher.decrypt(&mailbox.encrypted_password) {
            Ok(password) => password,
            Err(e) => {
                error!(mailbox_id, error = %e, "Credential decryption failed");
                self.store
                    .update_mailbox(
                        mailbox_id,
                        MailboxPatch {
                            status: Some(MailboxStatus::Error),
                            last_error: Some(Some(e.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(CycleStats::default());
            }
        };

        let batch = match self
            .source
            .fetch(&mailbox, &password, mailbox.last_synced_uid)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(mailbox_id, error = %e, fatal = e.is_fatal(), "Fetch failed");
                // Auth failures mark the mailbox failed; transient errors
                // leave it active for the next cycle's retry. The
                // checkpoint is untouched either way.
                let status = e.is_fatal().then_some(MailboxStatus::Error);
                self.store
                    .update_mailbox(
                        mailbox_id,
                        MailboxPatch {
                            status,
                            last_error: Some(Some(e.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(CycleStats::default());
            }
        };

        if batch.messages.is_empty() {
            self.store
                .update_mailbox(
                    mailbox_id,
                    MailboxPatch {
                        last_synced_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            debug!(mailbox_id, "No new messages");
            return Ok(CycleStats::default());
        }

        let mut stats = CycleStats {
            fetched: batch.messages.len(),
            ..Default::default()
        };
        let mut max_uid = mailbox.last_synced_uid;
        let mut checkpoint_frozen = false;

        for msg in &batch.messages {
            match self.process_message(&mailbox, msg).await {
                Ok(outcome) => {
                    if !checkpoint_frozen {
                        max_uid = max_uid.max(msg.uid);
                    }
                    match outcome {
                        MessageOutcome::Persisted { bounce_recorded } => {
                            stats.persisted += 1;
                            if bounce_recorded {
                                stats.bounces += 1;
                            }
                        }
                        MessageOutcome::Duplicate => stats.duplicates += 1,
                    }
                }
                Err(e) => {
                    warn!(mailbox_id, uid = msg.uid, error = %e, "Failed to process message, skipping");
                    stats.failed += 1;
                    // Re-runs must re-examine this UID; stop advancing.
                    checkpoint_frozen = true;
                }
            }
        }

        self.store
            .update_mailbox(
                mailbox_id,
                MailboxPatch {
                    last_synced_uid: Some(max_uid),
                    last_synced_at: Some(Utc::now()),
                    status: Some(MailboxStatus::Active),
                    last_error: Some(None),
                },
            )
            .await?;

        info!(
            mailbox_id,
            fetched = stats.fetched,
            persisted = stats.persisted,
            duplicates = stats.duplicates,
            bounces = stats.bounces,
            failed = stats.failed,
            truncated = batch.truncated,
            last_synced_uid = max_uid,
            "Sync cycle complete"
        );
        Ok(stats)
    }

    /// Classify → resolve thread → persist → bounce branch, for one message.
    async fn process_message(
        &self,
        mailbox: &Mailbox,
        msg: &RawMessage,
    ) -> Result<MessageOutcome, Error> {
        // Check both unique keys up front so redelivered messages never
        // create stray threads before the persister's dedup guard runs.
        if self.store.find_email(&mailbox.id, msg.uid).await?.is_some() {
            return Ok(MessageOutcome::Duplicate);
        }
        if self
            .store
            .find_email_by_message_id(&mailbox.id, &msg.message_id)
            .await?
            .is_some()
        {
            return Ok(MessageOutcome::Duplicate);
        }

        let classification = self.classifier.classify(msg);
        let now = Utc::now();
        let thread_id = self.resolver.resolve(mailbox, msg, now).await?;

        let bounce = (classification.category == Category::Bounce)
            .then(|| self.bounce_parser.parse(msg));
        if let Some(bounce) = &bounce {
            if bounce.recipient.is_none() || bounce.diagnostic == NO_DIAGNOSTIC {
                if self.config.debug_bounces {
                    let preview: String = msg.body.chars().take(500).collect();
                    debug!(uid = msg.uid, body = %preview, "Unparseable bounce");
                } else {
                    debug!(uid = msg.uid, "Unparseable bounce");
                }
            }
        }

        let outcome = self
            .persister
            .persist(mailbox, msg, classification, &thread_id, bounce.as_ref(), now)
            .await?;

        Ok(match outcome {
            PersistOutcome::Inserted => MessageOutcome::Persisted {
                bounce_recorded: bounce.as_ref().is_some_and(|b| b.recipient.is_some()),
            },
            PersistOutcome::Duplicate => MessageOutcome::Duplicate,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, FetchError};
    use crate::fetch::FetchBatch;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Source that replays scripted fetch results, then empty batches.
    struct ScriptedSource {
        results: Mutex<VecDeque<Result<FetchBatch, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(results: Vec<Result<FetchBatch, FetchError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn fetch(
            &self,
            _mailbox: &Mailbox,
            _password: &SecretString,
            _last_uid: u32,
        ) -> Result<FetchBatch, FetchError> {
            self.results
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(FetchBatch::default()))
        }
    }

    /// Cipher that passes the ciphertext through as the password.
    struct NoopCipher;

    impl CredentialCipher for NoopCipher {
        fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CryptoError> {
            Ok(SecretString::from(ciphertext.to_string()))
        }

        fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
            Ok(plaintext.to_string())
        }
    }

    /// Cipher that always fails.
    struct BrokenCipher;

    impl CredentialCipher for BrokenCipher {
        fn decrypt(&self, _ciphertext: &str) -> Result<SecretString, CryptoError> {
            Err(CryptoError::Decrypt("AES-GCM authentication failed".into()))
        }

        fn encrypt(&self, _plaintext: &str) -> Result<String, CryptoError> {
            Err(CryptoError::Encrypt("broken".into()))
        }
    }

    async fn seed_mailbox(store: &SqliteStore, status: MailboxStatus) {
        store
            .insert_mailbox(&Mailbox {
                id: "mb-1".into(),
                user_id: "user-1".into(),
                imap_host: "imap.example.com".into(),
                imap_port: 993,
                imap_username: "alice".into(),
                encrypted_password: "hunter2".into(),
                status,
                last_synced_uid: 0,
                last_synced_at: None,
                last_error: None,
            })
            .await
            .unwrap();
    }

    fn engine(
        store: Arc<SqliteStore>,
        source: ScriptedSource,
        cipher: Arc<dyn CredentialCipher>,
    ) -> SyncEngine {
        SyncEngine::new(store, Arc::new(source), cipher, SyncConfig::default())
    }

    #[tokio::test]
    async fn unknown_mailbox_is_silent() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = engine(store, ScriptedSource::new(vec![]), Arc::new(NoopCipher));
        let stats = engine.sync_mailbox("missing").await.unwrap();
        assert_eq!(stats.fetched, 0);
    }

    #[tokio::test]
    async fn disabled_mailbox_is_skipped() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_mailbox(&store, MailboxStatus::Disabled).await;
        let engine = engine(
            store.clone(),
            ScriptedSource::new(vec![Err(FetchError::Auth("should not be called".into()))]),
            Arc::new(NoopCipher),
        );

        engine.sync_mailbox("mb-1").await.unwrap();
        let mailbox = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(mailbox.status, MailboxStatus::Disabled);
        assert!(mailbox.last_error.is_none());
    }

    #[tokio::test]
    async fn decryption_failure_marks_mailbox_failed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_mailbox(&store, MailboxStatus::Active).await;
        let engine = engine(store.clone(), ScriptedSource::new(vec![]), Arc::new(BrokenCipher));

        engine.sync_mailbox("mb-1").await.unwrap();
        let mailbox = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(mailbox.status, MailboxStatus::Error);
        assert!(mailbox.last_error.unwrap().contains("Decryption failed"));
    }

    #[tokio::test]
    async fn auth_failure_marks_mailbox_failed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_mailbox(&store, MailboxStatus::Active).await;
        let engine = engine(
            store.clone(),
            ScriptedSource::new(vec![Err(FetchError::Auth("A1 NO LOGIN failed".into()))]),
            Arc::new(NoopCipher),
        );

        engine.sync_mailbox("mb-1").await.unwrap();
        let mailbox = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(mailbox.status, MailboxStatus::Error);
        assert_eq!(mailbox.last_synced_uid, 0);
    }

    #[tokio::test]
    async fn transient_failure_keeps_mailbox_active() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_mailbox(&store, MailboxStatus::Active).await;
        let engine = engine(
            store.clone(),
            ScriptedSource::new(vec![Err(FetchError::Timeout("server greeting".into()))]),
            Arc::new(NoopCipher),
        );

        engine.sync_mailbox("mb-1").await.unwrap();
        let mailbox = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert_eq!(mailbox.status, MailboxStatus::Active);
        assert!(mailbox.last_error.unwrap().contains("Timed out"));
        assert_eq!(mailbox.last_synced_uid, 0);
    }

    #[tokio::test]
    async fn empty_batch_only_touches_freshness() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_mailbox(&store, MailboxStatus::Active).await;
        let engine = engine(
            store.clone(),
            ScriptedSource::new(vec![Ok(FetchBatch::default())]),
            Arc::new(NoopCipher),
        );

        engine.sync_mailbox("mb-1").await.unwrap();
        let mailbox = store.get_mailbox("mb-1").await.unwrap().unwrap();
        assert!(mailbox.last_synced_at.is_some());
        assert_eq!(mailbox.last_synced_uid, 0);
    }
}
