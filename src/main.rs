use std::sync::atomic::Ordering;
use std::sync::Arc;

use mailsift::config::SyncConfig;
use mailsift::crypto::AesGcmCipher;
use mailsift::fetch::imap::ImapFetcher;
use mailsift::store::SqliteStore;
use mailsift::sync::{spawn_sync_scheduler, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let credential_key = std::env::var("MAILSIFT_CREDENTIAL_KEY").unwrap_or_else(|_| {
        eprintln!("Error: MAILSIFT_CREDENTIAL_KEY not set");
        eprintln!("  export MAILSIFT_CREDENTIAL_KEY=<base64 32-byte key>");
        std::process::exit(1);
    });
    let cipher = Arc::new(AesGcmCipher::from_base64_key(&credential_key)?);

    let db_path =
        std::env::var("MAILSIFT_DB").unwrap_or_else(|_| "data/mailsift.db".to_string());
    let store = Arc::new(SqliteStore::open(&db_path)?);

    let config = SyncConfig::from_env();
    eprintln!("mailsift v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {db_path}");
    eprintln!(
        "   Cycle: every {:?}, batch {} messages, SINCE window {} days",
        config.cycle_interval, config.batch_size, config.since_days
    );

    let fetcher = Arc::new(ImapFetcher::new(config.fetch_options()));
    let engine = Arc::new(SyncEngine::new(store, fetcher, cipher, config));

    let (scheduler, shutdown) = spawn_sync_scheduler(engine);

    tokio::signal::ctrl_c().await?;
    eprintln!("Shutting down...");
    shutdown.store(true, Ordering::Relaxed);
    scheduler.abort();

    Ok(())
}
