//! Scheduler — periodic cycle triggers with at-most-one sync per mailbox.
//!
//! Mailboxes run concurrently up to `worker_pool_size`, but strictly
//! sequentially within a single mailbox: a trigger that arrives while a
//! mailbox's cycle is still in flight is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::sync::SyncEngine;

/// Spawn the background scheduler loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop
/// triggering new cycles; in-flight cycles finish on their own.
pub fn spawn_sync_scheduler(engine: Arc<SyncEngine>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let cycle_interval = engine.config().cycle_interval;
    let pool_size = engine.config().worker_pool_size.max(1);

    let handle = tokio::spawn(async move {
        info!(
            "Sync scheduler started — cycle every {:?}, {} worker(s)",
            cycle_interval, pool_size
        );

        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let workers = Arc::new(Semaphore::new(pool_size));
        let mut tick = tokio::time::interval(cycle_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Sync scheduler shutting down");
                return;
            }

            let mailbox_ids = match engine.store().list_active_mailbox_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to list mailboxes: {e}");
                    continue;
                }
            };

            for mailbox_id in mailbox_ids {
                // At-most-one in-flight cycle per mailbox.
                if !in_flight.lock().await.insert(mailbox_id.clone()) {
                    debug!(mailbox_id = %mailbox_id, "Cycle still in flight, dropping trigger");
                    continue;
                }

                let Ok(permit) = workers.clone().acquire_owned().await else {
                    // Semaphore closed — only on shutdown.
                    in_flight.lock().await.remove(&mailbox_id);
                    return;
                };

                let engine = Arc::clone(&engine);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = engine.sync_mailbox(&mailbox_id).await {
                        error!(mailbox_id = %mailbox_id, error = %e, "Sync cycle failed");
                    }
                    in_flight.lock().await.remove(&mailbox_id);
                });
            }
        }
    });

    (handle, shutdown_flag)
}
