//! Sync orchestration — the per-mailbox coordinator and the scheduler loop.

pub mod coordinator;
pub mod scheduler;

pub use coordinator::{CycleStats, SyncEngine};
pub use scheduler::spawn_sync_scheduler;
