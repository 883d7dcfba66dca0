//! Persistence layer — the `Store` trait and the SQLite backend.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{MailboxPatch, Store};
