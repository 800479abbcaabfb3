// ABOUTME: Persistence layer for packsync, built on a namespaced key/value substrate.
// ABOUTME: Provides the SQLite and in-memory substrates, the pack store, and the durable outbox queue.

pub mod memory;
pub mod outbox;
pub mod pack_store;
pub mod sqlite;
pub mod substrate;

pub use memory::MemorySubstrate;
pub use outbox::{FlushReport, Outbox, OutboxError, RetryPolicy};
pub use pack_store::{PackChange, PackStore, PackStoreError};
pub use sqlite::SqliteSubstrate;
pub use substrate::{Substrate, SubstrateError};
