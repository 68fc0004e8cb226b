#![forbid(unsafe_code)]
//! cohort-store: the three shared stores of the execution core.
//!
//! - `cache`: content-addressed response cache (in-memory index, optional
//!   read-through/write-through backend). Backend failures degrade to misses.
//! - `checkpoint`: durable, checksummed run snapshots keyed by run id.
//! - `conversation`: per-entity append-only turn log with wave ordering checks.
//!
//! Persistence goes through the `Storage` trait; concrete backends live in
//! `cohort-io`. Nothing here is async.

pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod conversation;
pub mod error;
pub mod record;
pub mod storage;

pub use cache::{CacheStats, CacheStore};
pub use checkpoint::CheckpointStore;
pub use codec::Codec;
pub use conversation::ConversationStore;
pub use error::{Error, Result};
pub use record::{RecordKind, HEADER_LEN};
pub use storage::Storage;
