#![forbid(unsafe_code)]
//! cohort-io: concrete storage backends and result writers.
//!
//! - `storage`: `FsStorage` (atomic temp-file + rename writes) and
//!   `MemoryStorage`, plus `build_storage_from_uri` to pick one from a URI.
//! - `writers`: NDJSON output for task outcomes and results.

pub mod error;
pub mod storage;
pub mod writers;

pub use error::{Error, Result};
pub use storage::{build_storage_from_uri, FsStorage, MemoryStorage};
pub use writers::jsonl::JsonlWriter;
