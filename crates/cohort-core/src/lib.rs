#![forbid(unsafe_code)]
//! cohort-core: shared vocabulary for the cohort simulation engine.
//!
//! Everything here is plain data plus deterministic helpers:
//! - strongly-typed ids (`TaskId`, `WaveNumber`, `EntityId`, `RunId`)
//! - the task/outcome/result model and the checkpoint record
//! - canonical hashing used for cache keys and task-set fingerprints
//! - run configuration and retry policy values
//!
//! No async, no I/O. Store, exec and cli crates build on top of this.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod prelude;
pub mod types;

/// Engine version recorded in manifests and checkpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
