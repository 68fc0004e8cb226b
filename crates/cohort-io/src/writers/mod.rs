//! Streaming writers.

pub mod jsonl;
