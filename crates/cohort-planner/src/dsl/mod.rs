//! Study document formats.

pub mod yaml;
