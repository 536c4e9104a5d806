//! Utility functions for formatting hashes and hex strings.

pub mod formatting;

pub use formatting::{short_hash, truncate_id, with_0x_prefix, without_0x_prefix};
