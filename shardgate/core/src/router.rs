//! Shard Router
//!
//! Maps a record identifier to the index of the shard that owns it.
//!
//! # Algorithm
//!
//! Take the identifier's canonical form without separators (32 hex digits),
//! read the first 8 hex digits as an unsigned 32-bit integer and reduce it
//! modulo the shard count. Those 8 digits are exactly the first four bytes of
//! the identifier in big-endian order, which is what [`shard_index`] reads.
//!
//! The reduction is uniform only when the shard count is a power of two. Other
//! counts are slightly skewed towards low indices; that skew is accepted, and
//! the hashing scheme must stay as is so existing records keep their shard.

use std::num::NonZeroUsize;

use uuid::Uuid;

use crate::error::{Result, ShardError};

/// Shard owning `id` among `shard_count` shards
///
/// Pure and total: the same inputs always produce the same index in
/// `[0, shard_count)`.
#[must_use]
pub fn shard_index(id: &Uuid, shard_count: NonZeroUsize) -> usize {
    let bytes = id.as_bytes();
    let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    // u32 always fits in usize on supported targets
    prefix as usize % shard_count.get()
}

/// Parse a textual identifier before routing it
///
/// Accepts the hyphenated, simple, braced and URN forms. Malformed input is a
/// caller-side validation error; [`shard_index`] itself never fails.
///
/// # Errors
///
/// [`ShardError::InvalidIdentifier`] when `raw` is not a UUID.
pub fn parse_identifier(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| ShardError::InvalidIdentifier(raw.to_string()))
}
