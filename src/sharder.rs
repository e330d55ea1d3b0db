//! Hashing of bucketing keys into shards.
use sha2::{Digest, Sha256};

pub trait Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default sharder.
///
/// Interprets the first 32 bits of the SHA-256 digest (the first eight hex digits) as a
/// big-endian integer and reduces it modulo `total_shards`.
pub struct Sha256Sharder;

impl Sharder for Sha256Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = Sha256::digest(input.as_ref());
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        u64::from(value) % total_shards
    }
}

#[cfg(test)]
pub(crate) struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let key = String::from_utf8_lossy(input.as_ref());
        self.0.get(key.as_ref()).copied().unwrap_or(0) % total_shards
    }
}
