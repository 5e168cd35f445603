/// A stable record identifier derived from (content_hash, chunk_index).
///
/// Identical content always maps to the same ids, so rebuilding a
/// collection from the same files reproduces the same keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    /// The numeric ID used as the key in redb tables.
    pub numeric: u64,
    /// The short hex string for human display (e.g. "a1b2c3").
    pub short: String,
}

impl RecordId {
    pub fn new(content_hash: &str, chunk_index: usize) -> Self {
        let numeric = Self::hash_pair(content_hash, chunk_index);
        Self::from_numeric(numeric)
    }

    pub fn from_numeric(numeric: u64) -> Self {
        Self {
            numeric,
            short: Self::short_hex(numeric, 6),
        }
    }

    fn hash_pair(content_hash: &str, chunk_index: usize) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(content_hash.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(chunk_index as u64).to_le_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(prefix)
    }

    fn short_hex(value: u64, len: usize) -> String {
        let full = format!("{value:016x}");
        full[..len].to_string()
    }

    /// Extend the short ID to avoid collisions.
    pub fn extend_short(&self, len: usize) -> Self {
        let len = len.clamp(6, 16);
        Self {
            numeric: self.numeric,
            short: Self::short_hex(self.numeric, len),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short)
    }
}
