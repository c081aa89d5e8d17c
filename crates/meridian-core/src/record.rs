//! Catalog records and their canonical encoding.

use serde::{Deserialize, Serialize};

/// One catalog entry ("post").
///
/// Records are immutable once admitted to a piece. The canonical encoding
/// is the only form that is ever hashed or sent to a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub info_hash: String,
    pub title: String,
    pub size: u64,
    pub file_count: u32,
    pub seeders: u32,
    pub leechers: u32,
    /// Unix timestamp, seconds.
    pub upload_date: i64,
    pub tags: String,
    pub meta: String,
}

impl Record {
    /// Deterministic byte encoding: compact JSON, fields in declaration order.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
