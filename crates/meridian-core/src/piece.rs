//! Piece chain: fixed-capacity batches of records with a running digest.
//!
//! A catalog is cut into pieces of at most `PIECE_SIZE` records. Each piece
//! carries a BLAKE3 digest accumulated over the canonical encoding of its
//! records in insertion order:
//!
//!   digest = H(enc(r0) || enc(r1) || ... )
//!
//! The digest is built incrementally as records are added, never by
//! buffering and hashing in one go. `rehash` recomputes it from the retained
//! records and must agree with the incremental value for the same sequence.

use thiserror::Error;

use crate::crypto::{self, Hasher};
use crate::record::Record;

/// Maximum number of records in one piece.
pub const PIECE_SIZE: usize = 1000;

// ── Piece ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Piece {
    id: u64,
    capacity: usize,
    records: Vec<Record>,
    /// Records fed through `add`, retained or not.
    hashed: usize,
    hasher: Hasher,
}

impl Piece {
    /// An empty piece with the standard capacity.
    pub fn new(id: u64) -> Self {
        Self::with_capacity(id, PIECE_SIZE)
    }

    pub fn with_capacity(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            records: Vec::new(),
            hashed: 0,
            hasher: Hasher::new(),
        }
    }

    /// Feed a record into the digest, keeping it if `retain` is set.
    ///
    /// With `retain == false` the piece only verifies: the record counts
    /// against capacity and changes the digest but is not stored.
    /// A full piece rejects the record and is left untouched.
    pub fn add(&mut self, record: Record, retain: bool) -> Result<(), PieceError> {
        if self.hashed >= self.capacity {
            return Err(PieceError::Full {
                id: self.id,
                capacity: self.capacity,
            });
        }

        let bytes = record.canonical_bytes()?;
        self.hasher.update(&bytes);
        self.hashed += 1;

        if retain {
            self.records.push(record);
        }
        Ok(())
    }

    /// Current accumulated digest.
    pub fn hash(&self) -> [u8; 32] {
        self.hasher.finalize()
    }

    /// Discard the running digest and rebuild it from the retained records.
    pub fn rehash(&mut self) -> Result<[u8; 32], PieceError> {
        let mut hasher = Hasher::new();
        for record in &self.records {
            hasher.update(&record.canonical_bytes()?);
        }

        self.hasher = hasher;
        self.hashed = self.records.len();
        Ok(self.hasher.finalize())
    }

    /// Rehash and compare against a digest declared by someone else.
    pub fn verify(&mut self, declared: &[u8; 32]) -> Result<(), PieceError> {
        let computed = self.rehash()?;
        if computed != *declared {
            return Err(PieceError::DigestMismatch {
                id: self.id,
                declared: hex::encode(declared),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records fed through `add` since creation or the last rehash.
    pub fn len(&self) -> usize {
        self.hashed
    }

    pub fn is_empty(&self) -> bool {
        self.hashed == 0
    }

    pub fn is_full(&self) -> bool {
        self.hashed >= self.capacity
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &self.hashed)
            .field("retained", &self.records.len())
            .field("hash", &hex::encode(self.hash()))
            .finish()
    }
}

// ── Collection ────────────────────────────────────────────────────────────────

/// An ordered catalog cut into pieces.
#[derive(Debug, Clone)]
pub struct Collection {
    piece_size: usize,
    pieces: Vec<Piece>,
}

impl Collection {
    pub fn new(piece_size: usize) -> Self {
        Self {
            piece_size,
            pieces: Vec::new(),
        }
    }

    /// Partition `records` in order into pieces of `piece_size`.
    pub fn from_records(
        records: impl IntoIterator<Item = Record>,
        piece_size: usize,
    ) -> Result<Self, PieceError> {
        let mut collection = Self::new(piece_size);
        for record in records {
            collection.push(record)?;
        }
        Ok(collection)
    }

    /// Assemble a collection from pieces that were already verified.
    pub fn from_pieces(piece_size: usize, pieces: Vec<Piece>) -> Self {
        Self { piece_size, pieces }
    }

    /// Append a record, opening a new piece when the last one is full.
    pub fn push(&mut self, record: Record) -> Result<(), PieceError> {
        if let Some(piece) = self.pieces.last_mut() {
            if !piece.is_full() {
                return piece.add(record, true);
            }
        }

        let mut piece = Piece::with_capacity(self.pieces.len() as u64, self.piece_size);
        piece.add(record, true)?;
        self.pieces.push(piece);
        Ok(())
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, index: usize) -> Option<&Piece> {
        self.pieces.get(index)
    }

    /// Digest of every piece, in order.
    pub fn hash_list(&self) -> Vec<[u8; 32]> {
        self.pieces.iter().map(Piece::hash).collect()
    }

    /// BLAKE3 over the concatenated hash list.
    pub fn root(&self) -> [u8; 32] {
        root_of(&self.hash_list())
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.pieces.iter().map(Piece::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every retained record, in catalog order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.pieces.iter().flat_map(|p| p.records().iter())
    }
}

/// Root digest over an ordered list of piece digests.
pub fn root_of(hashes: &[[u8; 32]]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize()
}

/// Number of pieces needed to hold `records` records.
pub fn piece_count(records: u64, piece_size: usize) -> u64 {
    if piece_size == 0 {
        return 0;
    }
    records.div_ceil(piece_size as u64)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece {id} full ({capacity} records)")]
    Full { id: u64, capacity: usize },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("piece {id} digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch {
        id: u64,
        declared: String,
        computed: String,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
