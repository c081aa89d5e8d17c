//! Mirroring: pull a peer's whole catalog, one verified piece at a time.
//!
//! The peer first sends a hash list signed with its identity key. Each piece
//! is then requested on its own and its records are collected into a piece
//! whose rehashed digest must match the declared one before the next piece
//! is requested. Verified pieces survive a failed attempt in a
//! [`PartialMirror`], so a retry starts at the piece that failed.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use meridian_core::crypto::{self, short_hex, CryptoError, PublicKey};
use meridian_core::piece::{piece_count, root_of};
use meridian_core::{Collection, MessageKind, Piece, PieceError, Record};

use crate::catalog::PieceRequest;
use crate::message::{read_message, write_message, Message};
use crate::protocol::Signer;
use crate::session::{SessionError, SessionManager};
use crate::streams::LogicalStream;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("unexpected {0:?} reply")]
    Unexpected(MessageKind),

    #[error("malformed hash list: {0}")]
    MalformedHashList(String),

    #[error("hash list signature does not verify: {0}")]
    BadSignature(#[source] CryptoError),

    #[error("hash list signed by {claimed}, not by the connected peer")]
    WrongPeer { claimed: String },

    #[error("piece {piece} does not match its declared digest")]
    PieceMismatch { piece: u64 },

    #[error(transparent)]
    Piece(#[from] PieceError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),
}

// ── Hash list ─────────────────────────────────────────────────────────────────

/// A catalog's piece digests, signed by its owner. Byte fields are hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashList {
    pub public_key: String,
    pub record_count: u64,
    pub piece_size: u64,
    pub hashes: Vec<String>,
    pub signature: String,
}

impl HashList {
    pub fn build<S: Signer + ?Sized>(collection: &Collection, signer: &S) -> Self {
        let digests = collection.hash_list();
        let record_count = collection.len() as u64;
        let piece_size = collection.piece_size() as u64;
        let payload = signing_payload(&root_of(&digests), record_count, piece_size);

        Self {
            public_key: hex::encode(signer.public_key()),
            record_count,
            piece_size,
            hashes: digests.iter().map(hex::encode).collect(),
            signature: hex::encode(signer.sign(&payload)),
        }
    }

    /// Decoded piece digests, in order.
    pub fn digests(&self) -> Result<Vec<[u8; 32]>, MirrorError> {
        self.hashes.iter().map(|h| decode_hex32(h)).collect()
    }

    /// Root over the declared digests.
    pub fn root(&self) -> Result<[u8; 32], MirrorError> {
        Ok(root_of(&self.digests()?))
    }

    /// Check that `signer` produced this list and that it is internally
    /// consistent. Returns the decoded digests.
    pub fn verify(&self, signer: &PublicKey) -> Result<Vec<[u8; 32]>, MirrorError> {
        let claimed = decode_hex32(&self.public_key)?;
        if &claimed != signer {
            return Err(MirrorError::WrongPeer {
                claimed: self.public_key.clone(),
            });
        }

        if self.piece_size == 0 && self.record_count > 0 {
            return Err(MirrorError::MalformedHashList("zero piece size".into()));
        }
        let expected = piece_count(self.record_count, self.piece_size as usize);
        if self.hashes.len() as u64 != expected {
            return Err(MirrorError::MalformedHashList(format!(
                "{} hashes for {} records, expected {expected}",
                self.hashes.len(),
                self.record_count
            )));
        }

        let digests = self.digests()?;
        let signature = hex::decode(&self.signature)
            .map_err(|e| MirrorError::MalformedHashList(format!("signature: {e}")))?;
        let payload = signing_payload(&root_of(&digests), self.record_count, self.piece_size);
        crypto::verify(signer, &payload, &signature).map_err(MirrorError::BadSignature)?;

        Ok(digests)
    }
}

fn signing_payload(root: &[u8; 32], record_count: u64, piece_size: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(root);
    payload.extend_from_slice(&record_count.to_le_bytes());
    payload.extend_from_slice(&piece_size.to_le_bytes());
    payload
}

fn decode_hex32(s: &str) -> Result<[u8; 32], MirrorError> {
    let bytes = hex::decode(s).map_err(|e| MirrorError::MalformedHashList(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| MirrorError::MalformedHashList(format!("expected 32 bytes: {s}")))
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Pieces verified so far, per peer address.
#[derive(Debug, Clone, Default)]
pub struct MirrorProgress {
    inner: Arc<DashMap<String, usize>>,
}

impl MirrorProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &str, pieces: usize) {
        self.inner.insert(address.to_string(), pieces);
    }

    pub fn get(&self, address: &str) -> Option<usize> {
        self.inner.get(address).map(|v| *v)
    }

    pub fn remove(&self, address: &str) -> Option<usize> {
        self.inner.remove(address).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Current values, sorted by address.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut all: Vec<_> = self
            .inner
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        all
    }
}

async fn track_progress(mut rx: mpsc::Receiver<usize>, progress: MirrorProgress, address: String) {
    while let Some(done) = rx.recv().await {
        progress.set(&address, done);
    }
}

// ── Mirroring ─────────────────────────────────────────────────────────────────

/// Pieces verified by earlier attempts against one peer.
///
/// Passing the same value to [`resume_mirror`] again skips every piece it
/// already holds, so a failed attempt is retried from the piece that failed.
#[derive(Debug, Default)]
pub struct PartialMirror {
    remote: Option<PublicKey>,
    pieces: Vec<Piece>,
}

impl PartialMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first piece still to fetch.
    pub fn next_piece(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Keep only the leading pieces that still match `digests` and were
    /// fetched from `remote` with the same piece size.
    fn retain_matching(&mut self, remote: &PublicKey, piece_size: usize, digests: &[[u8; 32]]) {
        if self.remote.as_ref() != Some(remote) {
            self.pieces.clear();
            self.remote = Some(*remote);
            return;
        }
        let keep = self
            .pieces
            .iter()
            .zip(digests)
            .take_while(|(piece, declared)| {
                piece.capacity() == piece_size && piece.hash() == **declared
            })
            .count();
        self.pieces.truncate(keep);
    }
}

/// Mirror the catalog of the peer at `address` from scratch.
///
/// Connects and multiplexes as client if `manager` has not already. Piece
/// counts are reported to `progress` through a channel of `buffer` slots.
pub async fn mirror(
    manager: &SessionManager,
    address: &str,
    progress: &MirrorProgress,
    buffer: usize,
) -> Result<Collection, MirrorError> {
    resume_mirror(manager, address, progress, buffer, &mut PartialMirror::new()).await
}

/// Like [`mirror`], starting after the pieces already held in `partial`.
///
/// Every piece that verifies is appended to `partial` before the next one is
/// requested. On success the pieces move into the returned collection and
/// `partial` is left empty.
pub async fn resume_mirror(
    manager: &SessionManager,
    address: &str,
    progress: &MirrorProgress,
    buffer: usize,
    partial: &mut PartialMirror,
) -> Result<Collection, MirrorError> {
    let header = manager.connect(address).await?;
    manager.become_multiplex_client().await?;

    let hash_list = fetch_hash_list(manager).await?;
    let digests = hash_list.verify(&header.remote_key)?;
    let piece_size = usize::try_from(hash_list.piece_size)
        .map_err(|_| MirrorError::MalformedHashList("piece size overflows".into()))?;

    partial.retain_matching(&header.remote_key, piece_size, &digests);
    let start = partial.next_piece();
    tracing::info!(
        peer = %address,
        public_key = short_hex(&header.remote_key),
        records = hash_list.record_count,
        pieces = digests.len(),
        start,
        "hash list verified"
    );
    if start > 0 {
        progress.set(address, start);
    }

    let (tx, rx) = mpsc::channel(buffer.max(1));
    let consumer = tokio::spawn(track_progress(rx, progress.clone(), address.to_string()));

    // `tx` moves in and is dropped when fetching ends, however it ends.
    let result = fetch_pieces(manager, &hash_list, piece_size, &digests, partial, tx).await;

    if let Err(e) = consumer.await {
        tracing::warn!(error = %e, "progress task failed");
    }

    match result {
        Ok(()) => {
            let pieces = std::mem::take(&mut partial.pieces);
            let collection = Collection::from_pieces(piece_size, pieces);
            tracing::info!(peer = %address, records = collection.len(), "mirror complete");
            Ok(collection)
        }
        Err(e) => {
            tracing::warn!(
                peer = %address,
                verified = partial.next_piece(),
                error = %e,
                "mirror failed"
            );
            Err(e)
        }
    }
}

async fn fetch_hash_list(manager: &SessionManager) -> Result<HashList, MirrorError> {
    let mut stream = manager.open_stream().await?;
    write_message(&mut stream, &Message::new(MessageKind::HashList, Bytes::new())).await?;

    let reply = expect(read_message(&mut stream).await?, MessageKind::HashList)?;
    let list = reply.decode()?;
    finish(&mut stream).await?;
    Ok(list)
}

/// Request the pieces `partial` is missing one at a time on a single stream.
async fn fetch_pieces(
    manager: &SessionManager,
    list: &HashList,
    piece_size: usize,
    digests: &[[u8; 32]],
    partial: &mut PartialMirror,
    progress: mpsc::Sender<usize>,
) -> Result<(), MirrorError> {
    let start = partial.next_piece();
    if start == digests.len() {
        return Ok(());
    }

    let mut stream = manager.open_stream().await?;
    for (index, declared) in digests.iter().enumerate().skip(start) {
        let request = PieceRequest {
            start: index as u64,
            count: 1,
        };
        write_message(&mut stream, &Message::json(MessageKind::Piece, &request)?).await?;

        let before = index as u64 * list.piece_size;
        let expected = list.record_count.saturating_sub(before).min(list.piece_size);
        let mut piece = Piece::with_capacity(index as u64, piece_size);
        for _ in 0..expected {
            let post = expect(read_message(&mut stream).await?, MessageKind::Post)?;
            piece.add(Record::from_canonical_bytes(&post.content)?, true)?;
        }
        expect(read_message(&mut stream).await?, MessageKind::Ok)?;

        let computed = piece.rehash()?;
        if &computed != declared {
            tracing::warn!(
                piece = index,
                declared = %hex::encode(declared),
                computed = %hex::encode(computed),
                "piece digest mismatch"
            );
            return Err(MirrorError::PieceMismatch {
                piece: index as u64,
            });
        }

        tracing::debug!(piece = index, records = piece.len(), "piece verified");
        partial.pieces.push(piece);
        if progress.send(index + 1).await.is_err() {
            tracing::debug!("progress consumer gone");
        }
    }

    finish(&mut stream).await
}

fn expect(msg: Message, kind: MessageKind) -> Result<Message, MirrorError> {
    if let Some(reason) = msg.rejection() {
        return Err(MirrorError::Rejected(reason));
    }
    if msg.kind != kind {
        return Err(MirrorError::Unexpected(msg.kind));
    }
    Ok(msg)
}

async fn finish(stream: &mut LogicalStream) -> Result<(), MirrorError> {
    stream.shutdown().await.map_err(SessionError::from)?;
    Ok(())
}
