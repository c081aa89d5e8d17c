//! The local catalog, served to peers that mirror or browse it.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use meridian_core::crypto::{short_hex, Identity, PublicKey, SignatureBytes};
use meridian_core::{Collection, MessageKind, PieceError, Record, PIECE_SIZE};

use crate::message::Message;
use crate::mirror::HashList;
use crate::protocol::{ProtocolHandler, Reply, SessionHandler, Signer};

/// Most pieces one `Piece` request may ask for. Replies are built in memory
/// before they are written, so this bounds what one request can pin.
pub const MAX_PIECES_PER_REQUEST: u64 = 4;

/// Body of a `Piece` request: `count` pieces starting at index `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRequest {
    pub start: u64,
    pub count: u64,
}

/// Body of a `Recent` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentRequest {
    pub count: usize,
}

pub struct CatalogService {
    identity: Arc<Identity>,
    collection: RwLock<Collection>,
}

impl CatalogService {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self::with_collection(identity, Collection::new(PIECE_SIZE))
    }

    pub fn with_collection(identity: Arc<Identity>, collection: Collection) -> Self {
        Self {
            identity,
            collection: RwLock::new(collection),
        }
    }

    pub fn add_record(&self, record: Record) -> Result<(), PieceError> {
        self.collection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record)
    }

    pub fn len(&self) -> usize {
        self.collection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the catalog as it stands.
    pub fn snapshot(&self) -> Collection {
        self.collection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn hash_list(&self) -> HashList {
        let collection = self.collection.read().unwrap_or_else(PoisonError::into_inner);
        HashList::build(&collection, self.identity.as_ref())
    }
}

impl Signer for CatalogService {
    fn public_key(&self) -> PublicKey {
        self.identity.public
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.identity.sign(message)
    }
}

impl SessionHandler for CatalogService {
    fn on_close(&self, remote: &PublicKey) {
        tracing::debug!(peer = short_hex(remote), "peer disconnected");
    }
}

impl ProtocolHandler for CatalogService {
    fn handle_hash_list(&self, from: &PublicKey, _msg: &Message) -> Reply {
        let list = self.hash_list();
        tracing::debug!(
            peer = short_hex(from),
            pieces = list.hashes.len(),
            "serving hash list"
        );
        Ok(vec![Message::json(MessageKind::HashList, &list)?])
    }

    fn handle_piece(&self, from: &PublicKey, msg: &Message) -> Reply {
        let request: PieceRequest = msg.decode().context("bad piece request")?;
        let collection = self.collection.read().unwrap_or_else(PoisonError::into_inner);

        if request.count > MAX_PIECES_PER_REQUEST {
            return Ok(vec![Message::no(format!(
                "at most {MAX_PIECES_PER_REQUEST} pieces per request, asked for {}",
                request.count
            ))]);
        }

        let total = collection.pieces().len() as u64;
        let end = request.start.saturating_add(request.count);
        if end > total {
            return Ok(vec![Message::no(format!(
                "pieces {}..{end} out of range ({total} pieces)",
                request.start
            ))]);
        }

        let mut replies = Vec::new();
        for piece in &collection.pieces()[request.start as usize..end as usize] {
            for record in piece.records() {
                replies.push(Message::new(MessageKind::Post, record.canonical_bytes()?));
            }
        }
        tracing::debug!(
            peer = short_hex(from),
            start = request.start,
            count = request.count,
            records = replies.len(),
            "serving pieces"
        );

        replies.push(Message::ok());
        Ok(replies)
    }

    fn handle_recent(&self, _from: &PublicKey, msg: &Message) -> Reply {
        let request: RecentRequest = msg.decode().context("bad recent request")?;
        let collection = self.collection.read().unwrap_or_else(PoisonError::into_inner);
        let records: Vec<&Record> = collection.records().collect();

        let mut replies = records
            .iter()
            .rev()
            .take(request.count)
            .map(|r| Ok(Message::new(MessageKind::Post, r.canonical_bytes()?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        replies.push(Message::ok());
        Ok(replies)
    }
}

/// Deterministic filler records for a demo catalog.
pub fn demo_records(count: u64) -> impl Iterator<Item = Record> {
    (0..count).map(|i| Record {
        id: i,
        info_hash: hex::encode(meridian_core::crypto::hash(&i.to_le_bytes()))[..40].to_string(),
        title: format!("demo record {i}"),
        size: 1024 * (i + 1),
        file_count: (i % 7 + 1) as u32,
        seeders: (i % 50) as u32,
        leechers: (i % 13) as u32,
        upload_date: 1_600_000_000 + i as i64 * 60,
        tags: if i % 2 == 0 { "video".into() } else { "audio".into() },
        meta: String::new(),
    })
}
