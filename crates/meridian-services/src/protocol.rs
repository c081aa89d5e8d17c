//! Capability traits between the session core and the peer logic above it.
//!
//! The session core calls exactly two things: a `Signer` during the
//! handshake and `SessionHandler::on_close` on teardown. Everything a peer
//! can ask for once a session is up goes through `ProtocolHandler`, which
//! the stream dispatcher drives.

use anyhow::Result;
use bytes::Bytes;

use meridian_core::crypto::{self, CryptoError, Identity, PublicKey, SignatureBytes};
use meridian_core::MessageKind;

use crate::message::Message;
use crate::session::Session;
use crate::streams::{LogicalStream, SharedStream};

/// Produce and check Ed25519 signatures.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> SignatureBytes;

    fn verify(
        &self,
        public_key: &PublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        crypto::verify(public_key, message, signature)
    }
}

impl Signer for Identity {
    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        Identity::sign(self, message)
    }
}

/// What the session core needs from the layer above it.
pub trait SessionHandler: Signer {
    /// Decide whether an authenticated peer may proceed.
    /// The error string is sent to the peer as the rejection reason.
    fn accept_peer(&self, _remote: &PublicKey) -> Result<(), String> {
        Ok(())
    }

    /// Called once when a connection with `remote` is torn down.
    fn on_close(&self, remote: &PublicKey);
}

/// Replies to write back on the stream a request arrived on.
pub type Reply = Result<Vec<Message>>;

/// Handlers for every request kind a peer may send on a logical stream.
///
/// Intentionally synchronous: a handler computes its replies and the
/// dispatcher writes them. Unimplemented kinds reject with "unsupported".
pub trait ProtocolHandler: SessionHandler {
    fn handle_announce(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_query(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_find_closest(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_search(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_recent(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_popular(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_hash_list(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_piece(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_add_peer(&self, _from: &PublicKey, msg: &Message) -> Reply {
        unsupported(msg)
    }

    fn handle_ping(&self, _from: &PublicKey, _msg: &Message) -> Reply {
        Ok(vec![Message::new(MessageKind::Pong, Bytes::new())])
    }
}

fn unsupported(msg: &Message) -> Reply {
    Ok(vec![Message::no(format!("unsupported request: {:?}", msg.kind))])
}

/// A connected peer as seen by the layers above the session core.
///
/// Address resolution and routing lookups belong to the routing layer and
/// are not part of this contract.
pub trait NetworkPeer: Send + Sync {
    /// The active multiplexed session, if one has been negotiated.
    fn session(&self) -> Option<Session>;

    /// Track a stream the peer opened on our session.
    fn add_stream(&self, stream: LogicalStream) -> SharedStream;

    /// The authenticated remote key, once the handshake has completed.
    fn public_key(&self) -> Option<PublicKey>;

    /// The address this peer was dialed at or accepted from.
    fn address(&self) -> Option<String>;
}
