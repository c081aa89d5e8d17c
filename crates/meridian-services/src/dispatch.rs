//! Routes requests arriving on a peer-opened stream to the protocol handler.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use meridian_core::crypto::{short_hex, PublicKey};
use meridian_core::MessageKind;

use crate::message::{read_message, write_message, Message};
use crate::protocol::{ProtocolHandler, Reply};
use crate::session::SessionError;

/// Serve requests on `stream` until the peer closes its write half.
///
/// Each request gets every reply message the handler produced, in order.
/// A handler error is reported to the peer as `No` and the stream stays up.
pub async fn serve_stream<S, H>(
    stream: &mut S,
    remote: &PublicKey,
    handler: &H,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    H: ProtocolHandler + ?Sized,
{
    loop {
        let request = match read_message(stream).await {
            Ok(msg) => msg,
            Err(SessionError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let replies = match dispatch(handler, remote, &request) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(
                    peer = short_hex(remote),
                    kind = ?request.kind,
                    error = %e,
                    "request handling failed"
                );
                vec![Message::no(e.to_string())]
            }
        };

        for reply in &replies {
            write_message(stream, reply).await?;
        }
    }
}

/// Pick the handler callback for one request.
pub fn dispatch<H>(handler: &H, from: &PublicKey, msg: &Message) -> Reply
where
    H: ProtocolHandler + ?Sized,
{
    tracing::trace!(peer = short_hex(from), kind = ?msg.kind, "dispatch");
    match msg.kind {
        MessageKind::Announce => handler.handle_announce(from, msg),
        MessageKind::Query => handler.handle_query(from, msg),
        MessageKind::FindClosest => handler.handle_find_closest(from, msg),
        MessageKind::Search => handler.handle_search(from, msg),
        MessageKind::Recent => handler.handle_recent(from, msg),
        MessageKind::Popular => handler.handle_popular(from, msg),
        MessageKind::HashList => handler.handle_hash_list(from, msg),
        MessageKind::Piece => handler.handle_piece(from, msg),
        MessageKind::AddPeer => handler.handle_add_peer(from, msg),
        MessageKind::Ping => handler.handle_ping(from, msg),
        other => Ok(vec![Message::no(format!("unexpected {other:?} on stream"))]),
    }
}
