//! Challenge/response handshake over a raw connection.
//!
//! Each side proves possession of its private key the same way:
//!
//!   prover   → Header(public key)
//!   verifier → Challenge(32 random bytes)
//!   prover   → Signature(sign(challenge))
//!   verifier → Ok | No(reason)
//!
//! The initiator proves first and then verifies the responder; the
//! responder verifies first and then proves. A failure on either side is
//! reported to the other with a `No`, so both ends fail together and no
//! half-authenticated connection survives.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use meridian_core::crypto::{self, short_hex, PublicKey};
use meridian_core::wire::{Preamble, CHALLENGE_SIZE};
use meridian_core::MessageKind;

use crate::message::{read_message, write_message, Message};
use crate::protocol::SessionHandler;
use crate::session::SessionError;

// ── Preamble ──────────────────────────────────────────────────────────────────

/// Write the identification preamble. Always the first bytes on a connection.
pub async fn write_preamble<W>(conn: &mut W) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let preamble = Preamble::current();
    tracing::trace!(
        magic = preamble.magic(),
        version = preamble.version(),
        "sending preamble"
    );
    conn.write_all(preamble.as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

/// Read and check the identification preamble.
pub async fn read_preamble<R>(conn: &mut R) -> Result<Preamble, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; std::mem::size_of::<Preamble>()];
    conn.read_exact(&mut buf).await?;
    let preamble = Preamble::read_from(&buf[..]).ok_or(SessionError::ShortFrame)?;
    preamble.check()?;
    Ok(preamble)
}

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Dialing side: prove ourselves, read the verdict, then verify the peer.
pub async fn initiate<S, H>(conn: &mut S, handler: &H) -> Result<PublicKey, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    H: SessionHandler + ?Sized,
{
    tracing::debug!("sending handshake");
    prove(conn, handler).await?;
    expect_ok(conn).await?;

    // The peer now knows who we are. Check that it is who it claims to be.
    let remote = verify_peer(conn, handler).await?;

    tracing::info!(peer = short_hex(&remote), "handshake complete (initiator)");
    Ok(remote)
}

/// Accepting side: verify the peer, then prove ourselves and read the verdict.
pub async fn respond<S, H>(conn: &mut S, handler: &H) -> Result<PublicKey, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    H: SessionHandler + ?Sized,
{
    let remote = verify_peer(conn, handler).await?;
    prove(conn, handler).await?;
    expect_ok(conn).await?;

    tracing::info!(peer = short_hex(&remote), "handshake complete (responder)");
    Ok(remote)
}

// ── Steps ─────────────────────────────────────────────────────────────────────

async fn prove<S, H>(conn: &mut S, handler: &H) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    H: SessionHandler + ?Sized,
{
    let header = Message::new(MessageKind::Header, handler.public_key().to_vec());
    write_message(conn, &header).await?;

    let challenge = expect(read_message(conn).await?, MessageKind::Challenge)?;
    if challenge.content.len() != CHALLENGE_SIZE {
        return Err(SessionError::Malformed(MessageKind::Challenge));
    }

    let signature = handler.sign(&challenge.content);
    write_message(conn, &Message::new(MessageKind::Signature, signature.to_vec())).await
}

async fn verify_peer<S, H>(conn: &mut S, handler: &H) -> Result<PublicKey, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    H: SessionHandler + ?Sized,
{
    let header = expect(read_message(conn).await?, MessageKind::Header)?;
    let remote: PublicKey = match header.content.as_ref().try_into() {
        Ok(key) => key,
        Err(_) => {
            reject(conn, "malformed header").await;
            return Err(SessionError::Malformed(MessageKind::Header));
        }
    };

    let challenge = crypto::generate_challenge();
    write_message(conn, &Message::new(MessageKind::Challenge, challenge.to_vec())).await?;

    let signature = expect(read_message(conn).await?, MessageKind::Signature)?;
    if let Err(e) = handler.verify(&remote, &challenge, &signature.content) {
        tracing::warn!(peer = short_hex(&remote), error = %e, "handshake signature rejected");
        reject(conn, "signature verification failed").await;
        return Err(SessionError::Verification(e));
    }

    if let Err(reason) = handler.accept_peer(&remote) {
        tracing::info!(peer = short_hex(&remote), %reason, "peer refused");
        reject(conn, &reason).await;
        return Err(SessionError::Refused(reason));
    }

    write_message(conn, &Message::ok()).await?;
    Ok(remote)
}

async fn expect_ok<S>(conn: &mut S) -> Result<(), SessionError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    expect(read_message(conn).await?, MessageKind::Ok).map(|_| ())
}

/// Turn a `No` into `Rejected` and anything other than `kind` into an error.
fn expect(msg: Message, kind: MessageKind) -> Result<Message, SessionError> {
    if let Some(reason) = msg.rejection() {
        return Err(SessionError::Rejected(reason));
    }
    if msg.kind != kind {
        return Err(SessionError::Unexpected {
            expected: kind,
            got: msg.kind,
        });
    }
    Ok(msg)
}

/// Best-effort rejection; the connection is abandoned either way.
async fn reject<W>(conn: &mut W, reason: &str)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = write_message(conn, &Message::no(reason)).await {
        tracing::debug!(error = %e, "failed to send handshake rejection");
    }
}
