//! Meridian integration test harness.
//!
//! Every test runs in-process over loopback TCP: a node is a `Server`
//! serving a `CatalogService`, a client is a `SessionManager` dialing it.
//! Nothing needs root or external processes.
//!
//!   cargo test --test integration

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use meridian_core::crypto::{Identity, PublicKey, SignatureBytes};
use meridian_core::{Collection, MessageKind, Record, PIECE_SIZE};
use meridian_services::catalog::demo_records;
use meridian_services::protocol::Reply;
use meridian_services::{
    CatalogService, Message, PieceRequest, ProtocolHandler, Server, SessionHandler,
    SessionManager, Signer,
};

mod failures;
mod mirroring;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A running node. Dropping it stops the listener.
pub struct Node<H> {
    pub address: String,
    pub handler: Arc<H>,
    shutdown: broadcast::Sender<()>,
}

impl<H> Drop for Node<H> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Start a node serving `handler` on an ephemeral loopback port.
pub async fn spawn_node<H: ProtocolHandler + 'static>(handler: Arc<H>) -> Node<H> {
    let (shutdown, rx) = broadcast::channel(1);
    let server = Server::bind("127.0.0.1:0", Arc::clone(&handler), rx)
        .await
        .expect("bind");
    let address = server.local_addr().expect("local addr").to_string();
    tokio::spawn(server.run());
    Node {
        address,
        handler,
        shutdown,
    }
}

/// A catalog of `records` demo records with the standard piece size.
pub fn catalog(records: u64) -> Arc<CatalogService> {
    let collection = Collection::from_records(demo_records(records), PIECE_SIZE).expect("catalog");
    Arc::new(CatalogService::with_collection(
        Arc::new(Identity::generate()),
        collection,
    ))
}

/// A client-side manager with a fresh identity and an empty catalog.
pub fn client() -> SessionManager {
    SessionManager::new(catalog(0))
}

// ── Misbehaving handlers ──────────────────────────────────────────────────────

/// Serves a real catalog but alters one record of one piece in transit.
pub struct Corrupting {
    pub inner: Arc<CatalogService>,
    /// Piece holding the altered record.
    pub piece: u64,
    /// Index of the altered record inside that piece.
    pub record: usize,
    /// How many more times the piece is sent altered.
    remaining: AtomicUsize,
    /// `start` of every piece request served, in order.
    served: Mutex<Vec<u64>>,
}

impl Corrupting {
    pub fn new(inner: Arc<CatalogService>, piece: u64, record: usize, times: usize) -> Self {
        Self {
            inner,
            piece,
            record,
            remaining: AtomicUsize::new(times),
            served: Mutex::new(Vec::new()),
        }
    }

    pub fn served(&self) -> Vec<u64> {
        self.served.lock().unwrap().clone()
    }
}

impl Signer for Corrupting {
    fn public_key(&self) -> PublicKey {
        self.inner.public_key()
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.inner.sign(message)
    }
}

impl SessionHandler for Corrupting {
    fn on_close(&self, remote: &PublicKey) {
        self.inner.on_close(remote)
    }
}

impl ProtocolHandler for Corrupting {
    fn handle_hash_list(&self, from: &PublicKey, msg: &Message) -> Reply {
        self.inner.handle_hash_list(from, msg)
    }

    fn handle_piece(&self, from: &PublicKey, msg: &Message) -> Reply {
        let request: PieceRequest = msg.decode()?;
        self.served.lock().unwrap().push(request.start);

        let mut replies = self.inner.handle_piece(from, msg)?;
        let covered = request.start <= self.piece && self.piece - request.start < request.count;
        if !covered {
            return Ok(replies);
        }
        let offset = (self.piece - request.start) as usize * PIECE_SIZE + self.record;
        let Some(reply) = replies.get_mut(offset) else {
            return Ok(replies);
        };
        if reply.kind != MessageKind::Post {
            return Ok(replies);
        }
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            let mut record = Record::from_canonical_bytes(&reply.content)?;
            record.title.push_str(" (tampered)");
            *reply = Message::new(MessageKind::Post, record.canonical_bytes()?);
        }
        Ok(replies)
    }
}

/// Refuses every peer at the end of the handshake.
pub struct Gatekeeper(pub Identity);

impl Signer for Gatekeeper {
    fn public_key(&self) -> PublicKey {
        self.0.public
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.0.sign(message)
    }
}

impl SessionHandler for Gatekeeper {
    fn accept_peer(&self, _remote: &PublicKey) -> Result<(), String> {
        Err("closed for maintenance".into())
    }

    fn on_close(&self, _remote: &PublicKey) {}
}

impl ProtocolHandler for Gatekeeper {}

// ── SOCKS5 proxy ──────────────────────────────────────────────────────────────

/// Start a minimal SOCKS5 proxy (no auth, CONNECT) and return its port.
pub async fn spawn_socks5() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind proxy");
    let port = listener.local_addr().expect("proxy addr").port();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(relay(client));
        }
    });
    port
}

async fn relay(mut client: TcpStream) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => return Err(io::Error::other("unsupported address type")),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;

    let mut upstream = TcpStream::connect(format!("{host}:{}", u16::from_be_bytes(port))).await?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}
