//! Session management: one transport connection from dial to teardown.
//!
//! A `SessionManager` owns at most one TCP connection. `connect` (or
//! `accept` on the listening side) authenticates it; one of the
//! `become_multiplex_*` calls then hands the socket to a yamux driver task
//! and returns a `Session` handle used to open and accept logical streams.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::future::poll_fn;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::TokioAsyncReadCompatExt;

use meridian_core::crypto::{short_hex, CryptoError, PublicKey};
use meridian_core::wire::WireError;
use meridian_core::MessageKind;

use crate::handshake;
use crate::protocol::{NetworkPeer, SessionHandler};
use crate::proxy::SocksDialer;
use crate::streams::{LogicalStream, SharedStream, StreamId, StreamTable};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    /// Dial failure, direct or through the proxy.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("frame header truncated")]
    ShortFrame,

    /// The peer answered our proof with `No`.
    #[error("peer rejected handshake: {0}")]
    Rejected(String),

    /// We refused an authenticated peer.
    #[error("refused peer: {0}")]
    Refused(String),

    #[error("peer failed verification: {0}")]
    Verification(#[source] CryptoError),

    #[error("expected {expected:?} message, got {got:?}")]
    Unexpected {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("malformed {0:?} message")]
    Malformed(MessageKind),

    #[error("not connected")]
    NotConnected,

    #[error("connection already established")]
    AlreadyConnected,

    #[error("a {0} session is already active on this connection")]
    RoleConflict(Role),

    #[error("no session")]
    NoSession,

    #[error("multiplexer: {0}")]
    Mux(#[from] yamux::ConnectionError),

    #[error("session closed")]
    SessionClosed,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Which end of the multiplexer this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn mode(self) -> yamux::Mode {
        match self {
            Role::Client => yamux::Mode::Client,
            Role::Server => yamux::Mode::Server,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("multiplex-client"),
            Role::Server => f.write_str("multiplex-server"),
        }
    }
}

enum Command {
    Open(oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a multiplexed session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    role: Role,
    commands: mpsc::Sender<Command>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<yamux::Stream>>>,
}

impl Session {
    /// Start multiplexing over `io`. The returned handle stays valid until
    /// `close` is called, every handle is dropped, or the peer goes away.
    pub fn spawn<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), role.mode());
        let (commands, command_rx) = mpsc::channel(32);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(
            Driver {
                connection,
                commands: command_rx,
                inbound: inbound_tx,
                opening: VecDeque::new(),
                closing: None,
            },
            role,
        ));

        Self {
            role,
            commands,
            inbound: Arc::new(Mutex::new(inbound_rx)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<LogicalStream, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Open(tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        let stream = rx.await.map_err(|_| SessionError::SessionClosed)??;
        tracing::trace!(stream_id = stream.id().val(), role = %self.role, "stream opened");
        Ok(LogicalStream::new(stream))
    }

    /// Wait for the peer to open a stream. `None` once the session is over.
    pub async fn accept_stream(&self) -> Option<LogicalStream> {
        let stream = self.inbound.lock().await.recv().await?;
        Some(LogicalStream::new(stream))
    }

    /// Close the session and wait for the driver to finish.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_ok() {
            // A dropped reply means the driver already exited.
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// True if both handles refer to the same session.
    pub fn same_session(&self, other: &Session) -> bool {
        self.commands.same_channel(&other.commands)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns the yamux connection. yamux only makes progress while polled, so
/// every open, accept and close goes through this one task.
struct Driver<T> {
    connection: yamux::Connection<T>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::UnboundedSender<yamux::Stream>,
    opening: VecDeque<oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>>,
    closing: Option<Vec<oneshot::Sender<()>>>,
}

impl<T> Driver<T>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), yamux::ConnectionError>> {
        loop {
            while let Poll::Ready(command) = self.commands.poll_recv(cx) {
                match command {
                    Some(Command::Open(reply)) => self.opening.push_back(reply),
                    Some(Command::Close(reply)) => {
                        self.closing.get_or_insert_with(Vec::new).push(reply)
                    }
                    None => {
                        // Every handle is gone.
                        self.closing.get_or_insert_with(Vec::new);
                        break;
                    }
                }
            }

            if self.closing.is_some() {
                return self.connection.poll_close(cx);
            }

            while !self.opening.is_empty() {
                match self.connection.poll_new_outbound(cx) {
                    Poll::Ready(result) => {
                        if let Some(reply) = self.opening.pop_front() {
                            let _ = reply.send(result);
                        }
                    }
                    Poll::Pending => break,
                }
            }

            match self.connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if self.inbound.send(stream).is_err() {
                        tracing::trace!("inbound stream dropped, nobody accepting");
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

async fn drive<T>(mut driver: Driver<T>, role: Role)
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    match poll_fn(|cx| driver.poll(cx)).await {
        Ok(()) => tracing::debug!(%role, "session closed"),
        Err(e) => tracing::debug!(%role, error = %e, "session ended"),
    }

    let Driver {
        commands, closing, ..
    } = driver;
    // Handles must observe `is_closed` before any `close` caller returns.
    drop(commands);
    for reply in closing.into_iter().flatten() {
        let _ = reply.send(());
    }
}

// ── SessionManager ────────────────────────────────────────────────────────────

/// An authenticated connection: where it goes and who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub address: String,
    pub remote_key: PublicKey,
}

/// Lifecycle of one peer connection: dial or accept, handshake, multiplex,
/// track peer-opened streams, tear down.
pub struct SessionManager {
    handler: Arc<dyn SessionHandler>,
    socks_port: Option<u16>,
    dialer: OnceLock<SocksDialer>,
    /// Raw socket, present between the handshake and multiplexing.
    /// Locked for the whole of `connect`/`accept` so they never race.
    transport: Mutex<Option<TcpStream>>,
    header: RwLock<Option<ConnectionHeader>>,
    session: RwLock<Option<Session>>,
    streams: StreamTable,
}

impl SessionManager {
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            handler,
            socks_port: None,
            dialer: OnceLock::new(),
            transport: Mutex::new(None),
            header: RwLock::new(None),
            session: RwLock::new(None),
            streams: StreamTable::new(),
        }
    }

    /// Route outbound dials through the SOCKS5 proxy at `127.0.0.1:port`.
    pub fn with_socks(mut self, port: Option<u16>) -> Self {
        self.socks_port = port;
        self
    }

    /// Dial `address` and authenticate. Returns the existing header if this
    /// manager is already connected.
    pub async fn connect(&self, address: &str) -> Result<ConnectionHeader, SessionError> {
        let mut transport = self.transport.lock().await;
        if let Some(existing) = self.header() {
            return Ok(existing);
        }

        let mut stream = self.dial(address).await?;
        handshake::write_preamble(&mut stream).await?;
        let remote_key = handshake::initiate(&mut stream, self.handler.as_ref()).await?;

        let header = ConnectionHeader {
            address: address.to_string(),
            remote_key,
        };
        *transport = Some(stream);
        *self.header.write().unwrap_or_else(PoisonError::into_inner) = Some(header.clone());

        tracing::info!(peer = %address, public_key = short_hex(&remote_key), "connected");
        Ok(header)
    }

    /// Authenticate an inbound connection.
    pub async fn accept(&self, mut stream: TcpStream) -> Result<ConnectionHeader, SessionError> {
        let mut transport = self.transport.lock().await;
        if self.header().is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        handshake::read_preamble(&mut stream).await?;
        let remote_key = handshake::respond(&mut stream, self.handler.as_ref()).await?;

        let header = ConnectionHeader {
            address,
            remote_key,
        };
        *transport = Some(stream);
        *self.header.write().unwrap_or_else(PoisonError::into_inner) = Some(header.clone());

        tracing::info!(peer = %header.address, public_key = short_hex(&remote_key), "accepted");
        Ok(header)
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, SessionError> {
        let result = match self.socks_port {
            Some(port) => {
                self.dialer
                    .get_or_init(|| SocksDialer::local(port))
                    .dial(address)
                    .await
            }
            None => TcpStream::connect(address).await,
        };
        result.map_err(|source| SessionError::Connect {
            address: address.to_string(),
            source,
        })
    }

    pub async fn become_multiplex_client(&self) -> Result<Session, SessionError> {
        self.negotiate(Role::Client).await
    }

    pub async fn become_multiplex_server(&self) -> Result<Session, SessionError> {
        self.negotiate(Role::Server).await
    }

    async fn negotiate(&self, role: Role) -> Result<Session, SessionError> {
        let mut transport = self.transport.lock().await;

        if let Some(existing) = self.session() {
            if existing.role() == role {
                return Ok(existing);
            }
            return Err(SessionError::RoleConflict(existing.role()));
        }

        let stream = transport.take().ok_or(SessionError::NotConnected)?;
        let session = Session::spawn(stream, role);
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        tracing::debug!(
            peer = %self.address().unwrap_or_default(),
            %role,
            "session negotiated"
        );
        Ok(session)
    }

    /// Open a stream for a request of our own. Not tracked.
    pub async fn open_stream(&self) -> Result<LogicalStream, SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        session.open_stream().await
    }

    /// Wait for the next peer-opened stream. `Ok(None)` once the session ends.
    pub async fn accept_stream(&self) -> Result<Option<LogicalStream>, SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        Ok(session.accept_stream().await)
    }

    /// Track a peer-opened stream.
    pub fn add_stream(&self, stream: LogicalStream) -> SharedStream {
        self.streams.add(stream)
    }

    /// Look up a tracked stream.
    ///
    /// The task serving a stream holds its lock until the stream ends, so a
    /// handle taken from here while the stream is live waits in `lock()`
    /// until then. Use `try_lock` to check without waiting.
    pub fn get_stream(&self, id: StreamId) -> Option<SharedStream> {
        self.streams.get(id)
    }

    /// Stop tracking a stream. Untracked ids are ignored.
    pub fn remove_stream(&self, id: StreamId) {
        if self.streams.remove(id).is_some() {
            tracing::trace!(stream_id = id, "stream untracked");
        }
    }

    pub fn tracked_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn header(&self) -> Option<ConnectionHeader> {
        self.header
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remote_key(&self) -> Option<PublicKey> {
        self.header().map(|h| h.remote_key)
    }

    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.session().map(|s| s.role())
    }

    /// Tear down the session, then the socket. Each step runs regardless of
    /// the other; calling again, or before connecting, does nothing.
    pub async fn close(&self) {
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.close().await;
        }

        let stream = self.transport.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "transport shutdown failed");
            }
        }

        self.streams.clear();

        let header = self
            .header
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(header) = header {
            tracing::info!(peer = %header.address, "connection closed");
            self.handler.on_close(&header.remote_key);
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("header", &self.header())
            .field("role", &self.role())
            .field("socks_port", &self.socks_port)
            .field("tracked_streams", &self.streams.len())
            .finish()
    }
}

impl NetworkPeer for SessionManager {
    fn session(&self) -> Option<Session> {
        SessionManager::session(self)
    }

    fn add_stream(&self, stream: LogicalStream) -> SharedStream {
        SessionManager::add_stream(self, stream)
    }

    fn public_key(&self) -> Option<PublicKey> {
        self.remote_key()
    }

    fn address(&self) -> Option<String> {
        self.header().map(|h| h.address)
    }
}
