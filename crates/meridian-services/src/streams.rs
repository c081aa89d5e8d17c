//! Logical streams and the tracked-stream table.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

/// Multiplexer-assigned stream id.
pub type StreamId = u32;

/// One bidirectional byte channel inside a session.
pub struct LogicalStream {
    id: StreamId,
    io: Compat<yamux::Stream>,
}

impl LogicalStream {
    pub(crate) fn new(stream: yamux::Stream) -> Self {
        Self {
            id: stream.id().val(),
            io: stream.compat(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream").field("id", &self.id).finish()
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// A tracked stream, shared between the table and the task serving it.
pub type SharedStream = Arc<tokio::sync::Mutex<LogicalStream>>;

/// Peer-initiated streams of one session, keyed by stream id.
///
/// Streams we open ourselves are handed straight to the caller and never
/// land here.
#[derive(Clone, Default)]
pub struct StreamTable {
    streams: Arc<DashMap<StreamId, SharedStream>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a stream. A stream already tracked under the same id is replaced.
    pub fn add(&self, stream: LogicalStream) -> SharedStream {
        let id = stream.id();
        let shared = Arc::new(tokio::sync::Mutex::new(stream));
        self.streams.insert(id, Arc::clone(&shared));
        tracing::trace!(stream_id = id, "stream tracked");
        shared
    }

    pub fn get(&self, id: StreamId) -> Option<SharedStream> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stop tracking `id`. Absent ids are ignored.
    pub fn remove(&self, id: StreamId) -> Option<SharedStream> {
        self.streams.remove(&id).map(|(_, stream)| stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&self) {
        self.streams.clear();
    }
}
