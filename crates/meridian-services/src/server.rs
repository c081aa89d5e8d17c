//! Inbound connection listener.
//!
//! Each accepted TCP connection gets its own `SessionManager` and task:
//! handshake as responder, multiplex as server, then one task per
//! peer-opened stream running the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use meridian_core::crypto::short_hex;

use crate::dispatch::serve_stream;
use crate::protocol::{ProtocolHandler, SessionHandler};
use crate::session::{SessionError, SessionManager};

pub struct Server<H> {
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: broadcast::Receiver<()>,
}

impl<H> Server<H>
where
    H: ProtocolHandler + 'static,
{
    pub async fn bind(
        address: &str,
        handler: Arc<H>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        Ok(Self {
            listener,
            handler,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "listening for peers");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (tcp, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(tcp, handler).await {
                            tracing::debug!(
                                peer = %peer_addr,
                                error = %e,
                                "connection ended with error"
                            );
                        }
                    });
                }
            }
        }
    }
}

/// Responder flow for one inbound connection. Returns once the peer is gone.
pub async fn serve_connection<H>(tcp: TcpStream, handler: Arc<H>) -> Result<(), SessionError>
where
    H: ProtocolHandler + 'static,
{
    let session_handler: Arc<dyn SessionHandler> = handler.clone();
    let manager = Arc::new(SessionManager::new(session_handler));

    let header = manager.accept(tcp).await?;
    let session = match manager.become_multiplex_server().await {
        Ok(s) => s,
        Err(e) => {
            manager.close().await;
            return Err(e);
        }
    };

    while let Some(stream) = session.accept_stream().await {
        let id = stream.id();
        let shared = manager.add_stream(stream);
        let manager = Arc::clone(&manager);
        let handler = Arc::clone(&handler);
        let remote = header.remote_key;

        tokio::spawn(async move {
            // Held until the stream ends; other handles wait in `lock()`.
            let mut stream = shared.lock().await;
            if let Err(e) = serve_stream(&mut *stream, &remote, handler.as_ref()).await {
                tracing::debug!(
                    peer = short_hex(&remote),
                    stream_id = id,
                    error = %e,
                    "stream failed"
                );
            }
            let _ = stream.shutdown().await;
            drop(stream);
            manager.remove_stream(id);
        });
    }

    manager.close().await;
    Ok(())
}
