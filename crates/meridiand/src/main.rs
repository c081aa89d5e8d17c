//! meridiand: Meridian peer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use meridian_core::config::MeridianConfig;
use meridian_core::crypto::{short_hex, Identity};
use meridian_services::catalog::demo_records;
use meridian_services::{
    resume_mirror, CatalogService, MirrorError, MirrorProgress, PartialMirror, Server,
    SessionHandler, SessionManager,
};

/// Attempts per peer at startup. Each retry resumes at the piece that failed.
const MIRROR_ATTEMPTS: usize = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeridianConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeridianConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeridianConfig::default()
    });

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.network.listen_addr.clone());
    tracing::info!(listen_addr, socks = config.network.socks, "meridiand starting");

    // Identity
    let identity = Arc::new(
        Identity::load_or_generate(&config.identity.keypair_path)
            .context("failed to load identity")?,
    );
    tracing::info!(public_key = hex::encode(identity.public), "identity ready");

    // Catalog
    let catalog = Arc::new(CatalogService::new(identity.clone()));
    for record in demo_records(config.catalog.seed_records) {
        catalog.add_record(record).context("failed to seed catalog")?;
    }
    tracing::info!(
        records = catalog.len(),
        root = short_hex(&catalog.snapshot().root()),
        "catalog ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server = Server::bind(&listen_addr, catalog.clone(), shutdown_tx.subscribe()).await?;
    let server_task = tokio::spawn(server.run());

    let progress = MirrorProgress::new();

    for peer in config.mirror.peers.clone() {
        let handler: Arc<dyn SessionHandler> = catalog.clone();
        let manager = SessionManager::new(handler).with_socks(config.socks_port());
        let progress = progress.clone();
        let buffer = config.mirror.progress_buffer;

        tokio::spawn(async move {
            let mut partial = PartialMirror::new();
            for attempt in 1..=MIRROR_ATTEMPTS {
                match resume_mirror(&manager, &peer, &progress, buffer, &mut partial).await {
                    Ok(collection) => {
                        tracing::info!(
                            peer = %peer,
                            records = collection.len(),
                            pieces = collection.pieces().len(),
                            root = short_hex(&collection.root()),
                            "mirrored catalog"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            peer = %peer,
                            attempt,
                            resume_at = partial.next_piece(),
                            error = %e,
                            "mirror failed"
                        );
                        // A bad piece leaves the session usable; anything else reconnects.
                        if !matches!(e, MirrorError::PieceMismatch { .. }) {
                            manager.close().await;
                        }
                    }
                }
            }
            manager.close().await;
        });
    }

    let progress_printer = {
        let progress = progress.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                for (peer, pieces) in progress.snapshot() {
                    tracing::info!(peer = %peer, pieces, "mirror progress");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = server_task          => tracing::error!("server task exited: {:?}", r),
        r = progress_printer     => tracing::error!("progress printer exited: {:?}", r),
    }

    Ok(())
}
