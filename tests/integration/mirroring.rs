use crate::*;

use meridian_services::{mirror, resume_mirror, MirrorError, MirrorProgress, PartialMirror};

/// 2,500 records mirror as three verified pieces of 1000, 1000 and 500.
#[tokio::test]
async fn test_mirror_2500_records() {
    let node = spawn_node(catalog(2500)).await;
    let declared = node.handler.snapshot().hash_list();

    let manager = client();
    let progress = MirrorProgress::new();
    let mirrored = mirror(&manager, &node.address, &progress, 2).await.unwrap();

    assert_eq!(mirrored.len(), 2500);
    let sizes: Vec<usize> = mirrored.pieces().iter().map(|p| p.len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    assert_eq!(mirrored.hash_list(), declared);
    assert_eq!(mirrored.root(), node.handler.snapshot().root());

    // Rebuilt from scratch, every piece still matches what the source declared.
    let rehashed: Vec<_> = mirrored
        .pieces()
        .iter()
        .cloned()
        .map(|mut piece| piece.rehash().unwrap())
        .collect();
    assert_eq!(rehashed, declared);

    assert_eq!(progress.get(&node.address), Some(3));
    manager.close().await;
}

/// One altered record fails its piece and nothing is accepted silently.
#[tokio::test]
async fn test_corrupted_record_fails_verification() {
    let handler = Arc::new(Corrupting::new(catalog(2500), 1, 500, usize::MAX));
    let node = spawn_node(handler).await;

    let manager = client();
    let progress = MirrorProgress::new();
    let err = mirror(&manager, &node.address, &progress, 4).await.unwrap_err();

    assert!(
        matches!(err, MirrorError::PieceMismatch { piece: 1 }),
        "unexpected error: {err}"
    );
    // Piece 0 verified before the bad one arrived, and piece 2 was never asked for.
    assert_eq!(progress.get(&node.address), Some(1));
    assert_eq!(node.handler.served(), vec![0, 1]);
    manager.close().await;
}

/// A retry after a bad piece starts at that piece, not at the beginning.
#[tokio::test]
async fn test_corrupted_piece_retried_from_its_index() {
    let handler = Arc::new(Corrupting::new(catalog(2500), 1, 10, 1));
    let node = spawn_node(handler).await;
    let declared = node.handler.inner.snapshot().hash_list();

    let manager = client();
    let progress = MirrorProgress::new();
    let mut partial = PartialMirror::new();

    let err = resume_mirror(&manager, &node.address, &progress, 2, &mut partial)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::PieceMismatch { piece: 1 }));
    assert_eq!(partial.next_piece(), 1);
    assert_eq!(progress.get(&node.address), Some(partial.next_piece()));

    let mirrored = resume_mirror(&manager, &node.address, &progress, 2, &mut partial)
        .await
        .unwrap();
    assert_eq!(mirrored.len(), 2500);
    assert_eq!(mirrored.hash_list(), declared);
    assert_eq!(progress.get(&node.address), Some(3));
    assert!(partial.pieces().is_empty());

    // Piece 0 was served once; piece 1 twice.
    assert_eq!(node.handler.served(), vec![0, 1, 1, 2]);
    manager.close().await;
}

/// Mirroring through a SOCKS5 proxy behaves like a direct dial.
#[tokio::test]
async fn test_mirror_through_socks() {
    let node = spawn_node(catalog(1200)).await;
    let proxy_port = spawn_socks5().await;

    let manager = client().with_socks(Some(proxy_port));
    let progress = MirrorProgress::new();
    let mirrored = mirror(&manager, &node.address, &progress, 1).await.unwrap();

    assert_eq!(mirrored.len(), 1200);
    assert_eq!(mirrored.hash_list(), node.handler.snapshot().hash_list());
    assert_eq!(manager.remote_key(), Some(node.handler.public_key()));
    manager.close().await;
}

/// An empty catalog mirrors to an empty collection.
#[tokio::test]
async fn test_mirror_empty_catalog() {
    let node = spawn_node(catalog(0)).await;
    let manager = client();
    let progress = MirrorProgress::new();

    let mirrored = mirror(&manager, &node.address, &progress, 1).await.unwrap();
    assert!(mirrored.is_empty());
    assert_eq!(progress.get(&node.address), None);
    manager.close().await;
}

/// Several peers mirrored concurrently report progress independently.
#[tokio::test]
async fn test_concurrent_mirrors_share_progress() {
    let a = spawn_node(catalog(2100)).await;
    let b = spawn_node(catalog(900)).await;
    let progress = MirrorProgress::new();

    let run = |address: String, progress: MirrorProgress| async move {
        let manager = client();
        let result = mirror(&manager, &address, &progress, 1).await;
        manager.close().await;
        result
    };

    let (ra, rb) = tokio::join!(
        run(a.address.clone(), progress.clone()),
        run(b.address.clone(), progress.clone())
    );
    assert_eq!(ra.unwrap().len(), 2100);
    assert_eq!(rb.unwrap().len(), 900);
    assert_eq!(progress.get(&a.address), Some(3));
    assert_eq!(progress.get(&b.address), Some(1));
}
