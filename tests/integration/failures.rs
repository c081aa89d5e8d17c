use crate::*;

use meridian_services::{mirror, MirrorError, MirrorProgress, SessionError};

/// A node that refuses us reports its reason and leaves nothing half-open.
#[tokio::test]
async fn test_refused_peer_sees_reason() {
    let node = spawn_node(Arc::new(Gatekeeper(Identity::generate()))).await;
    let manager = client();

    match manager.connect(&node.address).await {
        Err(SessionError::Rejected(reason)) => assert_eq!(reason, "closed for maintenance"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(manager.header().is_none());
    assert!(matches!(
        manager.become_multiplex_client().await,
        Err(SessionError::NotConnected)
    ));
}

/// Something that is not a Meridian node on the other end.
#[tokio::test]
async fn test_wrong_protocol_fails_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let _ = tcp.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
    });

    let manager = client();
    let err = manager.connect(&address).await.unwrap_err();
    assert!(
        matches!(err, SessionError::Wire(_) | SessionError::Io(_)),
        "unexpected error: {err}"
    );
    assert!(manager.header().is_none());
}

/// Nobody listening: a connect error, for direct and proxied dials alike.
#[tokio::test]
async fn test_unreachable_peer() {
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().to_string()
    };

    let direct = client();
    assert!(matches!(
        direct.connect(&dead).await,
        Err(SessionError::Connect { .. })
    ));

    let proxy_port = spawn_socks5().await;
    let proxied = client().with_socks(Some(proxy_port));
    assert!(matches!(
        proxied.connect(&dead).await,
        Err(SessionError::Connect { .. })
    ));

    let progress = MirrorProgress::new();
    assert!(matches!(
        mirror(&direct, &dead, &progress, 1).await,
        Err(MirrorError::Session(SessionError::Connect { .. }))
    ));
    assert!(progress.is_empty());
}

/// A node that does not serve catalogs answers `No` to a mirror.
#[tokio::test]
async fn test_mirror_unsupported_by_peer() {
    struct Plain(Identity);

    impl Signer for Plain {
        fn public_key(&self) -> PublicKey {
            self.0.public
        }

        fn sign(&self, message: &[u8]) -> SignatureBytes {
            self.0.sign(message)
        }
    }

    impl SessionHandler for Plain {
        fn on_close(&self, _remote: &PublicKey) {}
    }

    impl ProtocolHandler for Plain {}

    let node = spawn_node(Arc::new(Plain(Identity::generate()))).await;
    let manager = client();
    let err = mirror(&manager, &node.address, &MirrorProgress::new(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Rejected(ref r) if r.contains("unsupported")));
    manager.close().await;
}
