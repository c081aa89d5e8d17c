use crate::*;

use bytes::Bytes;
use meridian_services::message::{read_message, write_message};
use meridian_services::{NetworkPeer, Role, SessionError};

/// Dialing a node authenticates both ends to each other's real keys.
#[tokio::test]
async fn test_handshake_symmetry() {
    let node = spawn_node(catalog(0)).await;
    let client_catalog = catalog(0);
    let manager = SessionManager::new(client_catalog.clone());

    let header = manager.connect(&node.address).await.unwrap();
    assert_eq!(header.remote_key, node.handler.public_key());
    assert_eq!(header.address, node.address);
    assert_eq!(NetworkPeer::public_key(&manager), Some(node.handler.public_key()));

    manager.close().await;
}

/// One session carries many concurrent request/response streams.
#[tokio::test]
async fn test_concurrent_streams_on_one_session() {
    let node = spawn_node(catalog(0)).await;
    let manager = Arc::new(client());
    manager.connect(&node.address).await.unwrap();
    manager.become_multiplex_client().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let mut stream = manager.open_stream().await.unwrap();
            for _ in 0..4 {
                write_message(&mut stream, &Message::new(MessageKind::Ping, Bytes::new()))
                    .await
                    .unwrap();
                let pong = read_message(&mut stream).await.unwrap();
                assert_eq!(pong.kind, MessageKind::Pong);
            }
            stream.shutdown().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    manager.close().await;
}

/// The dialing side cannot turn around and act as multiplex server.
#[tokio::test]
async fn test_role_conflict_leaves_session_intact() {
    let node = spawn_node(catalog(0)).await;
    let manager = client();
    manager.connect(&node.address).await.unwrap();

    let session = manager.become_multiplex_client().await.unwrap();
    assert!(matches!(
        manager.become_multiplex_server().await,
        Err(SessionError::RoleConflict(Role::Client))
    ));
    assert!(manager.session().unwrap().same_session(&session));

    // Still usable.
    let mut stream = manager.open_stream().await.unwrap();
    write_message(&mut stream, &Message::new(MessageKind::Ping, Bytes::new()))
        .await
        .unwrap();
    assert_eq!(read_message(&mut stream).await.unwrap().kind, MessageKind::Pong);

    manager.close().await;
}

/// Close twice, and close on a manager that never connected.
#[tokio::test]
async fn test_close_idempotent() {
    let node = spawn_node(catalog(0)).await;
    let manager = client();
    manager.connect(&node.address).await.unwrap();
    let session = manager.become_multiplex_client().await.unwrap();

    manager.close().await;
    manager.close().await;
    assert!(session.is_closed());
    assert!(matches!(
        manager.open_stream().await,
        Err(SessionError::NoSession)
    ));

    let idle = client();
    idle.close().await;
    idle.close().await;
    assert!(idle.header().is_none());
}

/// A closed manager can connect again from scratch.
#[tokio::test]
async fn test_reconnect_after_close() {
    let node = spawn_node(catalog(0)).await;
    let manager = client();

    manager.connect(&node.address).await.unwrap();
    manager.close().await;

    let header = manager.connect(&node.address).await.unwrap();
    assert_eq!(header.remote_key, node.handler.public_key());
    manager.become_multiplex_client().await.unwrap();
    manager.close().await;
}
