use std::sync::Arc;

use common_net::message::ConnectionState;
use registry::{MemoryStore, NewSession, PeerClaim, SignalStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reconnects_on_one_token_reuse_the_slot_once() {
    for _ in 0..25 {
        let store = Arc::new(MemoryStore::new());
        let session = store
            .create_session(NewSession {
                initiator_id: 9,
                ..Default::default()
            })
            .await
            .unwrap();
        let claim = PeerClaim {
            session_id: session.id,
            user_id: 9,
            username: "bo".into(),
            client_peer_id: Some("shared-token".into()),
        };

        let original = store.create_or_reuse_peer(claim.clone()).await.unwrap().peer;
        store
            .set_state(original.id, original.connection_id, ConnectionState::Disconnected)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let claim = claim.clone();
            tasks.push(tokio::spawn(async move {
                store.create_or_reuse_peer(claim).await
            }));
        }

        let mut reused = 0;
        for task in tasks {
            let slot = task.await.unwrap().unwrap();
            if slot.reconnected {
                reused += 1;
                assert_eq!(slot.peer.id, original.id);
                assert_eq!(slot.replaced_connection, Some(original.connection_id));
            } else {
                assert_ne!(slot.peer.id, original.id);
            }
        }
        assert_eq!(reused, 1);
        assert_eq!(store.peer_count(), 8);

        let row = store.get_peer(original.id).await.unwrap();
        assert_eq!(row.state, ConnectionState::Connecting);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnected_peer_only_returns_through_reconnect() {
    let store = MemoryStore::new();
    let session = store
        .create_session(NewSession {
            initiator_id: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let claim = PeerClaim {
        session_id: session.id,
        user_id: 1,
        username: "ana".into(),
        client_peer_id: Some("t".into()),
    };
    let peer = store.create_or_reuse_peer(claim.clone()).await.unwrap().peer;
    let conn = peer.connection_id;
    store
        .set_state(peer.id, conn, ConnectionState::Disconnected)
        .await
        .unwrap();

    // neither a direct jump nor a self-service detour through connecting
    assert!(store
        .set_state(peer.id, conn, ConnectionState::Connected)
        .await
        .is_err());
    assert!(store
        .set_state(peer.id, conn, ConnectionState::Connecting)
        .await
        .is_err());

    let slot = store.create_or_reuse_peer(claim).await.unwrap();
    assert!(slot.reconnected);
    let peer = store
        .set_state(peer.id, slot.peer.connection_id, ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(peer.state, ConnectionState::Connected);
}
