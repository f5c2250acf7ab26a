use std::{net::SocketAddr, sync::Arc, time::Duration};

use common_net::{fabric::LocalFabric, message::ConnectionState, telemetry};
use futures::{SinkExt, StreamExt};
use gateway::{
    access::StaticAccessPolicy,
    auth::{AuthService, DEFAULT_JWT_ISSUER},
    ice::{IceIssuer, TurnSettings},
    relay::RelayDeps,
};
use registry::{MemoryStore, NewSession, ResourceRef, SignalStore, SignalType};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

type BoxError = common_net::BoxError;
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    addr: SocketAddr,
    auth: AuthService,
    store: Arc<MemoryStore>,
    access: Arc<StaticAccessPolicy>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl TestGateway {
    fn token(&self, user_id: i64, username: &str) -> String {
        self.auth
            .generate_token(user_id, username, chrono::Duration::minutes(5))
            .unwrap()
    }

    async fn session(&self, initiator_id: i64, linked: Vec<ResourceRef>) -> Uuid {
        self.store
            .create_session(NewSession {
                initiator_id,
                linked_resources: linked,
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn open(
        &self,
        session_id: impl std::fmt::Display,
        token: Option<&str>,
        client_peer_id: Option<&str>,
    ) -> Result<Socket, BoxError> {
        let mut url = format!("ws://{}/communications/webrtc/{session_id}?", self.addr);
        if let Some(token) = token {
            url.push_str(&format!("token={token}&"));
        }
        if let Some(id) = client_peer_id {
            url.push_str(&format!("client_peer_id={id}"));
        }
        let (socket, _) = connect_async(url).await?;
        Ok(socket)
    }

    async fn open_default(&self, resource: &ResourceRef, query: &str) -> Result<Socket, BoxError> {
        let url = format!(
            "ws://{}/communications/webrtc/default/{}/{}?{query}",
            self.addr, resource.kind, resource.id
        );
        let (socket, _) = connect_async(url).await?;
        Ok(socket)
    }
}

async fn spawn_gateway() -> Result<TestGateway, BoxError> {
    telemetry::init("gateway-test");

    let store = Arc::new(MemoryStore::new());
    let access = Arc::new(StaticAccessPolicy::new());
    let auth = AuthService::new("test-secret", DEFAULT_JWT_ISSUER);
    let relay = RelayDeps {
        store: store.clone(),
        fabric: Arc::new(LocalFabric::new()),
        access: access.clone(),
        ice: Arc::new(IceIssuer::new(TurnSettings {
            secret: "turn-secret".into(),
            ..Default::default()
        })?),
    };

    let app = gateway::build_router(auth.clone(), relay);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(%err, "gateway test server failed");
        }
    });

    Ok(TestGateway {
        addr,
        auth,
        store,
        access,
        server,
    })
}

async fn next_json(socket: &mut Socket) -> Result<Value, BoxError> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await?
            .ok_or("socket closed")??;
        match frame {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(frame) => return Err(format!("closed: {frame:?}").into()),
            _ => continue,
        }
    }
}

async fn expect_silence(socket: &mut Socket) {
    let quiet = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

async fn close_code(socket: &mut Socket) -> Result<u16, BoxError> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await?
            .ok_or("socket ended without close frame")??;
        if let Message::Close(Some(frame)) = frame {
            return Ok(u16::from(frame.code));
        }
    }
}

async fn send(socket: &mut Socket, value: Value) -> Result<(), BoxError> {
    socket.send(Message::Text(value.to_string())).await?;
    Ok(())
}

#[tokio::test]
async fn http_endpoints_work() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let base = format!("http://{}", gw.addr);

    let health = client.get(format!("{base}/healthz")).send().await?;
    assert_eq!(StatusCode::OK, health.status());

    let version_resp = client.get(format!("{base}/version")).send().await?;
    assert_eq!(StatusCode::OK, version_resp.status());
    let version_body: Value = version_resp.json().await?;
    assert_eq!("gateway", version_body["name"]);

    let metrics_resp = client.get(format!("{base}/metrics")).send().await?;
    assert_eq!(StatusCode::OK, metrics_resp.status());
    let metrics_text = metrics_resp.text().await?;
    assert!(metrics_text.contains("gateway_http_requests_total"));
    assert!(metrics_text.contains("signaling_connections_total"));
    Ok(())
}

#[tokio::test]
async fn establishment_failures_close_with_distinct_codes() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let session = gw.session(1, vec![]).await;

    let mut anon = gw.open(session, None, None).await?;
    assert_eq!(close_code(&mut anon).await?, 4001);

    let mut bad_token = gw.open(session, Some("not-a-jwt"), None).await?;
    assert_eq!(close_code(&mut bad_token).await?, 4001);

    let ana = gw.token(1, "ana");
    let mut missing = gw.open(Uuid::new_v4(), Some(&ana), None).await?;
    assert_eq!(close_code(&mut missing).await?, 4004);

    let mut garbage = gw.open("not-a-uuid", Some(&ana), None).await?;
    assert_eq!(close_code(&mut garbage).await?, 4004);

    let bo = gw.token(2, "bo");
    let mut forbidden = gw.open(session, Some(&bo), None).await?;
    assert_eq!(close_code(&mut forbidden).await?, 4003);
    Ok(())
}

#[tokio::test]
async fn check_is_answered_and_announced() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let group = ResourceRef::new("lab_group", "17");
    gw.access.grant(1, group.clone());
    gw.access.grant(2, group.clone());
    let session = gw.session(1, vec![group]).await;

    let mut a = gw.open(session, Some(&gw.token(1, "ana")), None).await?;
    let a_hello = next_json(&mut a).await?;
    assert_eq!(a_hello["type"], "connection.established");
    assert_eq!(a_hello["is_reconnection"], false);
    let a_peer = a_hello["peer_id"].clone();

    let mut b = gw.open(session, Some(&gw.token(2, "bo")), None).await?;
    let b_hello = next_json(&mut b).await?;
    let b_peer = b_hello["peer_id"].clone();

    let joined = next_json(&mut a).await?;
    assert_eq!(joined["type"], "peer.joined");
    assert_eq!(joined["peer_id"], b_peer);
    assert_eq!(joined["username"], "bo");

    send(&mut a, json!({"type": "check", "peer_role": "participant"})).await?;

    let notice = next_json(&mut b).await?;
    assert_eq!(notice["type"], "peer.check");
    assert_eq!(notice["from_peer_id"], a_peer);
    assert_eq!(notice["from_user_id"], 1);
    assert_eq!(notice["peer_role"], "participant");

    let response = next_json(&mut a).await?;
    assert_eq!(response["type"], "check.response");
    let peers = response["peers"].as_array().ok_or("peers not an array")?;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["peer_id"], b_peer);

    let signals = gw.store.list_signals(session).await?;
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].signal_type, SignalType::Check);
    Ok(())
}

#[tokio::test]
async fn offer_answer_and_ice_are_relayed() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let group = ResourceRef::new("lab_group", "5");
    gw.access.grant(1, group.clone());
    gw.access.grant(2, group.clone());
    let session = gw.session(1, vec![group]).await;

    let mut a = gw.open(session, Some(&gw.token(1, "ana")), None).await?;
    let a_peer = next_json(&mut a).await?["peer_id"].clone();
    let mut b = gw.open(session, Some(&gw.token(2, "bo")), None).await?;
    let b_peer = next_json(&mut b).await?["peer_id"].clone();
    next_json(&mut a).await?; // peer.joined

    send(
        &mut a,
        json!({"type": "offer", "to_peer_id": b_peer, "sdp": {"type": "offer", "sdp": "v=0"}}),
    )
    .await?;
    let offer = next_json(&mut b).await?;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["from_peer_id"], a_peer);
    assert_eq!(offer["from_username"], "ana");
    assert_eq!(offer["sdp"]["sdp"], "v=0");

    send(
        &mut b,
        json!({"type": "answer", "to_peer_id": a_peer, "sdp": {"type": "answer"}}),
    )
    .await?;
    let answer = next_json(&mut a).await?;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["from_peer_id"], b_peer);

    send(
        &mut a,
        json!({"type": "ice_candidate", "to_peer_id": b_peer, "candidate": {"candidate": "c1"}}),
    )
    .await?;
    let ice = next_json(&mut b).await?;
    assert_eq!(ice["type"], "ice_candidate");
    assert_eq!(ice["candidate"]["candidate"], "c1");

    send(&mut a, json!({"type": "peer_state", "has_audio": true})).await?;
    let update = next_json(&mut b).await?;
    assert_eq!(update["type"], "peer.state_update");
    assert_eq!(update["peer_id"], a_peer);
    assert_eq!(update["has_audio"], true);

    send(&mut a, json!({"type": "offer", "sdp": "v=0"})).await?;
    let err = next_json(&mut a).await?;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "to_peer_id and sdp are required");

    send(&mut a, json!({"type": "heartbeat"})).await?;
    let beat = next_json(&mut a).await?;
    assert_eq!(beat["type"], "heartbeat.response");
    assert!(beat["timestamp"].is_string());

    let signals = gw.store.list_signals(session).await?;
    assert_eq!(signals.len(), 3);
    assert!(signals.iter().all(|s| s.delivered));
    Ok(())
}

#[tokio::test]
async fn offer_to_departed_peer_is_silent() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let session = gw.session(1, vec![]).await;
    let mut a = gw.open(session, Some(&gw.token(1, "ana")), None).await?;
    next_json(&mut a).await?;

    let gone = Uuid::new_v4();
    send(&mut a, json!({"type": "offer", "to_peer_id": gone, "sdp": "v=0"})).await?;
    expect_silence(&mut a).await;

    let signals = gw.store.list_signals(session).await?;
    assert_eq!(signals.len(), 1);
    assert!(!signals[0].delivered);
    Ok(())
}

#[tokio::test]
async fn reconnect_reuses_slot_without_second_join() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let group = ResourceRef::new("lab_group", "8");
    gw.access.grant(1, group.clone());
    gw.access.grant(2, group.clone());
    let session = gw.session(1, vec![group]).await;
    let ana = gw.token(1, "ana");

    let mut a = gw.open(session, Some(&ana), Some("ana-tab-1")).await?;
    let hello = next_json(&mut a).await?;
    assert_eq!(hello["client_peer_id"], "ana-tab-1");
    let a_peer: Uuid = serde_json::from_value(hello["peer_id"].clone())?;

    let mut b = gw.open(session, Some(&gw.token(2, "bo")), None).await?;
    next_json(&mut b).await?;
    next_json(&mut a).await?; // peer.joined

    a.close(None).await?;
    let left = next_json(&mut b).await?;
    assert_eq!(left["type"], "peer.left");
    assert_eq!(left["user_id"], 1);

    for _ in 0..50 {
        if gw.store.get_peer(a_peer).await?.state == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        gw.store.get_peer(a_peer).await?.state,
        ConnectionState::Disconnected
    );

    let mut again = gw.open(session, Some(&ana), Some("ana-tab-1")).await?;
    let hello = next_json(&mut again).await?;
    assert_eq!(hello["is_reconnection"], true);
    assert_eq!(hello["peer_id"], json!(a_peer));
    assert_eq!(
        gw.store.get_peer(a_peer).await?.state,
        ConnectionState::Connecting
    );

    expect_silence(&mut b).await;
    Ok(())
}

#[tokio::test]
async fn binary_json_frames_are_accepted() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let session = gw.session(1, vec![]).await;
    let mut a = gw.open(session, Some(&gw.token(1, "ana")), None).await?;
    next_json(&mut a).await?;

    a.send(Message::Binary(br#"{"type":"heartbeat"}"#.to_vec()))
        .await?;
    assert_eq!(next_json(&mut a).await?["type"], "heartbeat.response");

    a.send(Message::Binary(vec![0xff, 0xfe])).await?;
    assert_eq!(next_json(&mut a).await?["type"], "error");
    Ok(())
}

#[tokio::test]
async fn default_route_shares_one_session_per_record() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let group = ResourceRef::new("lab_group", "21");
    gw.access.grant(1, group.clone());
    gw.access.grant(2, group.clone());

    let outsider = format!("token={}", gw.token(3, "cy"));
    let mut denied = gw.open_default(&group, &outsider).await?;
    assert_eq!(close_code(&mut denied).await?, 4003);
    let mut anon = gw.open_default(&group, "").await?;
    assert_eq!(close_code(&mut anon).await?, 4001);

    let query = format!("token={}&kind=screen_share", gw.token(1, "ana"));
    let mut a = gw.open_default(&group, &query).await?;
    let a_hello = next_json(&mut a).await?;
    assert_eq!(a_hello["type"], "connection.established");

    let query = format!("token={}", gw.token(2, "bo"));
    let mut b = gw.open_default(&group, &query).await?;
    let b_hello = next_json(&mut b).await?;
    assert_eq!(b_hello["session_id"], a_hello["session_id"]);
    assert_eq!(next_json(&mut a).await?["type"], "peer.joined");

    let session_id: Uuid = serde_json::from_value(a_hello["session_id"].clone())?;
    let session = gw.store.get_session(session_id).await?;
    assert!(session.is_default);
    assert_eq!(session.initiator_id, 1);
    assert_eq!(session.kind, registry::SessionKind::ScreenShare);
    Ok(())
}

#[tokio::test]
async fn initiator_ends_session_over_http() -> Result<(), BoxError> {
    let gw = spawn_gateway().await?;
    let session = gw.session(1, vec![]).await;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let end = |id: String| format!("http://{}/communications/webrtc/{id}/end", gw.addr);

    let anon = client.post(end(session.to_string())).send().await?;
    assert_eq!(StatusCode::UNAUTHORIZED, anon.status());

    let ana = gw.token(1, "ana");
    let missing = client
        .post(end(Uuid::new_v4().to_string()))
        .bearer_auth(&ana)
        .send()
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, missing.status());

    let bo = client
        .post(end(session.to_string()))
        .bearer_auth(gw.token(2, "bo"))
        .send()
        .await?;
    assert_eq!(StatusCode::FORBIDDEN, bo.status());
    assert!(!gw.store.get_session(session).await?.is_ended());

    let ended = client
        .post(end(session.to_string()))
        .bearer_auth(&ana)
        .send()
        .await?;
    assert_eq!(StatusCode::OK, ended.status());
    let body: Value = ended.json().await?;
    assert_eq!(body["status"], "ended");
    assert!(body["ended_at"].is_string());

    let mut late = gw.open(session, Some(&ana), None).await?;
    assert_eq!(close_code(&mut late).await?, 4004);
    Ok(())
}
