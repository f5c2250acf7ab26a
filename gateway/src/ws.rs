use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Extension,
};
use common_net::message::ServerMessage;
use registry::{ResourceRef, SessionKind};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    auth::Identity,
    relay::{ConnectError, RelayDeps, SessionTarget, SignalRelay},
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub client_peer_id: Option<String>,
    /// Only read on the default-session route.
    pub kind: Option<SessionKind>,
}

pub async fn signaling_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    identity: Option<Extension<Identity>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = identity.map(|Extension(identity)| identity);
    let deps = state.relay.clone();
    // an unparseable id cannot name a session
    let target = Uuid::parse_str(&session_id).ok().map(SessionTarget::Id);
    ws.on_upgrade(move |socket| {
        signaling_session(socket, deps, identity, target, query.client_peer_id)
    })
}

/// Joins the live default session of a record, creating it on first use.
pub async fn default_signaling_handler(
    ws: WebSocketUpgrade,
    Path((resource_kind, resource_id)): Path<(String, String)>,
    Query(query): Query<ConnectQuery>,
    identity: Option<Extension<Identity>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = identity.map(|Extension(identity)| identity);
    let deps = state.relay.clone();
    let target = SessionTarget::Default {
        resource: ResourceRef::new(resource_kind, resource_id),
        kind: query.kind.unwrap_or_default(),
    };
    ws.on_upgrade(move |socket| {
        signaling_session(socket, deps, identity, Some(target), query.client_peer_id)
    })
}

async fn signaling_session(
    mut socket: WebSocket,
    deps: RelayDeps,
    identity: Option<Identity>,
    target: Option<SessionTarget>,
    client_peer_id: Option<String>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connected = match target {
        Some(target) => SignalRelay::connect(deps, identity, target, client_peer_id, tx).await,
        None if identity.is_none() => Err(ConnectError::Unauthenticated),
        None => Err(ConnectError::NotFound),
    };

    let relay = match connected {
        Ok(relay) => relay,
        Err(err) => {
            let frame = CloseFrame {
                code: err.close_code(),
                reason: Cow::Borrowed(err.reason()),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => relay.handle_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => relay.handle_text(text).await,
                        Err(_) => relay.reject_frame("Invalid JSON: binary frame is not UTF-8"),
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }

            Some(outbound) = rx.recv() => {
                let text = match outbound.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        error!(%err, kind = outbound.type_name(), "could not encode server message");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!(peer_id = %relay.peer_id(), "socket send failed");
                    break;
                }
            }
        }
    }

    relay.disconnect().await;
    let _ = socket.close().await;
}
