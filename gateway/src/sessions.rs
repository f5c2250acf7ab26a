use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use registry::RegistryError;
use tracing::{error, info};
use uuid::Uuid;

use crate::{auth::Identity, AppState};

/// Ends a session on behalf of its initiator. Live sockets stay up until they
/// leave; new connects are refused from here on.
pub async fn end_handler(
    Path(session_id): Path<String>,
    identity: Option<Extension<Identity>>,
    State(state): State<AppState>,
) -> Response {
    let Some(Extension(identity)) = identity else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(session_id) = Uuid::parse_str(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let store = &state.relay.store;
    let session = match store.get_session(session_id).await {
        Ok(session) => session,
        Err(RegistryError::SessionNotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal(session_id, err),
    };
    if session.initiator_id != identity.user_id {
        return StatusCode::FORBIDDEN.into_response();
    }

    match store.end_session(session_id, Utc::now()).await {
        Ok(ended) => {
            info!(%session_id, user_id = identity.user_id, "session ended");
            Json(ended).into_response()
        }
        Err(RegistryError::SessionNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => internal(session_id, err),
    }
}

fn internal(session_id: Uuid, err: RegistryError) -> Response {
    error!(%session_id, %err, "end session failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
