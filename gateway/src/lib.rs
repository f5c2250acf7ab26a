// HTTP/WebSocket surface of the signaling relay.
// The orchestrating binary lives in the `server` crate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common_net::fabric::Fabric;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use registry::SignalStore;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod access;
pub mod auth;
pub mod ice;
pub mod relay;
pub mod sessions;
pub mod ws;

use access::AccessPolicy;
use auth::AuthService;
use ice::{IceIssuer, TurnSettings};
use relay::RelayDeps;

pub type BoxError = common_net::BoxError;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const VERSION_PATH: &str = "/version";
pub const METRICS_PATH: &str = "/metrics";
pub const SIGNALING_PATH: &str = "/communications/webrtc/:session_id";
pub const SIGNALING_DEFAULT_PATH: &str =
    "/communications/webrtc/default/:resource_kind/:resource_id";
pub const SESSION_END_PATH: &str = "/communications/webrtc/:session_id/end";

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_http_requests_total",
        "HTTP requests by route",
        &["path"]
    )
    .expect("register gateway_http_requests_total")
});

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GatewaySettings {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    #[serde(default)]
    pub turn: TurnSettings,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let bind_addr: SocketAddr = std::env::var("GATEWAY_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|e| Box::new(e) as BoxError)?;
        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "change-me-in-production".to_string());
        let jwt_issuer = std::env::var("JWT_ISSUER")
            .unwrap_or_else(|_| auth::DEFAULT_JWT_ISSUER.to_string());
        Ok(Self {
            bind_addr,
            jwt_secret,
            jwt_issuer,
            turn: TurnSettings::from_env()?,
        })
    }
}

pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub auth: AuthService,
    pub relay: RelayDeps,
    pub ready_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl GatewayConfig {
    pub fn from_settings(
        s: GatewaySettings,
        store: Arc<dyn SignalStore>,
        fabric: Arc<dyn Fabric>,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self, BoxError> {
        Ok(Self {
            bind_addr: s.bind_addr,
            auth: AuthService::new(&s.jwt_secret, s.jwt_issuer),
            relay: RelayDeps {
                store,
                fabric,
                access,
                ice: Arc::new(IceIssuer::new(s.turn)?),
            },
            ready_tx: None,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayDeps,
}

pub fn build_router(auth_service: AuthService, relay: RelayDeps) -> Router {
    common_net::metrics::relay_metrics().on_startup();
    Lazy::force(&HTTP_REQUESTS_TOTAL);

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(VERSION_PATH, get(version))
        .route(METRICS_PATH, get(metrics))
        .route(SIGNALING_PATH, get(ws::signaling_handler))
        .route(SIGNALING_DEFAULT_PATH, get(ws::default_signaling_handler))
        .route(SESSION_END_PATH, post(sessions::end_handler))
        .layer(middleware::from_fn_with_state(auth_service, auth::identify))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { relay })
}

async fn healthz() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[HEALTHZ_PATH]).inc();
    axum::http::StatusCode::OK
}

async fn version() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[VERSION_PATH]).inc();
    let body = serde_json::json!({
        "name": "gateway",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Json(body)
}

async fn metrics() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[METRICS_PATH]).inc();
    match common_net::metrics::render() {
        Ok((content_type, body)) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, content_type)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "metrics encode failed");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encode failed",
            )
                .into_response()
        }
    }
}

pub async fn run(
    config: GatewayConfig,
    shutdown_rx: common_net::shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    let local_addr = listener.local_addr().map_err(|e| Box::new(e) as BoxError)?;
    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }
    info!(%local_addr, "gateway listening");

    let app = build_router(config.auth, config.relay);
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!(%err, "gateway server stopped unexpectedly");
        }
    });

    common_net::shutdown::wait(shutdown_rx).await;
    server.abort();
    Ok(())
}
