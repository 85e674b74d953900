use axum::routing::get;
use axum::{Extension, Json, Router};
use crate::middleware::admission_layer;
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use vaultgate::{AdmissionGate, Decision};

/// Demonstration API, already behind the admission check.
pub fn router(gate: Arc<AdmissionGate>) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/whoami", get(whoami));
    with_admission(api, gate)
}

/// Put every route of `routes` behind `gate`.
pub fn with_admission(routes: Router, gate: Arc<AdmissionGate>) -> Router {
    routes
        .layer(axum::middleware::from_fn_with_state(gate, admission_layer))
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` until `shutdown` resolves. Peer addresses are exposed to the gate.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// GET /api/health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/whoami - The key this request was rate limited under.
async fn whoami(Extension(decision): Extension<Decision>) -> Json<Value> {
    Json(json!({
        "client_key": decision.client_key,
        "remaining": decision.remaining_tokens,
    }))
}
