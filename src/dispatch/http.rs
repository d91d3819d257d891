//! HTTP surface for the dispatcher.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `POST /` answers `{"error": false, "message": "Hit the broker"}`.
//! - `POST /handle` dispatches the request envelope in the body.
//! - `GET /ping` is a heartbeat.
//!
//! ## Example
//!
//! ```ignore
//! let app = relay_gateway::dispatch::router(Arc::new(dispatcher));
//! // or
//! relay_gateway::dispatch::serve(Arc::new(dispatcher), "0.0.0.0:8080").await?;
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::dispatcher::{Dispatcher, MAX_BODY_BYTES};
use super::error::DispatchError;
use super::response::JsonResponse;

/// Build an axum `Router` serving the dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", post(broker_handler))
        .route("/handle", post(handle_handler))
        .route("/ping", get(ping_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Serve the dispatcher over HTTP at the given address.
pub async fn serve(dispatcher: Arc<Dispatcher>, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "dispatcher listening");
    axum::serve(listener, router(dispatcher)).await
}

async fn broker_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(JsonResponse::ok("Hit the broker")))
}

async fn ping_handler() -> &'static str {
    "."
}

/// `POST /handle`. The body is read up to the limit so that an oversized
/// request still gets the JSON error envelope.
async fn handle_handler(State(dispatcher): State<Arc<Dispatcher>>, body: Body) -> Response {
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return respond(&DispatchError::BodyTooLarge(MAX_BODY_BYTES)),
    };

    let (status, response) = dispatcher.handle(&bytes).await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

fn respond(err: &DispatchError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(JsonResponse::from(err))).into_response()
}
