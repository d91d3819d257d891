//! HTTP JSON transport.
//!
//! Every request carries a fixed deadline. The client itself is shared (it is
//! immutable and pools sockets); each call builds its own request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{JsonTransport, LogTransport, TransportError, TransportKind, UpstreamResponse};
use crate::message::EventMessage;

/// Status the logging and mail services answer with on success.
pub const ACCEPTED: u16 = 202;

/// `reqwest`-backed [`JsonTransport`].
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_decode() || err.is_body() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl JsonTransport for HttpClient {
    async fn post_json(&self, url: &str, body: &Value) -> Result<UpstreamResponse, TransportError> {
        debug!(url, "POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(UpstreamResponse::new(status, bytes.to_vec()))
    }
}

/// Log entries as JSON `POST`s to the logging service.
#[derive(Clone)]
pub struct HttpLogTransport {
    http: Arc<dyn JsonTransport>,
    url: String,
}

impl HttpLogTransport {
    pub fn new(http: impl JsonTransport + 'static, url: impl Into<String>) -> Self {
        Self {
            http: Arc::new(http),
            url: url.into(),
        }
    }
}

#[async_trait]
impl LogTransport for HttpLogTransport {
    async fn send(&self, message: &EventMessage) -> Result<String, TransportError> {
        let body = serde_json::to_value(message).map_err(|e| TransportError::Encode(e.to_string()))?;
        let response = self.http.post_json(&self.url, &body).await?;
        if response.status != ACCEPTED {
            return Err(TransportError::Rejected(response.status));
        }

        let text = response
            .json::<Value>()
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "logged".to_string());
        Ok(text)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

/// Server half of the HTTP log transport (`POST /log`).
#[cfg(feature = "http")]
pub fn log_router(sink: Arc<dyn super::LogSink>) -> axum::Router {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::Json;
    use serde_json::json;

    async fn write_log(
        State(sink): State<Arc<dyn super::LogSink>>,
        Json(entry): Json<EventMessage>,
    ) -> impl IntoResponse {
        match sink.insert(entry).await {
            Ok(()) => (
                StatusCode::ACCEPTED,
                Json(json!({ "error": false, "message": "logged" })),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "log insert failed");
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": true, "message": "failed to write log" })),
                )
            }
        }
    }

    axum::Router::new()
        .route("/log", axum::routing::post(write_log))
        .with_state(sink)
}
