use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::envelope::{AuthPayload, MailPayload, RequestEnvelope};
use super::error::DispatchError;
use super::response::JsonResponse;
use crate::message::EventMessage;
use crate::transport::http::ACCEPTED;
use crate::transport::{JsonTransport, LogTransport, TransportError};

/// Largest request body accepted, in bytes.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const UNAUTHORIZED: u16 = 401;

/// URLs of the HTTP services the dispatcher calls directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub auth_url: String,
    pub mail_url: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "http://auth-service/authenticate".to_string(),
            mail_url: "http://mail-service/send".to_string(),
        }
    }
}

/// Routes one request envelope to exactly one downstream call.
///
/// Holds no per-request state, so one instance serves concurrent requests
/// without locking. Nothing is retried: one downstream failure is one failed
/// response.
pub struct Dispatcher {
    http: Arc<dyn JsonTransport>,
    log: Arc<dyn LogTransport>,
    events: Arc<dyn LogTransport>,
    endpoints: ServiceEndpoints,
}

impl Dispatcher {
    /// `log` serves the `log` action and `events` the `event` action.
    pub fn new(
        http: Arc<dyn JsonTransport>,
        log: Arc<dyn LogTransport>,
        events: Arc<dyn LogTransport>,
        endpoints: ServiceEndpoints,
    ) -> Self {
        Self {
            http,
            log,
            events,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &ServiceEndpoints {
        &self.endpoints
    }

    /// Decode `body` and dispatch it.
    pub async fn dispatch_bytes(&self, body: &[u8]) -> Result<JsonResponse, DispatchError> {
        if body.len() > MAX_BODY_BYTES {
            return Err(DispatchError::BodyTooLarge(MAX_BODY_BYTES));
        }
        let envelope = RequestEnvelope::from_slice(body)?;
        self.dispatch(envelope).await
    }

    /// Run the action named by `envelope`.
    #[instrument(skip_all, fields(action = %envelope.action()))]
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Result<JsonResponse, DispatchError> {
        let result = match envelope {
            RequestEnvelope::Auth(payload) => self.authenticate(&payload).await,
            RequestEnvelope::Log(entry) => self.log_item(&entry).await,
            RequestEnvelope::Mail(payload) => self.send_mail(&payload).await,
            RequestEnvelope::Event(entry) => self.log_event(&entry).await,
        };

        match &result {
            Ok(response) => info!(message = %response.message, "dispatched"),
            Err(e) => warn!(error = %e, cause = ?std::error::Error::source(e), "dispatch failed"),
        }
        result
    }

    /// Decode and dispatch, folding the outcome into a status and body.
    pub async fn handle(&self, body: &[u8]) -> (u16, JsonResponse) {
        match self.dispatch_bytes(body).await {
            Ok(response) => (ACCEPTED, response),
            Err(e) => (e.status_code(), JsonResponse::from(&e)),
        }
    }

    async fn authenticate(&self, payload: &AuthPayload) -> Result<JsonResponse, DispatchError> {
        let body = encode(payload)?;
        let response = self
            .http
            .post_json(&self.endpoints.auth_url, &body)
            .await
            .map_err(DispatchError::upstream("auth service"))?;

        match response.status {
            ACCEPTED => {}
            UNAUTHORIZED => return Err(DispatchError::InvalidCredentials),
            status => {
                return Err(DispatchError::Upstream {
                    service: "auth service",
                    source: TransportError::Rejected(status),
                })
            }
        }

        let reply: JsonResponse = response
            .json()
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        if reply.error {
            return Err(DispatchError::InvalidCredentials);
        }

        Ok(JsonResponse::ok("Successfully authenticated").with_data(reply.data))
    }

    async fn log_item(&self, entry: &EventMessage) -> Result<JsonResponse, DispatchError> {
        let reply = self
            .log
            .send(entry)
            .await
            .map_err(DispatchError::upstream("log service"))?;
        Ok(JsonResponse::ok(reply))
    }

    async fn send_mail(&self, payload: &MailPayload) -> Result<JsonResponse, DispatchError> {
        let body = encode(payload)?;
        let response = self
            .http
            .post_json(&self.endpoints.mail_url, &body)
            .await
            .map_err(DispatchError::upstream("mail service"))?;

        if response.status != ACCEPTED {
            return Err(DispatchError::Upstream {
                service: "mail service",
                source: TransportError::Rejected(response.status),
            });
        }
        Ok(JsonResponse::ok(format!("sent mail to {}", payload.to)))
    }

    async fn log_event(&self, entry: &EventMessage) -> Result<JsonResponse, DispatchError> {
        let reply = self
            .events
            .send(entry)
            .await
            .map_err(DispatchError::upstream("event bus"))?;
        Ok(JsonResponse::ok(reply))
    }
}

fn encode<T: Serialize>(payload: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(payload).map_err(|e| DispatchError::Internal(e.to_string()))
}
