//! The inbound request envelope: `{"action": <name>, <name>: {...}}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DispatchError;
use crate::message::EventMessage;

/// Credentials forwarded to the auth service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub email: String,
    pub password: String,
}

/// A message forwarded to the mail service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailPayload {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message: String,
}

/// The supported action discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Auth,
    Log,
    Mail,
    /// Publish the `log` payload onto the event bus.
    Event,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Auth => "auth",
            Action::Log => "log",
            Action::Mail => "mail",
            Action::Event => "event",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Action::Auth),
            "log" => Ok(Action::Log),
            "mail" => Ok(Action::Mail),
            "event" => Ok(Action::Event),
            other => Err(DispatchError::UnknownAction(other.to_string())),
        }
    }
}

/// Wire shape. Every payload is optional here; which one must be present is
/// decided by `action`.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    action: String,
    auth: Option<AuthPayload>,
    log: Option<EventMessage>,
    mail: Option<MailPayload>,
}

/// A validated request: the action together with the payload it needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestEnvelope {
    Auth(AuthPayload),
    Log(EventMessage),
    Mail(MailPayload),
    Event(EventMessage),
}

impl RequestEnvelope {
    /// Parse a body holding exactly one JSON envelope.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DispatchError> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|e| DispatchError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }

    pub fn action(&self) -> Action {
        match self {
            RequestEnvelope::Auth(_) => Action::Auth,
            RequestEnvelope::Log(_) => Action::Log,
            RequestEnvelope::Mail(_) => Action::Mail,
            RequestEnvelope::Event(_) => Action::Event,
        }
    }
}

impl TryFrom<RawEnvelope> for RequestEnvelope {
    type Error = DispatchError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let action: Action = raw.action.parse()?;
        let missing = || DispatchError::MissingPayload(action);

        match action {
            Action::Auth => raw.auth.map(RequestEnvelope::Auth).ok_or_else(missing),
            Action::Log => raw.log.map(RequestEnvelope::Log).ok_or_else(missing),
            Action::Mail => raw.mail.map(RequestEnvelope::Mail).ok_or_else(missing),
            Action::Event => raw.log.map(RequestEnvelope::Event).ok_or_else(missing),
        }
    }
}
