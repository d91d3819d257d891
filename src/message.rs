//! The event message carried by every transport, and the severities used as
//! routing keys on the topic exchange.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A categorized log-worthy event: `{"name": <category>, "data": <body>}`.
///
/// Immutable once built; transports serialize it before it leaves the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    name: String,
    data: String,
}

impl EventMessage {
    /// Create a new message with the given category and body.
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Category (e.g. `"log"`, `"event"`, `"auth"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Message body.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Encode as the JSON body used on HTTP and AMQP.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from a JSON body.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Severity of a published event. Maps onto the routing keys
/// `log.INFO`, `log.WARNING` and `log.ERROR`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Routing key used when publishing at this severity.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Severity::Info => "log.INFO",
            Severity::Warning => "log.WARNING",
            Severity::Error => "log.ERROR",
        }
    }

    /// All severities, in ascending order.
    pub fn all() -> [Severity; 3] {
        [Severity::Info, Severity::Warning, Severity::Error]
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s.strip_prefix("log.").unwrap_or(s);
        match level.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" | "WARN" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            _ => Err(format!("unknown severity: {}", s)),
        }
    }
}
