//! Exchange declarations and routing-key matching.

use serde::{Deserialize, Serialize};

/// Name of the exchange all services share.
pub const DEFAULT_EXCHANGE: &str = "logs_topic";

/// How an exchange matches routing keys against bindings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    /// Does a message published with `routing_key` match a binding on `pattern`?
    pub fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Fanout => true,
        }
    }
}

/// Parameters of an exchange declaration. Two declarations are equivalent
/// exactly when these compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable, non-auto-deleting topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self::topic(DEFAULT_EXCHANGE)
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
