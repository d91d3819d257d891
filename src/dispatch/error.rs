//! Caller-facing dispatch errors.

use thiserror::Error;

use super::envelope::Action;
use crate::transport::TransportError;

/// Everything that can go wrong between receiving a request body and
/// answering it.
///
/// `Display` is the exact message the caller sees. Downstream detail lives
/// only in `source()` and in the logs.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `action` is not one of the supported actions.
    #[error("unknown action")]
    UnknownAction(String),
    /// The body is not a single JSON request envelope.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// The payload field named by the action is absent.
    #[error("missing {0} payload")]
    MissingPayload(Action),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The downstream call failed or answered outside the accepted set.
    #[error("error calling {service}")]
    Upstream {
        service: &'static str,
        #[source]
        source: TransportError,
    },
    /// A payload assembled in-process could not be encoded or a downstream
    /// answer could not be decoded.
    #[error("internal error")]
    Internal(String),
}

impl DispatchError {
    pub(crate) fn upstream(service: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| DispatchError::Upstream { service, source }
    }

    /// Map this error to an HTTP-style status code.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::UnknownAction(_) => 400,
            DispatchError::Malformed(_) => 400,
            DispatchError::MissingPayload(_) => 400,
            DispatchError::BodyTooLarge(_) => 413,
            DispatchError::InvalidCredentials => 401,
            DispatchError::Upstream { .. } => 502,
            DispatchError::Internal(_) => 500,
        }
    }
}
