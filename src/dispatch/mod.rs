//! dispatch - the synchronous request path.
//!
//! A caller sends one envelope; [`Dispatcher`] picks the handler named by its
//! `action` and that handler makes exactly one downstream call:
//!
//! | Action | Downstream |
//! |---|---|
//! | `auth` | `POST` to the auth service, 202 accepted, 401 invalid credentials |
//! | `log` | the configured [`LogTransport`](crate::transport::LogTransport) |
//! | `mail` | `POST` to the mail service, 202 accepted |
//! | `event` | publish onto the topic exchange |
//!
//! Every failure is folded into [`JsonResponse`] with the status from
//! [`DispatchError::status_code`].

mod dispatcher;
mod envelope;
mod error;
mod response;

#[cfg(feature = "http")]
mod http;

pub use dispatcher::{Dispatcher, ServiceEndpoints, MAX_BODY_BYTES};
pub use envelope::{Action, AuthPayload, MailPayload, RequestEnvelope};
pub use error::DispatchError;
pub use response::JsonResponse;

#[cfg(feature = "http")]
pub use http::{router, serve};
