//! Gateway integration tests.

mod events;
mod transports;

#[cfg(feature = "http")]
mod http;
