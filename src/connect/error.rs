//! Error types for establishing long-lived connections.

use thiserror::Error;

/// Terminal failure of the bounded-retry connection procedure.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Every allowed attempt failed.
    #[error("giving up on {target} after {attempts} failed attempts: {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },
}

impl ConnectError {
    /// Number of connection attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            ConnectError::Exhausted { attempts, .. } => *attempts,
        }
    }
}
