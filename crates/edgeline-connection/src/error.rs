//! Control stream errors

use edgeline_proto::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while driving a connection's control stream
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Registration rejected: {reason}")]
    RegistrationRejected {
        reason: String,
        retry_after: Option<Duration>,
        permanent: bool,
    },

    #[error("Control stream closed")]
    StreamClosed,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,

    #[error("RPC client already released")]
    Released,
}

impl ControlError {
    /// Whether retrying the same registration can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ControlError::RegistrationRejected {
                permanent: true,
                ..
            }
        )
    }

    /// Delay the edge asked for before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ControlError::RegistrationRejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
