use async_trait::async_trait;

use crate::channel::{Channel, FeePolicy};
use crate::prelude::*;

/// Errors from the remote node
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The node could not be reached, or the connection failed mid-call
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not finish in time
    #[error("timed out after {0}s")]
    Timeout(u64),
    /// The node refused the request
    #[error("rejected by node: {0}")]
    Rejected(String),
    /// The node does not know the channel
    #[error("channel not found: {0}")]
    NotFound(String),
    /// The response could not be understood
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Timeout(_))
    }

    /// A stable, machine checkable reason
    pub fn reason(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::Timeout(_) => "timeout",
            ClientError::Rejected(_) => "rejected",
            ClientError::NotFound(_) => "not_found",
            ClientError::Decode(_) => "decode",
        }
    }
}

/// The remote Lightning node API.
///
/// Setting a policy is idempotent, so calls may be retried.
#[async_trait]
pub trait NodeApi: SendSync {
    /// Replace the routing policy of a channel
    async fn update_channel_policy(
        &self,
        channel_ref: &str,
        policy: &FeePolicy,
    ) -> Result<(), ClientError>;

    /// Fetch the current state of a channel
    async fn get_channel(&self, channel_ref: &str) -> Result<Channel, ClientError>;
}

/// A sink for operator alerts
#[async_trait]
pub trait Notifier: SendSync {
    /// Deliver an alert
    async fn send_alert(&self, message: &str) -> Result<(), ClientError>;
}
