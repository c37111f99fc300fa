//! Calling SDK surface
//!
//! The WebRTC calling SDK is an external collaborator: a client that connects
//! with a token and announces incoming calls, and per-call objects that place,
//! answer and end calls and report progress through events.

use crate::identity::UserId;
use crate::media::MediaStreamHandle;
use crate::types::{CallKind, TransportStats};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// SDK errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// The client is not connected
    #[error("Calling client not connected")]
    NotConnected,

    /// Authentication with the token failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A call action failed
    #[error("Call action {action} failed: {reason}")]
    Action {
        /// Action that failed
        action: &'static str,
        /// SDK-provided reason
        reason: String,
    },
}

/// Raw `signalingstate` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingState {
    /// Numeric state code
    pub code: i32,
    /// Reason string
    pub reason: String,
}

/// Interpretation of a [`SignalingState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingOutcome {
    /// Callee answered
    Answered,
    /// Callee declined or was busy
    Rejected,
    /// Call ended
    Ended,
    /// Calling, ringing or anything not affecting the call state
    Progress,
}

impl SignalingState {
    /// Classify by code first, then by reason
    pub fn outcome(&self) -> SignalingOutcome {
        match (self.code, self.reason.as_str()) {
            (3, _) | (_, "Answered" | "CALL_ANSWERED") => SignalingOutcome::Answered,
            (5, _) | (_, "Rejected" | "CALL_REJECTED") => SignalingOutcome::Rejected,
            (6, _) | (_, "Ended" | "CALL_ENDED" | "CALL_BUSY") => SignalingOutcome::Ended,
            _ => SignalingOutcome::Progress,
        }
    }
}

/// Events emitted by an SDK call object
#[derive(Debug, Clone)]
pub enum SdkCallEvent {
    /// The SDK captured a local stream
    AddLocalStream(MediaStreamHandle),
    /// The peer's stream arrived
    AddRemoteStream(MediaStreamHandle),
    /// Call signaling progressed
    SignalingState(SignalingState),
    /// Media connection state changed
    MediaState {
        /// Media path established
        connected: bool,
    },
    /// Informational payload
    Info(serde_json::Value),
    /// The SDK reported an error
    Error(String),
}

/// One SDK call object
#[async_trait]
pub trait SdkCall: Send + Sync {
    /// Place the call
    async fn make_call(&self) -> Result<(), SdkError>;

    /// Answer an incoming call
    async fn answer(&self) -> Result<(), SdkError>;

    /// Decline an incoming call
    async fn reject(&self) -> Result<(), SdkError>;

    /// End the call
    async fn hangup(&self) -> Result<(), SdkError>;

    /// Renegotiate with video
    async fn upgrade_to_video(&self) -> Result<(), SdkError>;

    /// Subscribe to call events
    fn subscribe(&self) -> broadcast::Receiver<SdkCallEvent>;

    /// Peer-connection statistics; `None` when the SDK hides the connection
    async fn transport_stats(&self) -> Option<TransportStats> {
        None
    }
}

/// A call announced by the SDK client
#[derive(Clone)]
pub struct IncomingSdkCall {
    /// Caller
    pub from: UserId,
    /// Callee
    pub to: UserId,
    /// The SDK's video flag; not reliable on its own
    pub is_video: bool,
    /// Call object to answer or reject
    pub call: Arc<dyn SdkCall>,
}

impl fmt::Debug for IncomingSdkCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingSdkCall")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("is_video", &self.is_video)
            .finish_non_exhaustive()
    }
}

/// Client lifecycle events
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connected to the calling service
    Connected,
    /// Authenticated as a user
    Authenticated {
        /// Authenticated user
        user: UserId,
    },
    /// Authentication failed
    AuthFailed(String),
    /// Connection lost
    Disconnected,
    /// A peer is calling
    IncomingCall(IncomingSdkCall),
}

/// SDK client
#[async_trait]
pub trait CallingClient: Send + Sync {
    /// Connect with an access token
    async fn connect(&self, token: &str) -> Result<(), SdkError>;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    /// Create a call object for an outgoing call
    fn create_call(
        &self,
        from: &UserId,
        to: &UserId,
        kind: CallKind,
    ) -> Result<Arc<dyn SdkCall>, SdkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(code: i32, reason: &str) -> SignalingState {
        SignalingState {
            code,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_signaling_outcome_by_code() {
        assert_eq!(state(3, "").outcome(), SignalingOutcome::Answered);
        assert_eq!(state(5, "").outcome(), SignalingOutcome::Rejected);
        assert_eq!(state(6, "").outcome(), SignalingOutcome::Ended);
        assert_eq!(state(2, "Ringing").outcome(), SignalingOutcome::Progress);
    }

    #[test]
    fn test_signaling_outcome_by_reason() {
        assert_eq!(
            state(0, "CALL_ANSWERED").outcome(),
            SignalingOutcome::Answered
        );
        assert_eq!(state(0, "CALL_BUSY").outcome(), SignalingOutcome::Ended);
        assert_eq!(
            state(0, "CALL_REJECTED").outcome(),
            SignalingOutcome::Rejected
        );
    }
}
