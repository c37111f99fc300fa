//! Chat backend RPC surface
//!
//! The backend owns call session records, busy status, video signaling relays
//! and the chat history. The call core only consumes it; failures here never
//! block a call, they are logged and the call proceeds.

use crate::identity::{LocalUser, UserId};
use crate::types::{
    format_call_duration, BackendCallStatus, CallHistoryStatus, CallKind, OngoingCall, SessionId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request reached the backend and failed
    #[error("Backend request failed: {0}")]
    Request(String),

    /// The backend could not be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request did not complete in time
    #[error("Backend request timed out: {0}")]
    Timeout(&'static str),
}

/// Credentials for the calling SDK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCredentials {
    /// The local user the token was issued for
    pub user: LocalUser,
    /// SDK access token
    pub token: String,
}

/// Payload of `update-call-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Session
    pub session_id: SessionId,
    /// New status
    pub status: BackendCallStatus,
    /// Set when the call is answered
    pub answered_at: Option<DateTime<Utc>>,
    /// Set when the call finishes
    pub end_time: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Build an update stamped with the current time where the status calls for it
    pub fn now(session_id: SessionId, status: BackendCallStatus) -> Self {
        let now = Utc::now();
        let (answered_at, end_time) = match status {
            BackendCallStatus::Connected => (Some(now), None),
            BackendCallStatus::Ended | BackendCallStatus::Rejected | BackendCallStatus::Missed => {
                (None, Some(now))
            }
            BackendCallStatus::Initiated => (None, None),
        };
        Self {
            session_id,
            status,
            answered_at,
            end_time,
        }
    }
}

/// Chat channel identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of `save-call-history`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryEntry {
    /// DM channel between the two parties
    pub channel_id: ChannelId,
    /// Audio or video
    pub call_type: CallKind,
    /// Outcome
    pub call_status: CallHistoryStatus,
    /// Connected duration formatted as `mm:ss`, only for completed calls
    pub duration: Option<String>,
}

impl CallHistoryEntry {
    /// Build an entry, formatting the duration when present
    pub fn new(
        channel_id: ChannelId,
        call_type: CallKind,
        call_status: CallHistoryStatus,
        duration_seconds: Option<u64>,
    ) -> Self {
        Self {
            channel_id,
            call_type,
            call_status,
            duration: duration_seconds.map(format_call_duration),
        }
    }
}

/// Backend RPCs consumed by the call core
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Fetch the SDK token and the local identity
    async fn get_call_credentials(&self) -> Result<CallCredentials, BackendError>;

    /// Create a call session record, returning its id
    async fn create_call_session(
        &self,
        caller: &UserId,
        callee: &UserId,
        kind: CallKind,
    ) -> Result<SessionId, BackendError>;

    /// Record a status change
    async fn update_call_status(&self, update: StatusUpdate) -> Result<(), BackendError>;

    /// Whether the user is currently in a call
    async fn check_user_busy(&self, user: &UserId) -> Result<bool, BackendError>;

    /// Relay a video upgrade request to the peer
    async fn send_video_upgrade_request(
        &self,
        session_id: &SessionId,
        to: &UserId,
        from_name: &str,
    ) -> Result<(), BackendError>;

    /// Relay our answer to the peer's video upgrade request
    async fn respond_video_upgrade(
        &self,
        session_id: &SessionId,
        accepted: bool,
    ) -> Result<(), BackendError>;

    /// Relay our camera state to the peer
    async fn send_video_status(
        &self,
        session_id: &SessionId,
        to: &UserId,
        enabled: bool,
    ) -> Result<(), BackendError>;

    /// Post a call history message into a channel
    async fn save_call_history(&self, entry: CallHistoryEntry) -> Result<(), BackendError>;

    /// Look up the DM channel between two users
    async fn find_dm_channel(
        &self,
        user1: &UserId,
        user2: &UserId,
    ) -> Result<Option<ChannelId>, BackendError>;

    /// Rejoin an abandoned call
    async fn rejoin_call(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// Decline rejoining an abandoned call
    async fn decline_rejoin(&self, session_id: &SessionId) -> Result<(), BackendError>;

    /// Find a call the backend still considers ongoing for us
    async fn check_ongoing_calls(&self) -> Result<Option<OngoingCall>, BackendError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_timestamps() {
        let connected = StatusUpdate::now(SessionId::new("s"), BackendCallStatus::Connected);
        assert!(connected.answered_at.is_some());
        assert!(connected.end_time.is_none());

        let ended = StatusUpdate::now(SessionId::new("s"), BackendCallStatus::Ended);
        assert!(ended.answered_at.is_none());
        assert!(ended.end_time.is_some());
    }

    #[test]
    fn test_history_entry_formats_duration() {
        let entry = CallHistoryEntry::new(
            ChannelId("dm-1".to_string()),
            CallKind::Audio,
            CallHistoryStatus::Completed,
            Some(125),
        );
        assert_eq!(entry.duration.as_deref(), Some("02:05"));

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["call_type"], "audio");
        assert_eq!(json["call_status"], "completed");
        assert_eq!(json["channel_id"], "dm-1");
    }
}
