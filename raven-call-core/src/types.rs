//! Call types and data structures

use crate::identity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Correlation id shared by both call legs and every signaling event of one call attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session id from a server-provided value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Locally generated id used when the backend does not provide one in time
    ///
    /// Format: `{direction}_{from}_{to}_{unix_millis}`.
    pub fn fallback(direction: CallDirection, from: &UserId, to: &UserId) -> Self {
        Self(format!(
            "{}_{}_{}_{}",
            direction.as_str(),
            from,
            to,
            Utc::now().timestamp_millis()
        ))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Audio-only or audio+video call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallKind {
    /// Map the SDK's `isVideoCall` flag
    pub fn from_video_flag(is_video: bool) -> Self {
        if is_video {
            Self::Video
        } else {
            Self::Audio
        }
    }

    /// Check if this is a video call
    pub fn is_video(self) -> bool {
        self == Self::Video
    }

    /// Capture constraints needed for this kind of call
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::Audio => MediaConstraints::audio_only(),
            Self::Video => MediaConstraints::video_call(),
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We dialed
    Outgoing,
    /// The peer dialed us
    Incoming,
}

impl CallDirection {
    /// Prefix used in fallback session ids
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

/// Local call status. Idle is represented by the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Ringing (either side)
    Connecting,
    /// Media is flowing
    Connected,
    /// Hung up, timed out or ended remotely
    Ended,
    /// Declined by the callee
    Rejected,
}

impl CallStatus {
    /// Terminal for display; the session lives on until dismissed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected)
    }
}

/// Outcome recorded in the chat when a call is persisted as a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallHistoryStatus {
    /// Connected call, carries a duration
    Completed,
    /// Unanswered within the answer timeout
    Missed,
    /// Declined by the callee
    Rejected,
    /// Cancelled by the caller before it connected
    Ended,
}

/// Status values reported to the backend's call session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendCallStatus {
    /// Session created, ringing
    Initiated,
    /// Callee answered
    Connected,
    /// Call finished
    Ended,
    /// Callee declined
    Rejected,
    /// Nobody answered
    Missed,
}

impl BackendCallStatus {
    /// Parse the status string carried by `call_status_update`
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "connected" | "answered" => Some(Self::Connected),
            "ended" => Some(Self::Ended),
            "rejected" => Some(Self::Rejected),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only capture
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Camera and microphone
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Camera only, used when re-enabling video mid-call
    pub fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// One call attempt, owned by the session controller
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Correlation id (server-provided or fallback)
    pub session_id: SessionId,
    /// Machine-unique counter, stable even when the session id is replaced
    pub epoch: u64,
    /// Outgoing or incoming
    pub direction: CallDirection,
    /// The other party
    pub peer: UserId,
    /// Display name of the other party, if known
    pub peer_name: Option<String>,
    /// Audio or video
    pub kind: CallKind,
    /// Current status
    pub status: CallStatus,
    /// Wall-clock creation time
    pub started_at: DateTime<Utc>,
    /// Wall-clock time of the `connected` transition
    pub connected_at: Option<DateTime<Utc>>,
    connected_since: Option<Instant>,
    connected_for: Option<Duration>,
}

impl CallSession {
    /// Create a new session in `connecting`
    pub fn new(
        session_id: SessionId,
        epoch: u64,
        direction: CallDirection,
        peer: UserId,
        kind: CallKind,
    ) -> Self {
        Self {
            session_id,
            epoch,
            direction,
            peer,
            peer_name: None,
            kind,
            status: CallStatus::Connecting,
            started_at: Utc::now(),
            connected_at: None,
            connected_since: None,
            connected_for: None,
        }
    }

    /// Mark the session connected and start the duration clock
    pub fn mark_connected(&mut self) {
        self.status = CallStatus::Connected;
        self.connected_at = Some(Utc::now());
        self.connected_since = Some(Instant::now());
    }

    /// Move to a terminal status, freezing the duration clock
    pub fn finish(&mut self, status: CallStatus) {
        if let Some(since) = self.connected_since.take() {
            self.connected_for = Some(since.elapsed());
        }
        self.status = status;
    }

    /// Whether the call ever reached `connected`
    pub fn was_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    /// Seconds spent connected; grows while connected, frozen afterwards
    pub fn duration_seconds(&self) -> u64 {
        match (self.connected_since, self.connected_for) {
            (Some(since), _) => since.elapsed().as_secs(),
            (None, Some(total)) => total.as_secs(),
            (None, None) => 0,
        }
    }

    /// Whether the call is still ringing or in progress
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Pending request from the peer to add video to an audio call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUpgradeRequest {
    /// Requesting user
    pub from_user: UserId,
    /// Requesting user's display name
    pub from_user_name: Option<String>,
    /// Session the request belongs to
    pub session_id: SessionId,
}

/// Network quality figures shown while connected; all `None` until first sample
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Round-trip time to the backend in milliseconds
    pub ping_ms: Option<u32>,
    /// Outbound audio bitrate in kilobits per second
    pub bitrate_kbps: Option<u32>,
    /// Inbound packet loss percentage
    pub packet_loss_percent: Option<f64>,
    /// Connection type label
    pub network_type: Option<String>,
}

impl NetworkStats {
    /// Whether no field has been sampled
    pub fn is_empty(&self) -> bool {
        self.ping_ms.is_none()
            && self.bitrate_kbps.is_none()
            && self.packet_loss_percent.is_none()
            && self.network_type.is_none()
    }
}

/// Raw transport counters exposed by the calling SDK's peer connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Bytes sent on the outbound audio RTP stream
    pub outbound_audio_bytes_sent: Option<u64>,
    /// Packets lost on inbound RTP streams
    pub inbound_packets_lost: Option<u64>,
    /// Packets received on inbound RTP streams
    pub inbound_packets_received: Option<u64>,
}

/// A call the backend still considers ongoing for this user (e.g. after a reload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingCall {
    /// Session of the abandoned call
    pub session_id: SessionId,
    /// The other party
    pub peer: UserId,
    /// Display name of the other party
    pub peer_name: Option<String>,
    /// Audio or video
    pub kind: CallKind,
}

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Success confirmation
    Success,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// User-facing toast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Message text
    pub message: String,
}

impl Notice {
    /// Informational notice
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    /// Success notice
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    /// Warning notice
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    /// Error notice
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Events surfaced to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// The current session changed status
    StatusChanged {
        /// Session
        session_id: SessionId,
        /// New status
        status: CallStatus,
    },
    /// The call UI was dismissed; controller is idle again
    SessionCleared {
        /// Session that was destroyed
        session_id: SessionId,
    },
    /// An incoming call should be shown
    IncomingCall {
        /// Session
        session_id: SessionId,
        /// Caller
        from: UserId,
        /// Caller display name
        caller_name: Option<String>,
        /// Audio or video
        kind: CallKind,
    },
    /// The peer asked to add video
    VideoUpgradeRequested(VideoUpgradeRequest),
    /// The peer declined our video upgrade request
    VideoUpgradeDeclined {
        /// Session
        session_id: SessionId,
    },
    /// The call switched between audio and video
    KindChanged {
        /// Session
        session_id: SessionId,
        /// New kind
        kind: CallKind,
    },
    /// Our camera was switched on or off
    LocalVideoChanged {
        /// Camera enabled
        enabled: bool,
    },
    /// The peer switched their camera on or off
    RemoteVideoChanged {
        /// Camera enabled
        enabled: bool,
    },
    /// Remote media arrived from the SDK
    RemoteMedia {
        /// Remote audio present
        has_audio: bool,
        /// Remote video present
        has_video: bool,
    },
    /// Microphone muted or unmuted
    MuteChanged {
        /// Muted
        muted: bool,
    },
    /// Fresh network statistics
    NetworkStats(NetworkStats),
    /// A toast
    Notice(Notice),
    /// A call was auto-rejected because we were busy
    MissedWhileBusy {
        /// Caller that was rejected
        caller: UserId,
    },
    /// The active call ended and there are callers to call back
    CallbackReminder {
        /// Callers recorded while busy
        callers: Vec<UserId>,
    },
    /// The backend reports a call this device abandoned
    RejoinOffer(OngoingCall),
    /// SDK client connection state changed
    ClientConnection {
        /// Connected to the calling service
        connected: bool,
    },
}

/// Format a duration in seconds as `mm:ss`
pub fn format_call_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_session_id_format() {
        let id = SessionId::fallback(
            CallDirection::Outgoing,
            &UserId::new("A"),
            &UserId::new("B"),
        );
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "outgoing");
        assert_eq!(parts[1], "A");
        assert_eq!(parts[2], "B");
        assert!(parts[3].parse::<i64>().is_ok());

        let incoming = SessionId::fallback(
            CallDirection::Incoming,
            &UserId::new("B"),
            &UserId::new("A"),
        );
        assert!(incoming.as_str().starts_with("incoming_B_A_"));
    }

    #[test]
    fn test_call_kind_constraints() {
        assert_eq!(CallKind::Audio.constraints(), MediaConstraints::audio_only());
        assert_eq!(CallKind::Video.constraints(), MediaConstraints::video_call());
        assert_eq!(CallKind::from_video_flag(true), CallKind::Video);
        assert!(!CallKind::from_video_flag(false).is_video());
    }

    #[test]
    fn test_backend_status_parse() {
        assert_eq!(
            BackendCallStatus::parse("connected"),
            Some(BackendCallStatus::Connected)
        );
        assert_eq!(
            BackendCallStatus::parse("answered"),
            Some(BackendCallStatus::Connected)
        );
        assert_eq!(BackendCallStatus::parse("bogus"), None);
    }

    #[test]
    fn test_format_call_duration() {
        assert_eq!(format_call_duration(0), "00:00");
        assert_eq!(format_call_duration(65), "01:05");
        assert_eq!(format_call_duration(3600), "60:00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_duration_is_frozen_after_finish() {
        let mut session = CallSession::new(
            SessionId::new("s1"),
            1,
            CallDirection::Outgoing,
            UserId::new("bob"),
            CallKind::Audio,
        );
        assert_eq!(session.duration_seconds(), 0);

        session.mark_connected();
        tokio::time::advance(Duration::from_secs(42)).await;
        assert_eq!(session.duration_seconds(), 42);

        session.finish(CallStatus::Ended);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(session.duration_seconds(), 42);
        assert!(session.was_connected());
        assert!(!session.is_active());
    }

    #[test]
    fn test_call_event_serialization_tag() {
        let event = CallEvent::StatusChanged {
            session_id: SessionId::new("s1"),
            status: CallStatus::Connected,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status_changed\""));
        assert!(json.contains("\"status\":\"connected\""));
    }
}
