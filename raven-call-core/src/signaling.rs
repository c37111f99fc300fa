//! Realtime signaling events
//!
//! The backend pushes five event topics over its realtime channel. The
//! [`SignalingEventRouter`] filters every event by the current session id and
//! turns what remains into machine inputs; it holds no call state beyond the
//! one-shot `incoming_call` hint.

use crate::identity::UserId;
use crate::machine::CallInput;
use crate::types::{BackendCallStatus, CallKind, SessionId, VideoUpgradeRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// `call_status_update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatusUpdate {
    /// Session
    pub session_id: SessionId,
    /// Backend status string
    pub status: String,
    /// When the call was answered
    #[serde(default)]
    pub answered_at: Option<String>,
    /// When the call ended
    #[serde(default)]
    pub end_time: Option<String>,
}

/// `incoming_call` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallNotice {
    /// Who is being called
    pub callee_id: UserId,
    /// `audio` or `video`
    pub call_type: CallKind,
    /// Session
    pub session_id: SessionId,
    /// Caller display name
    #[serde(default)]
    pub caller_name: Option<String>,
    /// Caller id, when the backend includes it
    #[serde(default)]
    pub caller_id: Option<UserId>,
}

/// `video_upgrade_request` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUpgradeRequestNotice {
    /// Requesting user
    pub from_user: UserId,
    /// Requesting user's display name
    #[serde(default)]
    pub from_user_name: Option<String>,
    /// Target user
    pub to_user: UserId,
    /// Session
    pub session_id: SessionId,
}

/// `video_upgrade_response` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUpgradeResponseNotice {
    /// Session
    pub session_id: SessionId,
    /// Whether the peer accepted
    pub accepted: bool,
}

/// `video_status_update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStatusNotice {
    /// Session
    pub session_id: SessionId,
    /// Peer camera state
    pub video_enabled: bool,
}

/// One event from the realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// Backend session status changed
    CallStatusUpdate(CallStatusUpdate),
    /// Someone is about to call the callee
    IncomingCall(IncomingCallNotice),
    /// The peer asks to add video
    VideoUpgradeRequest(VideoUpgradeRequestNotice),
    /// The peer answered our video request
    VideoUpgradeResponse(VideoUpgradeResponseNotice),
    /// The peer toggled their camera
    VideoStatusUpdate(VideoStatusNotice),
}

impl RealtimeEvent {
    /// Topic name
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::CallStatusUpdate(_) => "call_status_update",
            Self::IncomingCall(_) => "incoming_call",
            Self::VideoUpgradeRequest(_) => "video_upgrade_request",
            Self::VideoUpgradeResponse(_) => "video_upgrade_response",
            Self::VideoStatusUpdate(_) => "video_status_update",
        }
    }

    /// Session the event belongs to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::CallStatusUpdate(e) => &e.session_id,
            Self::IncomingCall(e) => &e.session_id,
            Self::VideoUpgradeRequest(e) => &e.session_id,
            Self::VideoUpgradeResponse(e) => &e.session_id,
            Self::VideoStatusUpdate(e) => &e.session_id,
        }
    }
}

/// Realtime channel transport
///
/// Implement this for the application's pub/sub client.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait for the next event
    async fn receive_event(&self) -> Result<RealtimeEvent, Self::Error>;
}

/// Minimum time between receives (100 events/sec)
const MIN_EVENT_INTERVAL: Duration = Duration::from_millis(10);

/// Realtime receiver with rate limiting and error backoff
pub struct SignalingHandler<T: RealtimeTransport> {
    transport: Arc<T>,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: RealtimeTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Receive the next event, backing off after transport errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    pub async fn receive_event(&self) -> Result<RealtimeEvent, T::Error> {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = last_time.elapsed();
        if elapsed < MIN_EVENT_INTERVAL {
            let sleep_duration = MIN_EVENT_INTERVAL - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis() as u64,
                "Rate limiting applied"
            );
            sleep(sleep_duration).await;
        }
        *last_time = Instant::now();
        drop(last_time);

        match self.transport.receive_event().await {
            Ok(event) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(
                    topic = event.topic(),
                    session_id = %event.session_id(),
                    "Received realtime event"
                );
                Ok(event)
            }
            Err(e) => {
                let count = {
                    let mut error_count = self.error_count.lock().await;
                    *error_count += 1;
                    *error_count
                };
                let backoff = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Error receiving realtime event, backing off"
                );
                sleep(backoff).await;
                Err(e)
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

/// Call kind and caller name announced ahead of the SDK's incoming call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallHint {
    /// Announced session
    pub session_id: SessionId,
    /// Announced kind
    pub kind: CallKind,
    /// Caller display name
    pub caller_name: Option<String>,
    /// Caller id, when known
    pub caller: Option<UserId>,
}

/// What the controller should do with a realtime event
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Feed this input to the state machine
    Input(CallInput),
    /// An incoming call was announced for us
    Announced(IncomingCallHint),
    /// A session other than the current one finished
    OtherSessionFinished(SessionId),
    /// Not for us
    Ignored,
}

/// Session filter between the realtime channel and the state machine
#[derive(Debug)]
pub struct SignalingEventRouter {
    local_user: UserId,
    hint: Mutex<Option<IncomingCallHint>>,
}

impl SignalingEventRouter {
    /// Create a router for the local user
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            hint: Mutex::new(None),
        }
    }

    /// Route one event against the current session
    pub fn route(&self, event: RealtimeEvent, current: Option<&SessionId>) -> Routed {
        let matches = current.is_some_and(|id| id == event.session_id());
        match event {
            RealtimeEvent::CallStatusUpdate(update) => {
                let Some(status) = BackendCallStatus::parse(&update.status) else {
                    tracing::debug!(status = %update.status, "Unknown call status");
                    return Routed::Ignored;
                };
                if !matches {
                    return match status {
                        BackendCallStatus::Ended
                        | BackendCallStatus::Rejected
                        | BackendCallStatus::Missed => {
                            self.drop_hint_for(&update.session_id);
                            Routed::OtherSessionFinished(update.session_id)
                        }
                        _ => Routed::Ignored,
                    };
                }
                match status {
                    BackendCallStatus::Connected => Routed::Input(CallInput::RemoteConnected),
                    BackendCallStatus::Ended | BackendCallStatus::Missed => {
                        Routed::Input(CallInput::RemoteEnded)
                    }
                    BackendCallStatus::Rejected => Routed::Input(CallInput::RemoteRejected),
                    BackendCallStatus::Initiated => Routed::Ignored,
                }
            }
            RealtimeEvent::IncomingCall(notice) => {
                if notice.callee_id != self.local_user {
                    return Routed::Ignored;
                }
                let hint = IncomingCallHint {
                    session_id: notice.session_id,
                    kind: notice.call_type,
                    caller_name: notice.caller_name,
                    caller: notice.caller_id,
                };
                Routed::Announced(hint)
            }
            RealtimeEvent::VideoUpgradeRequest(request) => {
                // the recipient may not know the session id yet
                if request.from_user == self.local_user
                    || !(matches || request.to_user == self.local_user)
                {
                    return Routed::Ignored;
                }
                Routed::Input(CallInput::VideoUpgradeRequested(VideoUpgradeRequest {
                    from_user: request.from_user,
                    from_user_name: request.from_user_name,
                    session_id: request.session_id,
                }))
            }
            RealtimeEvent::VideoUpgradeResponse(response) if matches => {
                Routed::Input(CallInput::VideoUpgradeAnswered {
                    accepted: response.accepted,
                })
            }
            RealtimeEvent::VideoStatusUpdate(status) if matches => {
                Routed::Input(CallInput::RemoteVideoStatus {
                    enabled: status.video_enabled,
                })
            }
            RealtimeEvent::VideoUpgradeResponse(_) | RealtimeEvent::VideoStatusUpdate(_) => {
                Routed::Ignored
            }
        }
    }

    /// Keep an announced hint for the SDK call that follows it
    ///
    /// Only hints whose call was granted presence are kept; replaces any
    /// earlier hint.
    pub fn remember_hint(&self, hint: IncomingCallHint) {
        *self.hint.lock() = Some(hint);
    }

    /// Consume the announced hint for an SDK incoming call from `caller`
    pub fn take_hint(&self, caller: &UserId) -> Option<IncomingCallHint> {
        let mut hint = self.hint.lock();
        let usable = hint
            .as_ref()
            .is_some_and(|h| h.caller.as_ref().map_or(true, |c| c == caller));
        if usable {
            hint.take()
        } else {
            None
        }
    }

    fn drop_hint_for(&self, session_id: &SessionId) {
        let mut hint = self.hint.lock();
        if hint.as_ref().is_some_and(|h| &h.session_id == session_id) {
            *hint = None;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn router() -> SignalingEventRouter {
        SignalingEventRouter::new(UserId::new("me"))
    }

    fn status(session: &str, status: &str) -> RealtimeEvent {
        RealtimeEvent::CallStatusUpdate(CallStatusUpdate {
            session_id: SessionId::new(session),
            status: status.to_string(),
            answered_at: None,
            end_time: None,
        })
    }

    #[test]
    fn test_events_for_other_sessions_are_filtered() {
        let router = router();
        let current = SessionId::new("s2");
        assert_eq!(
            router.route(status("s1", "connected"), Some(&current)),
            Routed::Ignored
        );
        assert_eq!(
            router.route(status("s2", "connected"), Some(&current)),
            Routed::Input(CallInput::RemoteConnected)
        );
        assert_eq!(
            router.route(status("s1", "ended"), Some(&current)),
            Routed::OtherSessionFinished(SessionId::new("s1"))
        );
        assert_eq!(router.route(status("s2", "bogus"), Some(&current)), Routed::Ignored);
    }

    #[test]
    fn test_status_mapping() {
        let router = router();
        let current = SessionId::new("s");
        assert_eq!(
            router.route(status("s", "rejected"), Some(&current)),
            Routed::Input(CallInput::RemoteRejected)
        );
        assert_eq!(
            router.route(status("s", "missed"), Some(&current)),
            Routed::Input(CallInput::RemoteEnded)
        );
        assert_eq!(
            router.route(status("s", "initiated"), Some(&current)),
            Routed::Ignored
        );
    }

    #[test]
    fn test_upgrade_request_matches_by_target_user() {
        let router = router();
        let event = RealtimeEvent::VideoUpgradeRequest(VideoUpgradeRequestNotice {
            from_user: UserId::new("peer"),
            from_user_name: None,
            to_user: UserId::new("me"),
            session_id: SessionId::new("unknown-yet"),
        });
        assert!(matches!(
            router.route(event, Some(&SessionId::new("mine"))),
            Routed::Input(CallInput::VideoUpgradeRequested(_))
        ));

        let other = RealtimeEvent::VideoUpgradeRequest(VideoUpgradeRequestNotice {
            from_user: UserId::new("peer"),
            from_user_name: None,
            to_user: UserId::new("someone-else"),
            session_id: SessionId::new("x"),
        });
        assert_eq!(router.route(other, Some(&SessionId::new("mine"))), Routed::Ignored);
    }

    #[test]
    fn test_incoming_hint_is_one_shot() {
        let router = router();
        let notice = RealtimeEvent::IncomingCall(IncomingCallNotice {
            callee_id: UserId::new("me"),
            call_type: CallKind::Video,
            session_id: SessionId::new("call_9"),
            caller_name: Some("Peer".to_string()),
            caller_id: Some(UserId::new("peer")),
        });
        let Routed::Announced(hint) = router.route(notice, None) else {
            panic!("notice not announced");
        };
        assert!(router.take_hint(&UserId::new("peer")).is_none());
        router.remember_hint(hint);

        assert!(router.take_hint(&UserId::new("stranger")).is_none());
        let hint = router.take_hint(&UserId::new("peer")).unwrap();
        assert_eq!(hint.kind, CallKind::Video);
        assert!(router.take_hint(&UserId::new("peer")).is_none());
    }

    #[test]
    fn test_incoming_for_someone_else_is_ignored() {
        let router = router();
        let notice = RealtimeEvent::IncomingCall(IncomingCallNotice {
            callee_id: UserId::new("other"),
            call_type: CallKind::Audio,
            session_id: SessionId::new("call_1"),
            caller_name: None,
            caller_id: None,
        });
        assert_eq!(router.route(notice, None), Routed::Ignored);
        assert!(router.take_hint(&UserId::new("anyone")).is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let json = r#"{"event":"video_status_update","data":{"session_id":"s","video_enabled":false}}"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.topic(), "video_status_update");
        assert_eq!(
            router().route(event, Some(&SessionId::new("s"))),
            Routed::Input(CallInput::RemoteVideoStatus { enabled: false })
        );
    }

    mod handler {
        use super::*;
        use pretty_assertions::assert_eq;
        use std::collections::VecDeque;

        #[derive(Debug)]
        struct MockError;

        impl std::fmt::Display for MockError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "Mock error")
            }
        }

        impl std::error::Error for MockError {}

        struct MockTransport {
            events: std::sync::Mutex<VecDeque<RealtimeEvent>>,
        }

        #[async_trait]
        impl RealtimeTransport for MockTransport {
            type Error = MockError;

            async fn receive_event(&self) -> Result<RealtimeEvent, MockError> {
                self.events.lock().unwrap().pop_front().ok_or(MockError)
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_receive_then_backoff_on_error() {
            let transport = Arc::new(MockTransport {
                events: std::sync::Mutex::new(VecDeque::from([status("s", "ended")])),
            });
            let handler = SignalingHandler::new(transport);

            let event = handler.receive_event().await.unwrap();
            assert_eq!(event.topic(), "call_status_update");

            let start = Instant::now();
            assert!(handler.receive_event().await.is_err());
            assert!(start.elapsed() >= Duration::from_millis(100));
        }
    }
}
