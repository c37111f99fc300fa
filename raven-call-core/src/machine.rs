//! Call session state machine
//!
//! A pure transition function over a single call slot. Every event that can
//! move a call forward, whether it comes from a button press, a realtime
//! signaling event, an SDK callback or a timer, is a [`CallInput`]. Applying
//! an input mutates the slot synchronously and returns the side effects the
//! controller has to carry out, in order.
//!
//! ```text
//!        (none) ──Dial/Incoming──► Connecting ──LocalAnswer / RemoteConnected──► Connected
//!                                      │                                            │
//!                                      ├──LocalReject──► Rejected ──► (none)         │
//!                                      ├──RemoteRejected──► Rejected                 │
//!                                      └──LocalHangup / AnswerTimeout / RemoteEnded ─┴──► Ended
//!
//!   Ended | Rejected ──LocalHangup / Dismiss──► (none)
//! ```
//!
//! Whichever of `LocalAnswer` and `RemoteConnected` arrives first performs the
//! `Connecting -> Connected` transition; the other becomes a no-op.

use crate::identity::UserId;
use crate::types::{
    BackendCallStatus, CallDirection, CallEvent, CallHistoryStatus, CallKind, CallSession,
    CallStatus, Notice, OngoingCall, SessionId, VideoUpgradeRequest,
};
use thiserror::Error;

/// Rejected transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// No call in progress
    #[error("No active call")]
    NoSession,

    /// A call is already in progress
    #[error("A call is already in progress ({0})")]
    Busy(SessionId),

    /// The input is not valid for the current status
    #[error("Cannot {action} while call is {status:?}")]
    InvalidState {
        /// Status at the time of the input
        status: CallStatus,
        /// What was attempted
        action: &'static str,
    },

    /// Only valid for incoming calls
    #[error("Only an incoming call can be {0}")]
    NotIncoming(&'static str),

    /// Video upgrade is only possible on an audio call
    #[error("Call is already a video call")]
    AlreadyVideo,

    /// Video toggling is only possible on a video call
    #[error("Video can only be toggled during a video call")]
    NotVideo,

    /// No video upgrade request to answer
    #[error("No pending video upgrade request")]
    NoPendingUpgrade,

    /// The input refers to a session that has been replaced or destroyed
    #[error("Input refers to a previous call (epoch {0})")]
    StaleEpoch(u64),
}

/// A call history message to persist in the DM channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Session epoch, used to report failures back to the machine
    pub epoch: u64,
    /// Session id
    pub session_id: SessionId,
    /// Direction of the call
    pub direction: CallDirection,
    /// The other party
    pub peer: UserId,
    /// Audio or video
    pub kind: CallKind,
    /// Recorded outcome
    pub status: CallHistoryStatus,
    /// Connected seconds, only for completed calls
    pub duration_seconds: Option<u64>,
}

/// Everything that can drive a call forward
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    /// We place a call. `confirmed` is set when the session id is final (rejoin).
    Dial {
        /// Provisional or final session id
        session_id: SessionId,
        /// Callee
        peer: UserId,
        /// Callee display name
        peer_name: Option<String>,
        /// Audio or video
        kind: CallKind,
        /// The session id needs no backend assignment
        confirmed: bool,
    },
    /// A peer calls us
    Incoming {
        /// Session id from the `incoming_call` hint or a fallback
        session_id: SessionId,
        /// Caller
        peer: UserId,
        /// Caller display name
        peer_name: Option<String>,
        /// Audio or video
        kind: CallKind,
    },
    /// The backend assigned the final session id of an outgoing call
    SessionAssigned {
        /// Session epoch
        epoch: u64,
        /// Server-provided (or fallback) id
        session_id: SessionId,
    },
    /// The user pressed answer
    LocalAnswer,
    /// The SDK reported `Answered` or signaling reported `connected`
    RemoteConnected,
    /// Signaling or the SDK reported the call ended remotely
    RemoteEnded,
    /// The callee declined our call
    RemoteRejected,
    /// The user pressed hang up (or close on a finished call)
    LocalHangup,
    /// The user declined an incoming call
    LocalReject,
    /// The answer timer fired
    AnswerTimeout {
        /// Session epoch the timer was started for
        epoch: u64,
    },
    /// Hang-up side effects have finished executing
    EndingSettled {
        /// Session epoch
        epoch: u64,
    },
    /// The user closed the call UI
    Dismiss,
    /// We ask the peer to add video
    RequestVideoUpgrade,
    /// The peer asks us to add video
    VideoUpgradeRequested(VideoUpgradeRequest),
    /// We accept the peer's video request
    AcceptVideoUpgrade,
    /// We decline the peer's video request
    RejectVideoUpgrade,
    /// The peer answered our video request
    VideoUpgradeAnswered {
        /// Accepted or declined
        accepted: bool,
    },
    /// The user toggled their camera
    ToggleLocalVideo,
    /// The peer toggled their camera
    RemoteVideoStatus {
        /// Peer camera enabled
        enabled: bool,
    },
    /// The user toggled their microphone
    ToggleMute,
    /// The SDK delivered the remote stream
    RemoteMedia {
        /// Remote audio present
        has_audio: bool,
        /// Remote video present
        has_video: bool,
    },
    /// A history save attempt failed; a retry may save again
    HistorySaveFailed {
        /// Session epoch
        epoch: u64,
    },
}

impl CallInput {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dial { .. } => "dial",
            Self::Incoming { .. } => "incoming",
            Self::SessionAssigned { .. } => "session_assigned",
            Self::LocalAnswer => "local_answer",
            Self::RemoteConnected => "remote_connected",
            Self::RemoteEnded => "remote_ended",
            Self::RemoteRejected => "remote_rejected",
            Self::LocalHangup => "local_hangup",
            Self::LocalReject => "local_reject",
            Self::AnswerTimeout { .. } => "answer_timeout",
            Self::EndingSettled { .. } => "ending_settled",
            Self::Dismiss => "dismiss",
            Self::RequestVideoUpgrade => "request_video_upgrade",
            Self::VideoUpgradeRequested(_) => "video_upgrade_requested",
            Self::AcceptVideoUpgrade => "accept_video_upgrade",
            Self::RejectVideoUpgrade => "reject_video_upgrade",
            Self::VideoUpgradeAnswered { .. } => "video_upgrade_answered",
            Self::ToggleLocalVideo => "toggle_local_video",
            Self::RemoteVideoStatus { .. } => "remote_video_status",
            Self::ToggleMute => "toggle_mute",
            Self::RemoteMedia { .. } => "remote_media",
            Self::HistorySaveFailed { .. } => "history_save_failed",
        }
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    /// Update the process-wide in-call flag
    SetPresence(bool),
    /// Play the incoming ringtone
    StartRingtone,
    /// Play the outgoing ringback
    StartRingback,
    /// Silence both cues; `aggressive` repeats the stop shortly after
    StopCues {
        /// Schedule extra stop passes
        aggressive: bool,
    },
    /// Arm the unanswered-call timer
    StartAnswerTimer {
        /// Session epoch
        epoch: u64,
    },
    /// Disarm the unanswered-call timer
    CancelAnswerTimer,
    /// Ask the SDK to place the call
    SdkMakeCall,
    /// Ask the SDK to answer
    SdkAnswer,
    /// Ask the SDK to reject
    SdkReject,
    /// Ask the SDK to hang up
    SdkHangup,
    /// Ask the SDK to renegotiate with video
    SdkUpgradeToVideo,
    /// Capture local media for the given kind
    AcquireLocalMedia(CallKind),
    /// Switch the local camera on or off, keeping the microphone
    SetLocalVideo(bool),
    /// Mute or unmute the local microphone
    SetMuted(bool),
    /// Stop every local track and detach every sink
    ReleaseLocalMedia,
    /// Sweep the media registry shortly after teardown
    ScheduleMediaSweep,
    /// Report the session status to the backend
    UpdateBackendStatus {
        /// Session
        session_id: SessionId,
        /// Status to record
        status: BackendCallStatus,
    },
    /// Persist a history message
    SaveHistory(HistoryRecord),
    /// Ask the peer to add video
    SendVideoUpgradeRequest {
        /// Session
        session_id: SessionId,
        /// Peer
        to: UserId,
    },
    /// Answer the peer's video request
    RespondVideoUpgrade {
        /// Session the request belonged to
        session_id: SessionId,
        /// Accepted or declined
        accepted: bool,
    },
    /// Tell the peer our camera state
    SendVideoStatus {
        /// Session
        session_id: SessionId,
        /// Peer
        to: UserId,
        /// Camera enabled
        enabled: bool,
    },
    /// Begin sampling network quality
    StartNetworkMonitor,
    /// Stop sampling and clear network stats
    StopNetworkMonitor,
    /// Feed `EndingSettled` back once the preceding effects are done
    SettleEnding {
        /// Session epoch
        epoch: u64,
    },
    /// Publish a UI event
    Emit(CallEvent),
}

/// Single-call state machine
#[derive(Debug, Default)]
pub struct CallMachine {
    session: Option<CallSession>,
    next_epoch: u64,
    ending: bool,
    history_saved: bool,
    inbound_upgrade: Option<VideoUpgradeRequest>,
    outbound_upgrade_pending: bool,
    local_video_enabled: bool,
    remote_video_enabled: bool,
    muted: bool,
}

impl CallMachine {
    /// Create an idle machine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current session, if any
    #[must_use]
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Current status; `None` when idle
    #[must_use]
    pub fn status(&self) -> Option<CallStatus> {
        self.session.as_ref().map(|s| s.status)
    }

    /// Id of the current session
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.session_id)
    }

    /// Whether hang-up effects are still in flight
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.ending
    }

    /// Whether a history save has been claimed for the current session
    #[must_use]
    pub fn history_saved(&self) -> bool {
        self.history_saved
    }

    /// Pending video request from the peer
    #[must_use]
    pub fn pending_upgrade(&self) -> Option<&VideoUpgradeRequest> {
        self.inbound_upgrade.as_ref()
    }

    /// Whether we are waiting for the peer to answer our video request
    #[must_use]
    pub fn awaiting_upgrade_answer(&self) -> bool {
        self.outbound_upgrade_pending
    }

    /// Local camera state
    #[must_use]
    pub fn local_video_enabled(&self) -> bool {
        self.local_video_enabled
    }

    /// Peer camera state
    #[must_use]
    pub fn remote_video_enabled(&self) -> bool {
        self.remote_video_enabled
    }

    /// Microphone state
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Apply an input
    ///
    /// # Errors
    ///
    /// Returns error if the input is not valid in the current state. Duplicate
    /// confirmations are not errors; they return no effects.
    pub fn apply(&mut self, input: CallInput) -> Result<Vec<CallEffect>, TransitionError> {
        match input {
            CallInput::Dial {
                session_id,
                peer,
                peer_name,
                kind,
                confirmed,
            } => self.dial(session_id, peer, peer_name, kind, confirmed),
            CallInput::Incoming {
                session_id,
                peer,
                peer_name,
                kind,
            } => self.incoming(session_id, peer, peer_name, kind),
            CallInput::SessionAssigned { epoch, session_id } => {
                self.session_assigned(epoch, session_id)
            }
            CallInput::LocalAnswer => self.local_answer(),
            CallInput::RemoteConnected => self.remote_connected(),
            CallInput::RemoteEnded => self.remote_finished(CallStatus::Ended),
            CallInput::RemoteRejected => self.remote_finished(CallStatus::Rejected),
            CallInput::LocalHangup => self.hangup(),
            CallInput::LocalReject => self.reject(),
            CallInput::AnswerTimeout { epoch } => self.answer_timeout(epoch),
            CallInput::EndingSettled { epoch } => {
                if self.current_epoch() == Some(epoch) {
                    self.ending = false;
                }
                Ok(Vec::new())
            }
            CallInput::Dismiss => self.dismiss(),
            CallInput::RequestVideoUpgrade => self.request_video_upgrade(),
            CallInput::VideoUpgradeRequested(request) => self.video_upgrade_requested(request),
            CallInput::AcceptVideoUpgrade => self.accept_video_upgrade(),
            CallInput::RejectVideoUpgrade => self.reject_video_upgrade(),
            CallInput::VideoUpgradeAnswered { accepted } => self.video_upgrade_answered(accepted),
            CallInput::ToggleLocalVideo => self.toggle_local_video(),
            CallInput::RemoteVideoStatus { enabled } => {
                self.active_session()?;
                self.remote_video_enabled = enabled;
                Ok(vec![CallEffect::Emit(CallEvent::RemoteVideoChanged { enabled })])
            }
            CallInput::ToggleMute => {
                self.active_session()?;
                self.muted = !self.muted;
                Ok(vec![
                    CallEffect::SetMuted(self.muted),
                    CallEffect::Emit(CallEvent::MuteChanged { muted: self.muted }),
                ])
            }
            CallInput::RemoteMedia {
                has_audio,
                has_video,
            } => {
                self.active_session()?;
                Ok(vec![CallEffect::Emit(CallEvent::RemoteMedia {
                    has_audio,
                    has_video,
                })])
            }
            CallInput::HistorySaveFailed { epoch } => {
                if self.current_epoch() == Some(epoch) {
                    self.history_saved = false;
                }
                Ok(Vec::new())
            }
        }
    }

    fn current_epoch(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.epoch)
    }

    fn active_session(&self) -> Result<&CallSession, TransitionError> {
        match &self.session {
            Some(s) if s.is_active() => Ok(s),
            Some(s) => Err(TransitionError::InvalidState {
                status: s.status,
                action: "change media",
            }),
            None => Err(TransitionError::NoSession),
        }
    }

    /// A new session may replace the slot only when it is idle or finished.
    fn ensure_slot_free(&self) -> Result<(), TransitionError> {
        match &self.session {
            Some(s) if s.is_active() || self.ending => Err(TransitionError::Busy(s.session_id.clone())),
            _ => Ok(()),
        }
    }

    fn install(&mut self, session: CallSession) {
        self.local_video_enabled = session.kind.is_video();
        self.session = Some(session);
        self.ending = false;
        self.history_saved = false;
        self.inbound_upgrade = None;
        self.outbound_upgrade_pending = false;
        self.remote_video_enabled = true;
        self.muted = false;
    }

    fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn status_event(session: &CallSession) -> CallEffect {
        CallEffect::Emit(CallEvent::StatusChanged {
            session_id: session.session_id.clone(),
            status: session.status,
        })
    }

    fn dial(
        &mut self,
        session_id: SessionId,
        peer: UserId,
        peer_name: Option<String>,
        kind: CallKind,
        confirmed: bool,
    ) -> Result<Vec<CallEffect>, TransitionError> {
        self.ensure_slot_free()?;
        let epoch = self.allocate_epoch();
        let mut session = CallSession::new(session_id, epoch, CallDirection::Outgoing, peer, kind);
        session.peer_name = peer_name;

        let mut effects = vec![
            CallEffect::SetPresence(true),
            Self::status_event(&session),
            CallEffect::StartRingback,
        ];
        if confirmed {
            effects.extend(Self::placement_effects(&session));
        }
        self.install(session);
        Ok(effects)
    }

    /// Effects that follow once an outgoing session id is final
    fn placement_effects(session: &CallSession) -> Vec<CallEffect> {
        vec![
            CallEffect::SdkMakeCall,
            CallEffect::StartAnswerTimer {
                epoch: session.epoch,
            },
            CallEffect::AcquireLocalMedia(session.kind),
        ]
    }

    fn incoming(
        &mut self,
        session_id: SessionId,
        peer: UserId,
        peer_name: Option<String>,
        kind: CallKind,
    ) -> Result<Vec<CallEffect>, TransitionError> {
        self.ensure_slot_free()?;
        let epoch = self.allocate_epoch();
        let mut session =
            CallSession::new(session_id.clone(), epoch, CallDirection::Incoming, peer.clone(), kind);
        session.peer_name = peer_name.clone();

        let effects = vec![
            CallEffect::SetPresence(true),
            CallEffect::Emit(CallEvent::IncomingCall {
                session_id,
                from: peer,
                caller_name: peer_name,
                kind,
            }),
            Self::status_event(&session),
            CallEffect::StartRingtone,
        ];
        self.install(session);
        Ok(effects)
    }

    fn session_assigned(
        &mut self,
        epoch: u64,
        session_id: SessionId,
    ) -> Result<Vec<CallEffect>, TransitionError> {
        let session = match self.session.as_mut() {
            Some(s) if s.epoch == epoch => s,
            _ => return Err(TransitionError::StaleEpoch(epoch)),
        };
        if session.status != CallStatus::Connecting || session.direction != CallDirection::Outgoing
        {
            return Err(TransitionError::StaleEpoch(epoch));
        }
        session.session_id = session_id;
        Ok(Self::placement_effects(session))
    }

    fn local_answer(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_mut().ok_or(TransitionError::NoSession)?;
        if session.direction != CallDirection::Incoming {
            return Err(TransitionError::NotIncoming("answered"));
        }
        match session.status {
            // the remote confirmation won the race
            CallStatus::Connected => Ok(Vec::new()),
            CallStatus::Connecting => {
                session.mark_connected();
                let mut effects = vec![
                    CallEffect::StopCues { aggressive: true },
                    CallEffect::SdkAnswer,
                    Self::status_event(session),
                    CallEffect::CancelAnswerTimer,
                ];
                // the SDK captures the microphone of an audio call itself
                if session.kind.is_video() {
                    effects.push(CallEffect::AcquireLocalMedia(session.kind));
                }
                effects.push(CallEffect::UpdateBackendStatus {
                    session_id: session.session_id.clone(),
                    status: BackendCallStatus::Connected,
                });
                effects.push(CallEffect::StartNetworkMonitor);
                Ok(effects)
            }
            status => Err(TransitionError::InvalidState {
                status,
                action: "answer",
            }),
        }
    }

    fn remote_connected(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_mut().ok_or(TransitionError::NoSession)?;
        match session.status {
            CallStatus::Connecting => {
                session.mark_connected();
                Ok(vec![
                    CallEffect::StopCues { aggressive: true },
                    Self::status_event(session),
                    CallEffect::CancelAnswerTimer,
                    CallEffect::StartNetworkMonitor,
                ])
            }
            // duplicate confirmation, or a late one for a finished call
            _ => Ok(Vec::new()),
        }
    }

    /// Cleanup shared by every transition into `Ended`/`Rejected`
    fn teardown(&mut self, status: CallStatus, aggressive: bool) -> Vec<CallEffect> {
        self.inbound_upgrade = None;
        self.outbound_upgrade_pending = false;
        let mut effects = vec![
            CallEffect::CancelAnswerTimer,
            CallEffect::StopCues { aggressive },
            CallEffect::ReleaseLocalMedia,
            CallEffect::StopNetworkMonitor,
            CallEffect::SetPresence(false),
        ];
        if let Some(session) = self.session.as_mut() {
            session.finish(status);
            effects.push(Self::status_event(session));
        }
        effects
    }

    fn remote_finished(&mut self, status: CallStatus) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_ref().ok_or(TransitionError::NoSession)?;
        if !session.is_active() {
            return Ok(Vec::new());
        }
        Ok(self.teardown(status, true))
    }

    /// Claim the one history save allowed per session
    fn claim_history(&mut self, status: CallHistoryStatus) -> Option<CallEffect> {
        if self.history_saved {
            return None;
        }
        let session = self.session.as_ref()?;
        let duration_seconds = match status {
            CallHistoryStatus::Completed => Some(session.duration_seconds()),
            _ => None,
        };
        self.history_saved = true;
        Some(CallEffect::SaveHistory(HistoryRecord {
            epoch: session.epoch,
            session_id: session.session_id.clone(),
            direction: session.direction,
            peer: session.peer.clone(),
            kind: session.kind,
            status,
            duration_seconds,
        }))
    }

    fn hangup(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_ref().ok_or(TransitionError::NoSession)?;
        if self.ending {
            return Ok(Vec::new());
        }
        if session.status.is_terminal() {
            return self.dismiss();
        }

        let epoch = session.epoch;
        let session_id = session.session_id.clone();
        let history_status = if session.status == CallStatus::Connected {
            CallHistoryStatus::Completed
        } else {
            CallHistoryStatus::Ended
        };

        self.ending = true;
        let history = self.claim_history(history_status);
        let mut effects = vec![CallEffect::SdkHangup];
        effects.extend(self.teardown(CallStatus::Ended, false));
        effects.extend(history);
        effects.push(CallEffect::UpdateBackendStatus {
            session_id,
            status: BackendCallStatus::Ended,
        });
        effects.push(CallEffect::ScheduleMediaSweep);
        effects.push(CallEffect::SettleEnding { epoch });
        Ok(effects)
    }

    fn reject(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_ref().ok_or(TransitionError::NoSession)?;
        if session.direction != CallDirection::Incoming {
            return Err(TransitionError::NotIncoming("rejected"));
        }
        if session.status != CallStatus::Connecting {
            return Err(TransitionError::InvalidState {
                status: session.status,
                action: "reject",
            });
        }
        let session_id = session.session_id.clone();

        let history = self.claim_history(CallHistoryStatus::Rejected);
        let mut effects = vec![CallEffect::SdkReject];
        effects.extend(self.teardown(CallStatus::Rejected, true));
        effects.extend(history);
        effects.push(CallEffect::UpdateBackendStatus {
            session_id: session_id.clone(),
            status: BackendCallStatus::Rejected,
        });
        // the incoming screen closes on its own after a rejection
        effects.push(CallEffect::Emit(CallEvent::SessionCleared { session_id }));
        self.clear();
        Ok(effects)
    }

    fn answer_timeout(&mut self, epoch: u64) -> Result<Vec<CallEffect>, TransitionError> {
        match self.session.as_ref() {
            Some(s) if s.epoch == epoch && s.status == CallStatus::Connecting && !self.ending => {}
            _ => return Ok(Vec::new()),
        }
        let mut effects = vec![CallEffect::ReleaseLocalMedia];
        effects.extend(self.claim_history(CallHistoryStatus::Missed));
        effects.extend(self.hangup()?);
        Ok(effects)
    }

    fn dismiss(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.session.as_ref().ok_or(TransitionError::NoSession)?;
        if session.is_active() {
            return Err(TransitionError::InvalidState {
                status: session.status,
                action: "dismiss",
            });
        }
        if self.ending {
            return Ok(Vec::new());
        }
        let session_id = session.session_id.clone();
        self.clear();
        Ok(vec![
            CallEffect::StopCues { aggressive: false },
            CallEffect::ReleaseLocalMedia,
            CallEffect::Emit(CallEvent::SessionCleared { session_id }),
        ])
    }

    fn clear(&mut self) {
        self.session = None;
        self.ending = false;
        self.inbound_upgrade = None;
        self.outbound_upgrade_pending = false;
        self.muted = false;
    }

    fn connected_session(&self, action: &'static str) -> Result<&CallSession, TransitionError> {
        let session = self.session.as_ref().ok_or(TransitionError::NoSession)?;
        if session.status != CallStatus::Connected {
            return Err(TransitionError::InvalidState {
                status: session.status,
                action,
            });
        }
        Ok(session)
    }

    fn request_video_upgrade(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.connected_session("upgrade to video")?;
        if session.kind.is_video() {
            return Err(TransitionError::AlreadyVideo);
        }
        if self.outbound_upgrade_pending {
            return Ok(Vec::new());
        }
        let effect = CallEffect::SendVideoUpgradeRequest {
            session_id: session.session_id.clone(),
            to: session.peer.clone(),
        };
        self.outbound_upgrade_pending = true;
        Ok(vec![effect])
    }

    fn video_upgrade_requested(
        &mut self,
        request: VideoUpgradeRequest,
    ) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.active_session()?;
        if session.kind.is_video() {
            return Err(TransitionError::AlreadyVideo);
        }
        // a newer request supersedes the pending one
        self.inbound_upgrade = Some(request.clone());
        Ok(vec![CallEffect::Emit(CallEvent::VideoUpgradeRequested(
            request,
        ))])
    }

    fn switch_to_video(&mut self) -> Vec<CallEffect> {
        self.local_video_enabled = true;
        match self.session.as_mut() {
            Some(session) => {
                session.kind = CallKind::Video;
                vec![
                    CallEffect::AcquireLocalMedia(CallKind::Video),
                    CallEffect::SdkUpgradeToVideo,
                    CallEffect::Emit(CallEvent::KindChanged {
                        session_id: session.session_id.clone(),
                        kind: CallKind::Video,
                    }),
                ]
            }
            None => Vec::new(),
        }
    }

    fn accept_video_upgrade(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        self.connected_session("accept a video upgrade")?;
        let request = self
            .inbound_upgrade
            .take()
            .ok_or(TransitionError::NoPendingUpgrade)?;
        let mut effects = self.switch_to_video();
        effects.push(CallEffect::RespondVideoUpgrade {
            session_id: request.session_id,
            accepted: true,
        });
        Ok(effects)
    }

    fn reject_video_upgrade(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let request = self
            .inbound_upgrade
            .take()
            .ok_or(TransitionError::NoPendingUpgrade)?;
        Ok(vec![CallEffect::RespondVideoUpgrade {
            session_id: request.session_id,
            accepted: false,
        }])
    }

    fn video_upgrade_answered(&mut self, accepted: bool) -> Result<Vec<CallEffect>, TransitionError> {
        if !self.outbound_upgrade_pending {
            return Ok(Vec::new());
        }
        self.outbound_upgrade_pending = false;
        let session = self.connected_session("complete a video upgrade")?;
        if accepted {
            return Ok(self.switch_to_video());
        }
        let session_id = session.session_id.clone();
        self.local_video_enabled = false;
        Ok(vec![
            CallEffect::SetLocalVideo(false),
            CallEffect::Emit(CallEvent::VideoUpgradeDeclined { session_id }),
            CallEffect::Emit(CallEvent::Notice(Notice::error(
                "The other person declined switching to video",
            ))),
        ])
    }

    fn toggle_local_video(&mut self) -> Result<Vec<CallEffect>, TransitionError> {
        let session = self.connected_session("toggle video")?;
        if !session.kind.is_video() {
            return Err(TransitionError::NotVideo);
        }
        let session_id = session.session_id.clone();
        let to = session.peer.clone();
        self.local_video_enabled = !self.local_video_enabled;
        let enabled = self.local_video_enabled;
        Ok(vec![
            CallEffect::SetLocalVideo(enabled),
            CallEffect::Emit(CallEvent::LocalVideoChanged { enabled }),
            CallEffect::SendVideoStatus {
                session_id,
                to,
                enabled,
            },
        ])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn dial(machine: &mut CallMachine, kind: CallKind) -> Vec<CallEffect> {
        machine
            .apply(CallInput::Dial {
                session_id: SessionId::new("outgoing_A_B_1"),
                peer: UserId::new("B"),
                peer_name: None,
                kind,
                confirmed: false,
            })
            .unwrap()
    }

    fn ring(machine: &mut CallMachine, kind: CallKind) -> Vec<CallEffect> {
        machine
            .apply(CallInput::Incoming {
                session_id: SessionId::new("call_B_A_1"),
                peer: UserId::new("B"),
                peer_name: Some("Bea".to_string()),
                kind,
            })
            .unwrap()
    }

    fn count(effects: &[CallEffect], pred: impl Fn(&CallEffect) -> bool) -> usize {
        effects.iter().filter(|e| pred(e)).count()
    }

    fn history(effects: &[CallEffect]) -> Vec<HistoryRecord> {
        effects
            .iter()
            .filter_map(|e| match e {
                CallEffect::SaveHistory(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_dial_enters_connecting_with_ringback() {
        let mut m = CallMachine::new();
        let effects = dial(&mut m, CallKind::Audio);
        assert_eq!(m.status(), Some(CallStatus::Connecting));
        assert!(effects.contains(&CallEffect::StartRingback));
        assert!(effects.contains(&CallEffect::SetPresence(true)));
        // placement waits for the session id
        assert!(!effects.contains(&CallEffect::SdkMakeCall));
    }

    #[test]
    fn test_session_assignment_places_call() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Video);
        let epoch = m.session().unwrap().epoch;
        let effects = m
            .apply(CallInput::SessionAssigned {
                epoch,
                session_id: SessionId::new("call_A_B_99"),
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![
                CallEffect::SdkMakeCall,
                CallEffect::StartAnswerTimer { epoch },
                CallEffect::AcquireLocalMedia(CallKind::Video),
            ]
        );
        assert_eq!(m.session_id().unwrap().as_str(), "call_A_B_99");

        let stale = m.apply(CallInput::SessionAssigned {
            epoch: epoch + 7,
            session_id: SessionId::new("x"),
        });
        assert_eq!(stale, Err(TransitionError::StaleEpoch(epoch + 7)));
    }

    #[test]
    fn test_second_dial_while_active_is_busy() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let again = m.apply(CallInput::Dial {
            session_id: SessionId::new("other"),
            peer: UserId::new("C"),
            peer_name: None,
            kind: CallKind::Audio,
            confirmed: true,
        });
        assert!(matches!(again, Err(TransitionError::Busy(_))));
    }

    #[test]
    fn test_answer_then_remote_confirm_stops_cues_once() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        let first = m.apply(CallInput::LocalAnswer).unwrap();
        let second = m.apply(CallInput::RemoteConnected).unwrap();
        assert_eq!(m.status(), Some(CallStatus::Connected));
        assert_eq!(
            count(&first, |e| matches!(e, CallEffect::StopCues { .. })),
            1
        );
        assert!(second.is_empty());
        assert!(first.contains(&CallEffect::SdkAnswer));
    }

    #[test]
    fn test_answer_captures_camera_only_for_video() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        let effects = m.apply(CallInput::LocalAnswer).unwrap();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, CallEffect::AcquireLocalMedia(_))));

        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Video);
        let effects = m.apply(CallInput::LocalAnswer).unwrap();
        assert!(effects.contains(&CallEffect::AcquireLocalMedia(CallKind::Video)));
    }

    #[test]
    fn test_remote_confirm_then_answer_is_noop() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        let first = m.apply(CallInput::RemoteConnected).unwrap();
        let second = m.apply(CallInput::LocalAnswer).unwrap();
        assert_eq!(m.status(), Some(CallStatus::Connected));
        assert_eq!(
            count(&first, |e| matches!(e, CallEffect::StopCues { .. })),
            1
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_answer_on_outgoing_is_rejected() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        assert_eq!(
            m.apply(CallInput::LocalAnswer),
            Err(TransitionError::NotIncoming("answered"))
        );
    }

    #[test]
    fn test_hangup_while_connecting_saves_ended() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let effects = m.apply(CallInput::LocalHangup).unwrap();
        let saved = history(&effects);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, CallHistoryStatus::Ended);
        assert_eq!(saved[0].duration_seconds, None);
        assert_eq!(m.status(), Some(CallStatus::Ended));
        assert!(effects.contains(&CallEffect::ReleaseLocalMedia));
        assert!(effects.contains(&CallEffect::ScheduleMediaSweep));
        assert!(effects.contains(&CallEffect::SetPresence(false)));
    }

    #[test]
    fn test_hangup_when_connected_saves_completed() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        m.apply(CallInput::LocalAnswer).unwrap();
        let effects = m.apply(CallInput::LocalHangup).unwrap();
        let saved = history(&effects);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, CallHistoryStatus::Completed);
        assert!(saved[0].duration_seconds.is_some());
    }

    #[test]
    fn test_repeat_hangup_is_latched_until_settled() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let effects = m.apply(CallInput::LocalHangup).unwrap();
        let epoch = effects
            .iter()
            .find_map(|e| match e {
                CallEffect::SettleEnding { epoch } => Some(*epoch),
                _ => None,
            })
            .unwrap();

        // effects still in flight: ignored
        assert!(m.apply(CallInput::LocalHangup).unwrap().is_empty());
        assert!(m.session().is_some());

        m.apply(CallInput::EndingSettled { epoch }).unwrap();
        let close = m.apply(CallInput::LocalHangup).unwrap();
        assert!(m.session().is_none());
        assert!(close
            .iter()
            .any(|e| matches!(e, CallEffect::Emit(CallEvent::SessionCleared { .. }))));
    }

    #[test]
    fn test_reject_returns_to_idle() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Video);
        let effects = m.apply(CallInput::LocalReject).unwrap();
        assert!(m.session().is_none());
        assert!(effects.contains(&CallEffect::SdkReject));
        assert!(effects.contains(&CallEffect::Emit(CallEvent::StatusChanged {
            session_id: SessionId::new("call_B_A_1"),
            status: CallStatus::Rejected,
        })));
        let saved = history(&effects);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, CallHistoryStatus::Rejected);
    }

    #[test]
    fn test_timeout_saves_missed_once() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let epoch = m.session().unwrap().epoch;
        let effects = m.apply(CallInput::AnswerTimeout { epoch }).unwrap();
        let saved = history(&effects);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, CallHistoryStatus::Missed);
        assert_eq!(m.status(), Some(CallStatus::Ended));

        // hangup pressed at the same moment
        assert!(history(&m.apply(CallInput::LocalHangup).unwrap()).is_empty());
    }

    #[test]
    fn test_timeout_after_connect_is_ignored() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let epoch = m.session().unwrap().epoch;
        m.apply(CallInput::RemoteConnected).unwrap();
        assert!(m
            .apply(CallInput::AnswerTimeout { epoch })
            .unwrap()
            .is_empty());
        assert_eq!(m.status(), Some(CallStatus::Connected));
    }

    #[test]
    fn test_failed_history_save_can_be_retried() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        let epoch = m.session().unwrap().epoch;
        m.apply(CallInput::LocalHangup).unwrap();
        assert!(m.history_saved());
        m.apply(CallInput::HistorySaveFailed { epoch }).unwrap();
        assert!(!m.history_saved());
    }

    #[test]
    fn test_remote_end_keeps_session_for_display() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        m.apply(CallInput::LocalAnswer).unwrap();
        let effects = m.apply(CallInput::RemoteEnded).unwrap();
        assert_eq!(m.status(), Some(CallStatus::Ended));
        assert!(effects.contains(&CallEffect::ReleaseLocalMedia));
        assert!(history(&effects).is_empty());
        // duplicate delivery
        assert!(m.apply(CallInput::RemoteEnded).unwrap().is_empty());
    }

    #[test]
    fn test_declined_upgrade_keeps_audio() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        m.apply(CallInput::LocalAnswer).unwrap();
        let request = VideoUpgradeRequest {
            from_user: UserId::new("B"),
            from_user_name: None,
            session_id: SessionId::new("call_B_A_1"),
        };
        m.apply(CallInput::VideoUpgradeRequested(request)).unwrap();
        let effects = m.apply(CallInput::RejectVideoUpgrade).unwrap();
        assert_eq!(
            effects,
            vec![CallEffect::RespondVideoUpgrade {
                session_id: SessionId::new("call_B_A_1"),
                accepted: false,
            }]
        );
        assert_eq!(m.session().unwrap().kind, CallKind::Audio);
        assert!(m.pending_upgrade().is_none());
    }

    #[test]
    fn test_accepted_upgrade_switches_to_video() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        m.apply(CallInput::LocalAnswer).unwrap();
        m.apply(CallInput::VideoUpgradeRequested(VideoUpgradeRequest {
            from_user: UserId::new("B"),
            from_user_name: Some("Bea".to_string()),
            session_id: SessionId::new("call_B_A_1"),
        }))
        .unwrap();
        let effects = m.apply(CallInput::AcceptVideoUpgrade).unwrap();
        assert!(effects.contains(&CallEffect::SdkUpgradeToVideo));
        assert!(effects.contains(&CallEffect::AcquireLocalMedia(CallKind::Video)));
        assert_eq!(m.session().unwrap().kind, CallKind::Video);
    }

    #[test]
    fn test_outbound_upgrade_declined_reverts_camera() {
        let mut m = CallMachine::new();
        dial(&mut m, CallKind::Audio);
        m.apply(CallInput::RemoteConnected).unwrap();
        let sent = m.apply(CallInput::RequestVideoUpgrade).unwrap();
        assert!(matches!(
            sent.as_slice(),
            [CallEffect::SendVideoUpgradeRequest { .. }]
        ));
        let effects = m
            .apply(CallInput::VideoUpgradeAnswered { accepted: false })
            .unwrap();
        assert!(effects.contains(&CallEffect::SetLocalVideo(false)));
        assert_eq!(m.session().unwrap().kind, CallKind::Audio);
        // a late duplicate answer does nothing
        assert!(m
            .apply(CallInput::VideoUpgradeAnswered { accepted: true })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_toggle_video_requires_video_call() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Audio);
        m.apply(CallInput::LocalAnswer).unwrap();
        assert_eq!(
            m.apply(CallInput::ToggleLocalVideo),
            Err(TransitionError::NotVideo)
        );
    }

    #[test]
    fn test_toggle_video_notifies_peer() {
        let mut m = CallMachine::new();
        ring(&mut m, CallKind::Video);
        m.apply(CallInput::LocalAnswer).unwrap();
        let effects = m.apply(CallInput::ToggleLocalVideo).unwrap();
        assert!(effects.contains(&CallEffect::SetLocalVideo(false)));
        assert!(effects.contains(&CallEffect::SendVideoStatus {
            session_id: SessionId::new("call_B_A_1"),
            to: UserId::new("B"),
            enabled: false,
        }));
        assert!(!m.local_video_enabled());
    }

    #[derive(Debug, Clone, Copy)]
    enum Confirm {
        Local,
        Remote,
    }

    proptest! {
        #[test]
        fn prop_answer_and_confirm_converge(
            local_first in any::<bool>(),
            remote_dupes in 0usize..3,
        ) {
            let mut m = CallMachine::new();
            ring(&mut m, CallKind::Audio);

            let mut order = if local_first {
                vec![Confirm::Local, Confirm::Remote]
            } else {
                vec![Confirm::Remote, Confirm::Local]
            };
            order.extend(std::iter::repeat(Confirm::Remote).take(remote_dupes));

            let mut stops = 0;
            let mut connected_events = 0;
            for step in order {
                let input = match step {
                    Confirm::Local => CallInput::LocalAnswer,
                    Confirm::Remote => CallInput::RemoteConnected,
                };
                let effects = m.apply(input).unwrap();
                stops += count(&effects, |e| matches!(e, CallEffect::StopCues { .. }));
                connected_events += count(&effects, |e| matches!(
                    e,
                    CallEffect::Emit(CallEvent::StatusChanged { status: CallStatus::Connected, .. })
                ));
            }
            prop_assert_eq!(m.status(), Some(CallStatus::Connected));
            prop_assert_eq!(stops, 1);
            prop_assert_eq!(connected_events, 1);
        }

        #[test]
        fn prop_one_history_save_per_session(hangup_first in any::<bool>(), presses in 1usize..4) {
            let mut m = CallMachine::new();
            dial(&mut m, CallKind::Audio);
            let epoch = m.session().unwrap().epoch;

            let mut saves = 0;
            if !hangup_first {
                saves += history(&m.apply(CallInput::AnswerTimeout { epoch }).unwrap()).len();
            }
            for _ in 0..presses {
                saves += history(&m.apply(CallInput::LocalHangup).unwrap()).len();
            }
            saves += history(&m.apply(CallInput::AnswerTimeout { epoch }).unwrap()).len();
            prop_assert_eq!(saves, 1);
        }
    }
}
