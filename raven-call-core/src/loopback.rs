//! In-memory collaborators
//!
//! Loopback versions of every external seam: backend RPCs, the calling SDK,
//! capture devices, cue playback, the realtime channel and the network
//! probes. They record what was asked of them and let a test or the demo CLI
//! inject failures and remote events.

use crate::backend::{
    BackendError, CallBackend, CallCredentials, CallHistoryEntry, ChannelId, StatusUpdate,
};
use crate::config::ServiceConfig;
use crate::controller::{CallSessionController, Collaborators};
use crate::cues::{CueError, CueOutput, CuePlayer};
use crate::identity::{LocalUser, UserId};
use crate::media::{
    DeviceError, MediaDevices, MediaStreamHandle, MediaTrack, StreamOrigin, TrackKind,
};
use crate::network::{ConnectionInfo, LatencyProbe, NetworkInfo, ProbeError};
use crate::sdk::{
    CallingClient, ClientEvent, IncomingSdkCall, SdkCall, SdkCallEvent, SdkError, SignalingState,
};
use crate::signaling::{RealtimeEvent, RealtimeTransport};
use crate::types::{BackendCallStatus, CallKind, MediaConstraints, OngoingCall, SessionId, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// One RPC received by [`LoopbackBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    /// `get_call_credentials`
    GetCredentials,
    /// `create_call_session`
    CreateSession {
        /// Caller
        caller: UserId,
        /// Callee
        callee: UserId,
        /// Audio or video
        kind: CallKind,
    },
    /// `update_call_status`
    UpdateStatus {
        /// Session
        session_id: SessionId,
        /// Recorded status
        status: BackendCallStatus,
    },
    /// `check_user_busy`
    CheckBusy(UserId),
    /// `send_video_upgrade_request`
    SendVideoUpgradeRequest {
        /// Session
        session_id: SessionId,
        /// Peer
        to: UserId,
    },
    /// `respond_video_upgrade`
    RespondVideoUpgrade {
        /// Session
        session_id: SessionId,
        /// Answer
        accepted: bool,
    },
    /// `send_video_status`
    SendVideoStatus {
        /// Session
        session_id: SessionId,
        /// Peer
        to: UserId,
        /// Camera state
        enabled: bool,
    },
    /// `save_call_history`
    SaveHistory(CallHistoryEntry),
    /// `find_dm_channel`
    FindDmChannel(UserId, UserId),
    /// `rejoin_call`
    RejoinCall(SessionId),
    /// `decline_rejoin`
    DeclineRejoin(SessionId),
    /// `check_ongoing_calls`
    CheckOngoing,
}

#[derive(Debug)]
struct BackendBehavior {
    busy: HashSet<UserId>,
    busy_check_fails: bool,
    next_session: Option<SessionId>,
    create_delay: Option<Duration>,
    create_fails: bool,
    status_delay: Option<Duration>,
    dm_channels: bool,
    history_failures: u32,
    ongoing: Option<OngoingCall>,
}

/// Backend that answers from memory and records every request
pub struct LoopbackBackend {
    user: LocalUser,
    behavior: Mutex<BackendBehavior>,
    requests: Mutex<Vec<BackendRequest>>,
    session_counter: AtomicU64,
}

impl LoopbackBackend {
    /// Backend serving credentials for `user_id`
    pub fn new(user_id: &str) -> Self {
        Self {
            user: LocalUser::new(user_id),
            behavior: Mutex::new(BackendBehavior {
                busy: HashSet::new(),
                busy_check_fails: false,
                next_session: None,
                create_delay: None,
                create_fails: false,
                status_delay: None,
                dm_channels: true,
                history_failures: 0,
                ongoing: None,
            }),
            requests: Mutex::new(Vec::new()),
            session_counter: AtomicU64::new(0),
        }
    }

    /// Mark a user busy or free
    pub fn set_busy(&self, user: &UserId, busy: bool) {
        let mut behavior = self.behavior.lock();
        if busy {
            behavior.busy.insert(user.clone());
        } else {
            behavior.busy.remove(user);
        }
    }

    /// Make `check_user_busy` fail
    pub fn fail_busy_checks(&self, fail: bool) {
        self.behavior.lock().busy_check_fails = fail;
    }

    /// Id returned by the next `create_call_session`
    pub fn set_next_session(&self, session_id: SessionId) {
        self.behavior.lock().next_session = Some(session_id);
    }

    /// Delay `create_call_session` replies
    pub fn set_session_delay(&self, delay: Option<Duration>) {
        self.behavior.lock().create_delay = delay;
    }

    /// Delay `update_call_status` replies
    pub fn set_status_delay(&self, delay: Option<Duration>) {
        self.behavior.lock().status_delay = delay;
    }

    /// Make `create_call_session` fail
    pub fn fail_session_create(&self, fail: bool) {
        self.behavior.lock().create_fails = fail;
    }

    /// Whether DM channels exist
    pub fn set_dm_channels(&self, exist: bool) {
        self.behavior.lock().dm_channels = exist;
    }

    /// Fail the next `n` history saves
    pub fn fail_history_saves(&self, n: u32) {
        self.behavior.lock().history_failures = n;
    }

    /// Call reported by `check_ongoing_calls`
    pub fn set_ongoing(&self, ongoing: Option<OngoingCall>) {
        self.behavior.lock().ongoing = ongoing;
    }

    /// Every request so far, in order
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    /// History entries that were saved
    pub fn history(&self) -> Vec<CallHistoryEntry> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                BackendRequest::SaveHistory(entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    /// Status updates that were recorded, in order
    pub fn status_updates(&self) -> Vec<(SessionId, BackendCallStatus)> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                BackendRequest::UpdateStatus { session_id, status } => {
                    Some((session_id.clone(), *status))
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, request: BackendRequest) {
        tracing::trace!(?request, "Loopback backend request");
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl CallBackend for LoopbackBackend {
    async fn get_call_credentials(&self) -> Result<CallCredentials, BackendError> {
        self.record(BackendRequest::GetCredentials);
        Ok(CallCredentials {
            user: self.user.clone(),
            token: format!("loopback-token-{}", self.user.user_id),
        })
    }

    async fn create_call_session(
        &self,
        caller: &UserId,
        callee: &UserId,
        kind: CallKind,
    ) -> Result<SessionId, BackendError> {
        self.record(BackendRequest::CreateSession {
            caller: caller.clone(),
            callee: callee.clone(),
            kind,
        });
        let (delay, fails, next) = {
            let mut behavior = self.behavior.lock();
            (
                behavior.create_delay,
                behavior.create_fails,
                behavior.next_session.take(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(BackendError::Unavailable("session service down".to_string()));
        }
        Ok(next.unwrap_or_else(|| {
            let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            SessionId::new(format!("call_{n}"))
        }))
    }

    async fn update_call_status(&self, update: StatusUpdate) -> Result<(), BackendError> {
        self.record(BackendRequest::UpdateStatus {
            session_id: update.session_id,
            status: update.status,
        });
        let delay = self.behavior.lock().status_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn check_user_busy(&self, user: &UserId) -> Result<bool, BackendError> {
        self.record(BackendRequest::CheckBusy(user.clone()));
        let behavior = self.behavior.lock();
        if behavior.busy_check_fails {
            return Err(BackendError::Unavailable("presence service down".to_string()));
        }
        Ok(behavior.busy.contains(user))
    }

    async fn send_video_upgrade_request(
        &self,
        session_id: &SessionId,
        to: &UserId,
        _from_name: &str,
    ) -> Result<(), BackendError> {
        self.record(BackendRequest::SendVideoUpgradeRequest {
            session_id: session_id.clone(),
            to: to.clone(),
        });
        Ok(())
    }

    async fn respond_video_upgrade(
        &self,
        session_id: &SessionId,
        accepted: bool,
    ) -> Result<(), BackendError> {
        self.record(BackendRequest::RespondVideoUpgrade {
            session_id: session_id.clone(),
            accepted,
        });
        Ok(())
    }

    async fn send_video_status(
        &self,
        session_id: &SessionId,
        to: &UserId,
        enabled: bool,
    ) -> Result<(), BackendError> {
        self.record(BackendRequest::SendVideoStatus {
            session_id: session_id.clone(),
            to: to.clone(),
            enabled,
        });
        Ok(())
    }

    async fn save_call_history(&self, entry: CallHistoryEntry) -> Result<(), BackendError> {
        {
            let mut behavior = self.behavior.lock();
            if behavior.history_failures > 0 {
                behavior.history_failures -= 1;
                return Err(BackendError::Request("history write failed".to_string()));
            }
        }
        self.record(BackendRequest::SaveHistory(entry));
        Ok(())
    }

    async fn find_dm_channel(
        &self,
        user1: &UserId,
        user2: &UserId,
    ) -> Result<Option<ChannelId>, BackendError> {
        self.record(BackendRequest::FindDmChannel(user1.clone(), user2.clone()));
        if !self.behavior.lock().dm_channels {
            return Ok(None);
        }
        let (a, b) = if user1 <= user2 {
            (user1, user2)
        } else {
            (user2, user1)
        };
        Ok(Some(ChannelId(format!("dm_{a}_{b}"))))
    }

    async fn rejoin_call(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(BackendRequest::RejoinCall(session_id.clone()));
        Ok(())
    }

    async fn decline_rejoin(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(BackendRequest::DeclineRejoin(session_id.clone()));
        self.behavior.lock().ongoing = None;
        Ok(())
    }

    async fn check_ongoing_calls(&self) -> Result<Option<OngoingCall>, BackendError> {
        self.record(BackendRequest::CheckOngoing);
        Ok(self.behavior.lock().ongoing.clone())
    }
}

/// Action requested of a [`LoopbackCall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkAction {
    /// `make_call`
    MakeCall,
    /// `answer`
    Answer,
    /// `reject`
    Reject,
    /// `hangup`
    Hangup,
    /// `upgrade_to_video`
    UpgradeToVideo,
}

/// SDK call object driven from memory
pub struct LoopbackCall {
    from: UserId,
    to: UserId,
    kind: CallKind,
    actions: Mutex<Vec<SdkAction>>,
    events: broadcast::Sender<SdkCallEvent>,
    stats: Mutex<Option<TransportStats>>,
}

impl LoopbackCall {
    /// New call object between two users
    pub fn new(from: UserId, to: UserId, kind: CallKind) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            from,
            to,
            kind,
            actions: Mutex::new(Vec::new()),
            events,
            stats: Mutex::new(None),
        })
    }

    /// Caller
    pub fn from(&self) -> &UserId {
        &self.from
    }

    /// Callee
    pub fn to(&self) -> &UserId {
        &self.to
    }

    /// Kind the call was created with
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Actions requested so far
    pub fn actions(&self) -> Vec<SdkAction> {
        self.actions.lock().clone()
    }

    /// Deliver an SDK event to subscribers
    pub fn emit(&self, event: SdkCallEvent) {
        let _ = self.events.send(event);
    }

    /// Report a signaling state change
    pub fn signal(&self, code: i32, reason: &str) {
        self.emit(SdkCallEvent::SignalingState(SignalingState {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Deliver a remote stream with the given tracks
    pub fn deliver_remote(&self, audio: bool, video: bool) -> MediaStreamHandle {
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        let stream = MediaStreamHandle::new(StreamOrigin::Remote, tracks);
        self.emit(SdkCallEvent::AddRemoteStream(stream.clone()));
        stream
    }

    /// Statistics returned by `transport_stats`
    pub fn set_transport_stats(&self, stats: Option<TransportStats>) {
        *self.stats.lock() = stats;
    }

    fn record(&self, action: SdkAction) {
        self.actions.lock().push(action);
    }
}

#[async_trait]
impl SdkCall for LoopbackCall {
    async fn make_call(&self) -> Result<(), SdkError> {
        self.record(SdkAction::MakeCall);
        Ok(())
    }

    async fn answer(&self) -> Result<(), SdkError> {
        self.record(SdkAction::Answer);
        Ok(())
    }

    async fn reject(&self) -> Result<(), SdkError> {
        self.record(SdkAction::Reject);
        Ok(())
    }

    async fn hangup(&self) -> Result<(), SdkError> {
        self.record(SdkAction::Hangup);
        Ok(())
    }

    async fn upgrade_to_video(&self) -> Result<(), SdkError> {
        self.record(SdkAction::UpgradeToVideo);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SdkCallEvent> {
        self.events.subscribe()
    }

    async fn transport_stats(&self) -> Option<TransportStats> {
        self.stats.lock().clone()
    }
}

/// SDK client driven from memory
pub struct LoopbackClient {
    user: UserId,
    connected: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    calls: Mutex<Vec<Arc<LoopbackCall>>>,
}

impl LoopbackClient {
    /// Client that authenticates as `user_id`
    pub fn new(user_id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            user: UserId::new(user_id),
            connected: AtomicBool::new(false),
            events,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Whether `connect` succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Simulate a peer calling us
    pub fn ring(&self, from: &str, is_video: bool) -> Arc<LoopbackCall> {
        let call = LoopbackCall::new(
            UserId::new(from),
            self.user.clone(),
            CallKind::from_video_flag(is_video),
        );
        self.calls.lock().push(call.clone());
        let _ = self.events.send(ClientEvent::IncomingCall(IncomingSdkCall {
            from: UserId::new(from),
            to: self.user.clone(),
            is_video,
            call: call.clone(),
        }));
        call
    }

    /// Simulate losing the connection
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    /// Most recent call object, incoming or outgoing
    pub fn last_call(&self) -> Option<Arc<LoopbackCall>> {
        self.calls.lock().last().cloned()
    }

    /// Every call object so far
    pub fn calls(&self) -> Vec<Arc<LoopbackCall>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CallingClient for LoopbackClient {
    async fn connect(&self, token: &str) -> Result<(), SdkError> {
        if token.is_empty() {
            let _ = self
                .events
                .send(ClientEvent::AuthFailed("empty token".to_string()));
            return Err(SdkError::AuthFailed("empty token".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Connected);
        let _ = self.events.send(ClientEvent::Authenticated {
            user: self.user.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn create_call(
        &self,
        from: &UserId,
        to: &UserId,
        kind: CallKind,
    ) -> Result<Arc<dyn SdkCall>, SdkError> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let call = LoopbackCall::new(from.clone(), to.clone(), kind);
        self.calls.lock().push(call.clone());
        Ok(call)
    }
}

/// Capture devices producing in-memory tracks
pub struct LoopbackDevices {
    has_camera: AtomicBool,
    has_microphone: AtomicBool,
    failure: Mutex<Option<DeviceError>>,
    delay: Mutex<Option<Duration>>,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
    captures: AtomicUsize,
}

impl LoopbackDevices {
    /// Devices with a camera and a microphone
    pub fn new() -> Self {
        Self {
            has_camera: AtomicBool::new(true),
            has_microphone: AtomicBool::new(true),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
        }
    }

    /// Plug or unplug the camera
    pub fn set_has_camera(&self, present: bool) {
        self.has_camera.store(present, Ordering::SeqCst);
    }

    /// Plug or unplug the microphone
    pub fn set_has_microphone(&self, present: bool) {
        self.has_microphone.store(present, Ordering::SeqCst);
    }

    /// Fail every capture with this error until cleared
    pub fn fail_with(&self, error: Option<DeviceError>) {
        *self.failure.lock() = error;
    }

    /// Delay every capture
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Tracks handed out that are still live
    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Number of captures requested
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, DeviceError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            if !self.has_microphone.load(Ordering::SeqCst) {
                return Err(DeviceError::NotFound);
            }
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if constraints.video && self.has_camera.load(Ordering::SeqCst) {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(DeviceError::NotFound);
        }
        self.tracks.lock().extend(tracks.iter().cloned());
        Ok(MediaStreamHandle::new(StreamOrigin::Local, tracks))
    }
}

#[derive(Debug, Default)]
struct CueShared {
    blocked: AtomicU32,
    attempts: AtomicUsize,
}

/// Cue player that only tracks its state
pub struct LoopbackCuePlayer {
    asset: String,
    shared: Arc<CueShared>,
    playing: AtomicBool,
    looping: AtomicBool,
    volume: Mutex<f32>,
}

impl LoopbackCuePlayer {
    /// Asset the player was built for
    pub fn asset(&self) -> &str {
        &self.asset
    }

    /// Whether looping was requested
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    /// Last volume set
    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }
}

#[async_trait]
impl CuePlayer for LoopbackCuePlayer {
    async fn play(&self) -> Result<(), CueError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let blocked = self
            .shared
            .blocked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blocked {
            return Err(CueError::Blocked("autoplay not allowed".to_string()));
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn set_loop(&self, looping: bool) {
        self.looping.store(looping, Ordering::SeqCst);
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Cue output building [`LoopbackCuePlayer`]s
#[derive(Default)]
pub struct LoopbackCueOutput {
    shared: Arc<CueShared>,
    players: Mutex<Vec<Arc<LoopbackCuePlayer>>>,
}

impl LoopbackCueOutput {
    /// Output with no players yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of players built
    pub fn created(&self) -> usize {
        self.players.lock().len()
    }

    /// Refuse the next `n` play attempts
    pub fn block_next_plays(&self, n: u32) {
        self.shared.blocked.store(n, Ordering::SeqCst);
    }

    /// Play attempts across all players
    pub fn play_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Start every player behind the manager's back
    pub fn force_play_all(&self) {
        for player in self.players.lock().iter() {
            player.playing.store(true, Ordering::SeqCst);
        }
    }

    /// Whether any player is audible
    pub fn any_playing(&self) -> bool {
        self.players.lock().iter().any(|p| p.is_playing())
    }

    /// Players built so far
    pub fn players(&self) -> Vec<Arc<LoopbackCuePlayer>> {
        self.players.lock().clone()
    }
}

impl CueOutput for LoopbackCueOutput {
    fn create_player(&self, asset: &str) -> Arc<dyn CuePlayer> {
        let player = Arc::new(LoopbackCuePlayer {
            asset: asset.to_string(),
            shared: self.shared.clone(),
            playing: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            volume: Mutex::new(1.0),
        });
        self.players.lock().push(player.clone());
        player
    }
}

/// Realtime channel error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Realtime channel closed")]
pub struct RealtimeClosed;

/// Realtime channel fed from memory
pub struct LoopbackRealtime {
    sender: mpsc::UnboundedSender<RealtimeEvent>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<RealtimeEvent>>,
}

impl LoopbackRealtime {
    /// Open channel
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Push an event to the receiver
    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.sender.send(event);
    }

    /// Sender half, for publishing from elsewhere
    pub fn publisher(&self) -> mpsc::UnboundedSender<RealtimeEvent> {
        self.sender.clone()
    }
}

impl Default for LoopbackRealtime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackRealtime {
    type Error = RealtimeClosed;

    async fn receive_event(&self) -> Result<RealtimeEvent, RealtimeClosed> {
        self.receiver.lock().await.recv().await.ok_or(RealtimeClosed)
    }
}

/// Probe reporting a fixed round trip, or failing
pub struct FixedLatencyProbe {
    rtt: Option<Duration>,
}

impl FixedLatencyProbe {
    /// Probe that always measures `rtt`
    pub fn new(rtt: Duration) -> Self {
        Self { rtt: Some(rtt) }
    }

    /// Probe that never reaches an endpoint
    pub fn failing() -> Self {
        Self { rtt: None }
    }
}

#[async_trait]
impl LatencyProbe for FixedLatencyProbe {
    async fn round_trip(&self) -> Result<Duration, ProbeError> {
        self.rtt.ok_or(ProbeError::Unreachable)
    }
}

/// Network information set from memory
pub struct StaticNetworkInfo {
    info: Mutex<Option<ConnectionInfo>>,
}

impl StaticNetworkInfo {
    /// Report `info`
    pub fn new(info: Option<ConnectionInfo>) -> Self {
        Self {
            info: Mutex::new(info),
        }
    }

    /// Change the reported connection
    pub fn set(&self, info: Option<ConnectionInfo>) {
        *self.info.lock() = info;
    }
}

impl NetworkInfo for StaticNetworkInfo {
    fn connection(&self) -> Option<ConnectionInfo> {
        self.info.lock().clone()
    }
}

/// Every loopback collaborator wired together
pub struct LoopbackWorld {
    /// Backend
    pub backend: Arc<LoopbackBackend>,
    /// SDK client
    pub client: Arc<LoopbackClient>,
    /// Capture devices
    pub devices: Arc<LoopbackDevices>,
    /// Cue output
    pub cues: Arc<LoopbackCueOutput>,
    /// Realtime channel
    pub realtime: Arc<LoopbackRealtime>,
    /// Latency probe
    pub probe: Arc<FixedLatencyProbe>,
    /// Connection info
    pub network_info: Arc<StaticNetworkInfo>,
}

impl LoopbackWorld {
    /// World seen by `user_id`, on a 20ms 4G link
    pub fn new(user_id: &str) -> Self {
        Self {
            backend: Arc::new(LoopbackBackend::new(user_id)),
            client: Arc::new(LoopbackClient::new(user_id)),
            devices: Arc::new(LoopbackDevices::new()),
            cues: Arc::new(LoopbackCueOutput::new()),
            realtime: Arc::new(LoopbackRealtime::new()),
            probe: Arc::new(FixedLatencyProbe::new(Duration::from_millis(20))),
            network_info: Arc::new(StaticNetworkInfo::new(Some(ConnectionInfo {
                effective_type: Some("4g".to_string()),
                connection_type: Some("wifi".to_string()),
            }))),
        }
    }

    /// Collaborators for a controller or service
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            client: self.client.clone(),
            devices: self.devices.clone(),
            cue_output: self.cues.clone(),
            probe: self.probe.clone(),
            network_info: self.network_info.clone(),
        }
    }

    /// Connect the SDK client without a service
    pub async fn connect(&self) {
        let token = format!("loopback-token-{}", self.client.user);
        if let Err(e) = self.client.connect(&token).await {
            tracing::warn!(error = %e, "Loopback connect failed");
        }
    }

    /// Controller for the world's user, not attached to any event source
    pub fn controller(&self, config: &ServiceConfig) -> CallSessionController {
        CallSessionController::new(
            LocalUser::new(self.client.user.clone()),
            self.collaborators(),
            config,
        )
    }
}
