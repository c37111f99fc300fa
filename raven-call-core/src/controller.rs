//! Call session controller
//!
//! [`CallSessionController`] owns the single call slot. Every input, whether
//! a user action, a realtime event, an SDK callback or a timer, goes through
//! [`CallMachine::apply`] under a short lock; the returned effects are then
//! carried out in order without the lock held, so other inputs may interleave
//! at every suspension point.
//!
//! Background work (the answer timer, the SDK event pump, the network stats
//! forwarder) holds only a weak reference to the controller and stops once
//! the last handle is dropped.

use crate::backend::{CallBackend, CallHistoryEntry, StatusUpdate};
use crate::config::{CallConfig, ServiceConfig};
use crate::cues::{AudioCueManager, Cue, CueOutput};
use crate::identity::{LocalUser, UserId};
use crate::machine::{CallEffect, CallInput, CallMachine, HistoryRecord, TransitionError};
use crate::media::{DeviceError, MediaDevices, MediaLifecycleManager};
use crate::network::{LatencyProbe, NetworkInfo, NetworkQualityMonitor};
use crate::presence::{GlobalCallPresenceManager, PresenceDecision};
use crate::sdk::{
    CallingClient, ClientEvent, IncomingSdkCall, SdkCall, SdkCallEvent, SdkError, SignalingOutcome,
};
use crate::signaling::{RealtimeEvent, Routed, SignalingEventRouter};
use crate::types::{
    BackendCallStatus, CallDirection, CallEvent, CallKind, CallSession, CallStatus, NetworkStats,
    Notice, SessionId, VideoUpgradeRequest,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Call control errors
#[derive(Error, Debug)]
pub enum CallError {
    /// The callee is the local user
    #[error("Cannot call yourself")]
    SelfCall,

    /// The callee is in another call
    #[error("{0} is already in a call")]
    PeerBusy(UserId),

    /// Device preflight failed
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The action is not valid in the current call state
    #[error("Invalid call action: {0}")]
    Transition(#[from] TransitionError),

    /// The calling SDK refused the action
    #[error("SDK error: {0}")]
    Sdk(#[from] SdkError),

    /// The call ended before it was placed
    #[error("Call ended before it was placed")]
    Cancelled,

    /// There is no abandoned call to rejoin
    #[error("No call to rejoin")]
    NoRejoin,
}

/// External collaborators of a controller
#[derive(Clone)]
pub struct Collaborators {
    /// Chat backend
    pub backend: Arc<dyn CallBackend>,
    /// Calling SDK client
    pub client: Arc<dyn CallingClient>,
    /// Capture devices
    pub devices: Arc<dyn MediaDevices>,
    /// Cue playback
    pub cue_output: Arc<dyn CueOutput>,
    /// Round-trip probe
    pub probe: Arc<dyn LatencyProbe>,
    /// Connection type source
    pub network_info: Arc<dyn NetworkInfo>,
}

struct Inner {
    config: CallConfig,
    local: LocalUser,
    machine: Mutex<CallMachine>,
    backend: Arc<dyn CallBackend>,
    client: Arc<dyn CallingClient>,
    sdk_call: Mutex<Option<Arc<dyn SdkCall>>>,
    media: Arc<MediaLifecycleManager>,
    cues: Arc<AudioCueManager>,
    network: Arc<NetworkQualityMonitor>,
    presence: Arc<GlobalCallPresenceManager>,
    router: SignalingEventRouter,
    answer_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    sdk_events: Mutex<Option<JoinHandle<()>>>,
    stats_forwarder: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<CallEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((_, task)) = self.answer_timer.lock().take() {
            task.abort();
        }
        if let Some(task) = self.sdk_events.lock().take() {
            task.abort();
        }
        if let Some(task) = self.stats_forwarder.lock().take() {
            task.abort();
        }
    }
}

/// Single-call coordinator
#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<Inner>,
}

impl CallSessionController {
    /// Create an idle controller for the local user
    pub fn new(local: LocalUser, collaborators: Collaborators, config: &ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let presence = Arc::new(GlobalCallPresenceManager::new(
            collaborators.backend.clone(),
            events.clone(),
        ));
        let inner = Inner {
            config: config.call.clone(),
            router: SignalingEventRouter::new(local.user_id.clone()),
            local,
            machine: Mutex::new(CallMachine::new()),
            backend: collaborators.backend,
            client: collaborators.client,
            sdk_call: Mutex::new(None),
            media: Arc::new(MediaLifecycleManager::new(collaborators.devices)),
            cues: Arc::new(AudioCueManager::new(
                collaborators.cue_output,
                config.cues.clone(),
            )),
            network: Arc::new(NetworkQualityMonitor::new(
                collaborators.probe,
                collaborators.network_info,
                &config.network,
            )),
            presence,
            answer_timer: Mutex::new(None),
            sdk_events: Mutex::new(None),
            stats_forwarder: Mutex::new(None),
            events,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// The local user
    #[must_use]
    pub fn local_user(&self) -> &LocalUser {
        &self.inner.local
    }

    /// Snapshot of the current session
    #[must_use]
    pub fn session(&self) -> Option<CallSession> {
        self.inner.machine.lock().session().cloned()
    }

    /// Current status; `None` when idle
    #[must_use]
    pub fn status(&self) -> Option<CallStatus> {
        self.inner.machine.lock().status()
    }

    /// Id of the current session
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.machine.lock().session_id().cloned()
    }

    /// Whether hang-up effects are still running
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.inner.machine.lock().is_ending()
    }

    /// Pending video request from the peer
    #[must_use]
    pub fn pending_upgrade(&self) -> Option<VideoUpgradeRequest> {
        self.inner.machine.lock().pending_upgrade().cloned()
    }

    /// Local camera state
    #[must_use]
    pub fn local_video_enabled(&self) -> bool {
        self.inner.machine.lock().local_video_enabled()
    }

    /// Peer camera state
    #[must_use]
    pub fn remote_video_enabled(&self) -> bool {
        self.inner.machine.lock().remote_video_enabled()
    }

    /// Microphone state
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.inner.machine.lock().is_muted()
    }

    /// Latest network sample
    #[must_use]
    pub fn network_stats(&self) -> NetworkStats {
        self.inner.network.current()
    }

    /// Media manager
    #[must_use]
    pub fn media(&self) -> &Arc<MediaLifecycleManager> {
        &self.inner.media
    }

    /// Cue manager
    #[must_use]
    pub fn cues(&self) -> &Arc<AudioCueManager> {
        &self.inner.cues
    }

    /// Presence manager
    #[must_use]
    pub fn presence(&self) -> &Arc<GlobalCallPresenceManager> {
        &self.inner.presence
    }

    /// Subscribe to UI events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }

    fn notice(&self, notice: Notice) {
        self.emit(CallEvent::Notice(notice));
    }

    fn current_call(&self) -> Option<Arc<dyn SdkCall>> {
        self.inner.sdk_call.lock().clone()
    }

    fn has_active_session(&self) -> bool {
        self.inner
            .machine
            .lock()
            .session()
            .is_some_and(CallSession::is_active)
    }

    fn apply(&self, input: CallInput) -> Result<Vec<CallEffect>, TransitionError> {
        let name = input.name();
        let result = self.inner.machine.lock().apply(input);
        match &result {
            Ok(effects) => tracing::trace!(input = name, effects = effects.len(), "Applied"),
            Err(e) => tracing::debug!(input = name, error = %e, "Input rejected"),
        }
        result
    }

    async fn drive(&self, input: CallInput) -> Result<(), CallError> {
        let effects = self.apply(input)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Drive an input whose rejection is expected now and then
    async fn drive_quiet(&self, input: CallInput) {
        let _ = self.drive(input).await;
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// Returns error if the callee is the local user or busy, the devices
    /// fail the preflight, the SDK cannot create the call, or another call
    /// holds the slot. No session exists after an error.
    #[tracing::instrument(skip_all, fields(peer = %peer, kind = kind.as_str()))]
    pub async fn dial(
        &self,
        peer: &UserId,
        peer_name: Option<String>,
        kind: CallKind,
    ) -> Result<SessionId, CallError> {
        let me = self.inner.local.user_id.clone();
        if *peer == me {
            self.notice(Notice::error("You cannot call yourself"));
            return Err(CallError::SelfCall);
        }
        if let Some(session) = self.session().filter(CallSession::is_active) {
            return Err(TransitionError::Busy(session.session_id).into());
        }

        match self.inner.backend.check_user_busy(peer).await {
            Ok(true) => {
                let name = peer_name.clone().unwrap_or_else(|| peer.to_string());
                tracing::info!("Callee is busy");
                self.notice(Notice::warning(format!("{name} is in another call")));
                return Err(CallError::PeerBusy(peer.clone()));
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Busy check failed, proceeding"),
        }

        if let Err(e) = self.inner.media.preflight(kind).await {
            tracing::warn!(error = %e, "Device preflight failed");
            self.notice(Notice::error(e.user_message(kind)));
            return Err(e.into());
        }

        let call = match self.inner.client.create_call(&me, peer, kind) {
            Ok(call) => call,
            Err(e) => {
                tracing::error!(error = %e, "SDK refused to create the call");
                self.notice(Notice::error("The calling service is not available"));
                return Err(e.into());
            }
        };

        let provisional = SessionId::fallback(CallDirection::Outgoing, &me, peer);
        let (effects, epoch) = {
            let mut machine = self.inner.machine.lock();
            let effects = machine.apply(CallInput::Dial {
                session_id: provisional.clone(),
                peer: peer.clone(),
                peer_name,
                kind,
                confirmed: false,
            })?;
            (effects, machine.session().map_or(0, |s| s.epoch))
        };
        tracing::info!(session_id = %provisional, epoch, "Dialing");
        self.attach_call(call);
        self.execute(effects).await;

        let requested = tokio::time::timeout(
            self.inner.config.session_request_timeout(),
            self.inner.backend.create_call_session(&me, peer, kind),
        )
        .await;
        let session_id = match requested {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Session creation failed, using local id");
                provisional.clone()
            }
            Err(_) => {
                tracing::warn!("Session creation timed out, using local id");
                provisional.clone()
            }
        };

        match self.apply(CallInput::SessionAssigned {
            epoch,
            session_id: session_id.clone(),
        }) {
            Ok(effects) => {
                tracing::info!(%session_id, "Call placed");
                self.execute(effects).await;
                Ok(session_id)
            }
            Err(_) => {
                tracing::info!(%session_id, "Call ended while the session id was pending");
                if session_id != provisional {
                    let update = StatusUpdate::now(session_id, BackendCallStatus::Ended);
                    if let Err(e) = self.inner.backend.update_call_status(update).await {
                        tracing::warn!(error = %e, "Failed to close orphaned session");
                    }
                }
                Err(CallError::Cancelled)
            }
        }
    }

    /// Answer the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if there is no incoming call or the devices fail the
    /// preflight; the call keeps ringing in the latter case
    #[tracing::instrument(skip(self))]
    pub async fn answer(&self) -> Result<(), CallError> {
        let kind = match self.session() {
            Some(session) => session.kind,
            None => return Err(TransitionError::NoSession.into()),
        };
        if let Err(e) = self.inner.media.preflight(kind).await {
            tracing::warn!(error = %e, "Device preflight failed");
            self.notice(Notice::error(e.user_message(kind)));
            return Err(e.into());
        }
        self.drive(CallInput::LocalAnswer).await
    }

    /// Hang up, or close the call UI once the call has finished
    ///
    /// # Errors
    ///
    /// Returns error if there is no session
    #[tracing::instrument(skip(self))]
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.drive(CallInput::LocalHangup).await?;
        self.detach_if_cleared();
        Ok(())
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if there is no ringing incoming call
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self) -> Result<(), CallError> {
        self.drive(CallInput::LocalReject).await?;
        self.detach_if_cleared();
        Ok(())
    }

    /// Close the call UI of a finished call
    ///
    /// # Errors
    ///
    /// Returns error if the call is still active
    #[tracing::instrument(skip(self))]
    pub async fn dismiss(&self) -> Result<(), CallError> {
        self.drive(CallInput::Dismiss).await?;
        self.detach_if_cleared();
        Ok(())
    }

    /// Ask the peer to switch the call to video
    ///
    /// # Errors
    ///
    /// Returns error if the camera fails the preflight or the call is not a
    /// connected audio call
    #[tracing::instrument(skip(self))]
    pub async fn upgrade_to_video(&self) -> Result<(), CallError> {
        if let Err(e) = self.inner.media.preflight(CallKind::Video).await {
            self.notice(Notice::error(e.user_message(CallKind::Video)));
            return Err(e.into());
        }
        self.drive(CallInput::RequestVideoUpgrade).await
    }

    /// Accept the peer's video request
    ///
    /// A camera that fails the preflight declines the request instead.
    ///
    /// # Errors
    ///
    /// Returns error if there is no pending request or the camera is unavailable
    #[tracing::instrument(skip(self))]
    pub async fn accept_video_upgrade(&self) -> Result<(), CallError> {
        if let Err(e) = self.inner.media.preflight(CallKind::Video).await {
            self.notice(Notice::error(e.user_message(CallKind::Video)));
            self.drive_quiet(CallInput::RejectVideoUpgrade).await;
            return Err(e.into());
        }
        self.drive(CallInput::AcceptVideoUpgrade).await
    }

    /// Decline the peer's video request
    ///
    /// # Errors
    ///
    /// Returns error if there is no pending request
    #[tracing::instrument(skip(self))]
    pub async fn reject_video_upgrade(&self) -> Result<(), CallError> {
        self.drive(CallInput::RejectVideoUpgrade).await
    }

    /// Switch the local camera off or back on
    ///
    /// # Errors
    ///
    /// Returns error if the call is not a connected video call
    #[tracing::instrument(skip(self))]
    pub async fn toggle_local_video(&self) -> Result<(), CallError> {
        self.drive(CallInput::ToggleLocalVideo).await
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if there is no active call
    #[tracing::instrument(skip(self))]
    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        self.drive(CallInput::ToggleMute).await
    }

    /// Rejoin the call offered at start-up
    ///
    /// # Errors
    ///
    /// Returns error if there is no offer, the devices fail the preflight or
    /// the SDK cannot create the call
    #[tracing::instrument(skip(self))]
    pub async fn rejoin(&self) -> Result<SessionId, CallError> {
        let Some(ongoing) = self.inner.presence.take_rejoin() else {
            return Err(CallError::NoRejoin);
        };
        if let Err(e) = self.inner.backend.rejoin_call(&ongoing.session_id).await {
            tracing::warn!(session_id = %ongoing.session_id, error = %e, "Rejoin notification failed");
        }
        if let Err(e) = self.inner.media.preflight(ongoing.kind).await {
            self.notice(Notice::error(e.user_message(ongoing.kind)));
            self.inner.presence.set_in_call(false);
            return Err(e.into());
        }
        let me = self.inner.local.user_id.clone();
        let call = self.inner.client.create_call(&me, &ongoing.peer, ongoing.kind)?;
        let effects = self.apply(CallInput::Dial {
            session_id: ongoing.session_id.clone(),
            peer: ongoing.peer.clone(),
            peer_name: ongoing.peer_name.clone(),
            kind: ongoing.kind,
            confirmed: true,
        })?;
        tracing::info!(session_id = %ongoing.session_id, peer = %ongoing.peer, "Rejoining call");
        self.attach_call(call);
        self.execute(effects).await;
        Ok(ongoing.session_id)
    }

    /// Decline the rejoin offer. Returns false if there was none.
    pub async fn decline_rejoin(&self) -> bool {
        self.inner.presence.decline_rejoin().await
    }

    /// Call back a caller recorded while busy
    ///
    /// # Errors
    ///
    /// Same as [`dial`](Self::dial)
    pub async fn call_back(&self, caller: &UserId, kind: CallKind) -> Result<SessionId, CallError> {
        self.inner.presence.dismiss_missed(caller);
        self.dial(caller, None, kind).await
    }

    /// Feed one realtime event
    pub async fn handle_realtime(&self, event: RealtimeEvent) {
        let current = self.session_id();
        match self.inner.router.route(event, current.as_ref()) {
            Routed::Input(input) => self.drive_quiet(input).await,
            Routed::Announced(hint) => {
                match self
                    .inner
                    .presence
                    .reserve(hint.caller.as_ref(), &hint.session_id)
                {
                    PresenceDecision::Ring => self.inner.router.remember_hint(hint),
                    PresenceDecision::Busy => {
                        tracing::debug!(session_id = %hint.session_id, "Announced call while busy, hint dropped");
                    }
                }
            }
            Routed::OtherSessionFinished(session_id) => {
                self.inner.presence.release_reservation(&session_id);
            }
            Routed::Ignored => {}
        }
    }

    /// Feed one SDK client event
    pub async fn handle_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                tracing::info!("Calling client connected");
                self.emit(CallEvent::ClientConnection { connected: true });
            }
            ClientEvent::Authenticated { user } => {
                tracing::info!(%user, "Calling client authenticated");
            }
            ClientEvent::AuthFailed(reason) => {
                tracing::error!(%reason, "Calling client authentication failed");
                self.notice(Notice::error("Could not sign in to the calling service"));
            }
            ClientEvent::Disconnected => {
                tracing::warn!("Calling client disconnected");
                self.emit(CallEvent::ClientConnection { connected: false });
            }
            ClientEvent::IncomingCall(incoming) => self.handle_incoming(incoming).await,
        }
    }

    #[tracing::instrument(skip(self, incoming), fields(caller = %incoming.from))]
    async fn handle_incoming(&self, incoming: IncomingSdkCall) {
        let caller = incoming.from.clone();
        if self.inner.presence.screen_incoming(&caller) == PresenceDecision::Busy {
            // a hint this call matches must not outlive it
            let _ = self.inner.router.take_hint(&caller);
            if let Err(e) = incoming.call.reject().await {
                tracing::warn!(error = %e, "Auto-reject failed");
            }
            return;
        }

        let hint = self.inner.router.take_hint(&caller);
        let announced = hint.is_some();
        let sdk_kind = CallKind::from_video_flag(incoming.is_video);
        let kind = match &hint {
            Some(hint) => {
                if hint.kind != sdk_kind {
                    tracing::debug!(
                        announced = hint.kind.as_str(),
                        sdk = sdk_kind.as_str(),
                        "Using the announced call type"
                    );
                }
                hint.kind
            }
            None => sdk_kind,
        };
        let (session_id, peer_name) = match hint {
            Some(hint) => (hint.session_id, hint.caller_name),
            None => (
                SessionId::fallback(CallDirection::Incoming, &caller, &self.inner.local.user_id),
                None,
            ),
        };

        match self.apply(CallInput::Incoming {
            session_id: session_id.clone(),
            peer: caller.clone(),
            peer_name,
            kind,
        }) {
            Ok(effects) => {
                tracing::info!(%session_id, kind = kind.as_str(), "Incoming call");
                self.attach_call(incoming.call);
                self.execute(effects).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Incoming call while the slot is taken, rejecting");
                self.inner.presence.record_busy(&caller);
                if announced && !self.has_active_session() {
                    // the reservation this call consumed still holds presence
                    self.inner.presence.set_in_call(false);
                }
                if let Err(e) = incoming.call.reject().await {
                    tracing::warn!(error = %e, "Reject failed");
                }
            }
        }
    }

    fn attach_call(&self, call: Arc<dyn SdkCall>) {
        let mut rx = call.subscribe();
        *self.inner.sdk_call.lock() = Some(call.clone());

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(controller) = Self::from_weak(&weak) else {
                            return;
                        };
                        if !controller.is_current_call(&call) {
                            return;
                        }
                        controller.handle_sdk_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "SDK events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        if let Some(previous) = self.inner.sdk_events.lock().replace(task) {
            previous.abort();
        }
    }

    fn is_current_call(&self, call: &Arc<dyn SdkCall>) -> bool {
        self.inner
            .sdk_call
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::as_ptr(c).cast::<()>() == Arc::as_ptr(call).cast::<()>())
    }

    fn detach_if_cleared(&self) {
        if self.inner.machine.lock().session().is_some() {
            return;
        }
        self.inner.sdk_call.lock().take();
        if let Some(task) = self.inner.sdk_events.lock().take() {
            task.abort();
        }
    }

    async fn handle_sdk_event(&self, event: SdkCallEvent) {
        match event {
            SdkCallEvent::AddLocalStream(stream) => {
                if self.has_active_session() {
                    self.inner.media.adopt_local(stream);
                } else {
                    let stopped = stream.stop_all();
                    tracing::debug!(stopped, "Late SDK local stream stopped");
                }
            }
            SdkCallEvent::AddRemoteStream(stream) => {
                let (has_audio, has_video) = self.inner.media.attach_remote(stream);
                self.drive_quiet(CallInput::RemoteMedia {
                    has_audio,
                    has_video,
                })
                .await;
            }
            SdkCallEvent::SignalingState(state) => {
                tracing::debug!(code = state.code, reason = %state.reason, "SDK signaling state");
                let input = match state.outcome() {
                    SignalingOutcome::Answered => CallInput::RemoteConnected,
                    SignalingOutcome::Rejected => CallInput::RemoteRejected,
                    SignalingOutcome::Ended => CallInput::RemoteEnded,
                    SignalingOutcome::Progress => return,
                };
                self.drive_quiet(input).await;
            }
            SdkCallEvent::MediaState { connected } => {
                tracing::debug!(connected, "SDK media state");
            }
            SdkCallEvent::Info(info) => {
                tracing::debug!(%info, "SDK info");
            }
            SdkCallEvent::Error(reason) => {
                // left to the user to hang up
                tracing::error!(%reason, "SDK call error");
            }
        }
    }

    fn execute(&self, effects: Vec<CallEffect>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for effect in effects {
                self.execute_one(effect).await;
            }
        })
    }

    async fn execute_one(&self, effect: CallEffect) {
        match effect {
            CallEffect::SetPresence(in_call) => self.inner.presence.set_in_call(in_call),
            CallEffect::StartRingtone => self.inner.cues.start(Cue::Ringtone),
            CallEffect::StartRingback => self.inner.cues.start(Cue::Ringback),
            CallEffect::StopCues { aggressive: true } => self.inner.cues.stop_all_aggressive(),
            CallEffect::StopCues { aggressive: false } => self.inner.cues.stop_all(),
            CallEffect::StartAnswerTimer { epoch } => self.start_answer_timer(epoch),
            CallEffect::CancelAnswerTimer => {
                if let Some((epoch, task)) = self.inner.answer_timer.lock().take() {
                    task.abort();
                    tracing::debug!(epoch, "Answer timer cancelled");
                }
            }
            CallEffect::SdkMakeCall => {
                if let Some(call) = self.current_call() {
                    if let Err(e) = call.make_call().await {
                        tracing::error!(error = %e, "makeCall failed");
                        self.notice(Notice::error("Could not place the call"));
                    }
                }
            }
            CallEffect::SdkAnswer => {
                if let Some(call) = self.current_call() {
                    if let Err(e) = call.answer().await {
                        tracing::error!(error = %e, "answer failed");
                    }
                }
            }
            CallEffect::SdkReject => {
                if let Some(call) = self.current_call() {
                    if let Err(e) = call.reject().await {
                        tracing::warn!(error = %e, "reject failed");
                    }
                }
            }
            CallEffect::SdkHangup => {
                if let Some(call) = self.current_call() {
                    if let Err(e) = call.hangup().await {
                        tracing::warn!(error = %e, "hangup failed");
                    }
                }
            }
            CallEffect::SdkUpgradeToVideo => {
                if let Some(call) = self.current_call() {
                    if let Err(e) = call.upgrade_to_video().await {
                        tracing::error!(error = %e, "upgradeToVideoCall failed");
                    }
                }
            }
            CallEffect::AcquireLocalMedia(kind) => match self.inner.media.acquire_local(kind).await
            {
                Ok(_) | Err(DeviceError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Local media unavailable");
                    self.notice(Notice::error(e.user_message(kind)));
                }
            },
            CallEffect::SetLocalVideo(enabled) => {
                match self.inner.media.set_video_enabled(enabled).await {
                    Ok(()) | Err(DeviceError::Cancelled) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Camera toggle failed");
                        self.notice(Notice::error(e.user_message(CallKind::Video)));
                    }
                }
            }
            CallEffect::SetMuted(muted) => self.inner.media.set_muted(muted),
            CallEffect::ReleaseLocalMedia => self.inner.media.release_all(),
            CallEffect::ScheduleMediaSweep => {
                let media = self.inner.media.clone();
                let delay = self.inner.config.media_sweep_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    media.sweep();
                });
            }
            CallEffect::UpdateBackendStatus { session_id, status } => {
                let update = StatusUpdate::now(session_id, status);
                if let Err(e) = self.inner.backend.update_call_status(update).await {
                    tracing::warn!(error = %e, ?status, "Status update failed");
                }
            }
            CallEffect::SaveHistory(record) => self.save_history(record).await,
            CallEffect::SendVideoUpgradeRequest { session_id, to } => {
                let from_name = self.inner.local.display_name();
                if let Err(e) = self
                    .inner
                    .backend
                    .send_video_upgrade_request(&session_id, &to, &from_name)
                    .await
                {
                    tracing::warn!(error = %e, "Video upgrade request failed");
                    self.notice(Notice::error("Could not send the video request"));
                }
            }
            CallEffect::RespondVideoUpgrade {
                session_id,
                accepted,
            } => {
                if let Err(e) = self
                    .inner
                    .backend
                    .respond_video_upgrade(&session_id, accepted)
                    .await
                {
                    tracing::warn!(error = %e, accepted, "Video upgrade response failed");
                }
            }
            CallEffect::SendVideoStatus {
                session_id,
                to,
                enabled,
            } => {
                if let Err(e) = self
                    .inner
                    .backend
                    .send_video_status(&session_id, &to, enabled)
                    .await
                {
                    tracing::warn!(error = %e, enabled, "Video status update failed");
                }
            }
            CallEffect::StartNetworkMonitor => self.start_network_monitor(),
            CallEffect::StopNetworkMonitor => {
                if let Some(task) = self.inner.stats_forwarder.lock().take() {
                    task.abort();
                }
                let was_running = self.inner.network.is_running();
                self.inner.network.stop();
                if was_running {
                    self.emit(CallEvent::NetworkStats(NetworkStats::default()));
                }
            }
            CallEffect::SettleEnding { epoch } => {
                let _ = self.apply(CallInput::EndingSettled { epoch });
            }
            CallEffect::Emit(event) => {
                if let CallEvent::StatusChanged { session_id, status } = &event {
                    tracing::info!(%session_id, ?status, "Call status changed");
                }
                self.emit(event);
            }
        }
    }

    fn start_answer_timer(&self, epoch: u64) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.answer_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(controller) = Self::from_weak(&weak) else {
                return;
            };
            {
                // drop our own handle so the teardown does not abort this task
                let mut timer = controller.inner.answer_timer.lock();
                if timer.as_ref().is_some_and(|(e, _)| *e == epoch) {
                    timer.take();
                }
            }
            tracing::info!(epoch, "Call not answered in time");
            controller
                .drive_quiet(CallInput::AnswerTimeout { epoch })
                .await;
        });
        if let Some((_, previous)) = self.inner.answer_timer.lock().replace((epoch, task)) {
            previous.abort();
        }
        tracing::debug!(epoch, timeout_ms = timeout.as_millis() as u64, "Answer timer armed");
    }

    fn start_network_monitor(&self) {
        self.inner.network.start(self.current_call());
        let mut rx = self.inner.network.subscribe();
        let events = self.inner.events.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let stats = rx.borrow_and_update().clone();
                if !stats.is_empty() {
                    let _ = events.send(CallEvent::NetworkStats(stats));
                }
            }
        });
        if let Some(previous) = self.inner.stats_forwarder.lock().replace(task) {
            previous.abort();
        }
    }

    /// Resolve the DM channel and post the history message
    ///
    /// A missing channel or a failed write releases the save claim.
    #[tracing::instrument(skip(self, record), fields(session_id = %record.session_id, status = ?record.status))]
    async fn save_history(&self, record: HistoryRecord) {
        let me = &self.inner.local.user_id;
        let (caller, callee) = match record.direction {
            CallDirection::Outgoing => (me, &record.peer),
            CallDirection::Incoming => (&record.peer, me),
        };
        let channel = match self.inner.backend.find_dm_channel(caller, callee).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                tracing::warn!("No DM channel for call history");
                self.history_failed(record.epoch);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "DM channel lookup failed");
                self.history_failed(record.epoch);
                return;
            }
        };
        let entry = CallHistoryEntry::new(
            channel,
            record.kind,
            record.status,
            record.duration_seconds,
        );
        match self.inner.backend.save_call_history(entry).await {
            Ok(()) => tracing::info!("Call history saved"),
            Err(e) => {
                tracing::warn!(error = %e, "Call history save failed");
                self.history_failed(record.epoch);
            }
        }
    }

    fn history_failed(&self, epoch: u64) {
        let _ = self.apply(CallInput::HistorySaveFailed { epoch });
    }
}
