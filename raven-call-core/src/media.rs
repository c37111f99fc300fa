//! Local and remote media lifecycle
//!
//! [`MediaLifecycleManager`] is the only writer of local capture state. It
//! hands out tracks through [`MediaDevices`], keeps one authoritative current
//! local stream, and records every track it ever handed out in a registry so
//! that a sweep can stop anything a caller lost track of.
//!
//! # Generations
//!
//! Capture is asynchronous. A release bumps the generation counter; an
//! acquisition that completes under an older generation is stopped
//! immediately instead of being installed, so a camera opened for a call
//! that already ended never stays live.

use crate::types::{CallKind, MediaConstraints};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Device access errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or platform denied access
    #[error("Device permission denied")]
    PermissionDenied,

    /// No matching capture device
    #[error("Device not found")]
    NotFound,

    /// The device exists but cannot be opened
    #[error("Device in use: {0}")]
    InUse(String),

    /// Any other capture failure
    #[error("Device error: {0}")]
    Other(String),

    /// The media was released while the capture was in flight
    #[error("Capture cancelled by release")]
    Cancelled,
}

impl DeviceError {
    /// Text shown to the user when a call cannot start
    pub fn user_message(&self, kind: CallKind) -> String {
        match (self, kind.is_video()) {
            (Self::PermissionDenied, true) => {
                "Allow camera and microphone access to make a video call".to_string()
            }
            (Self::PermissionDenied, false) => {
                "Allow microphone access to make a call".to_string()
            }
            (Self::NotFound, true) => "No camera or microphone found".to_string(),
            (Self::NotFound, false) => "No microphone found".to_string(),
            _ => "Cannot access the device. Please check your camera and microphone.".to_string(),
        }
    }
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or remote audio
    Audio,
    /// Camera or remote video
    Video,
}

/// Track ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Capturing or playing
    Live,
    /// Stopped for good
    Ended,
}

/// One capture or playback track
///
/// Shared between the device that produced it, the stream holding it and the
/// registry. Stopping is irreversible.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    enabled: AtomicBool,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4()),
            kind,
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        })
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Current ready state
    pub fn ready_state(&self) -> TrackState {
        if self.live.load(Ordering::SeqCst) {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }

    /// Whether the track is still live
    pub fn is_live(&self) -> bool {
        self.ready_state() == TrackState::Live
    }

    /// Stop the track. Returns true if it was live.
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    /// Whether the track is enabled (unmuted)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable without stopping
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Where a stream came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOrigin {
    /// Captured on this device
    Local,
    /// Supplied by the calling SDK
    Remote,
}

/// A set of tracks handled as one unit
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: String,
    origin: StreamOrigin,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStreamHandle {
    /// Wrap tracks into a stream
    pub fn new(origin: StreamOrigin, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local or remote
    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Whether the stream carries audio
    pub fn has_audio(&self) -> bool {
        self.tracks_of(TrackKind::Audio).next().is_some()
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    /// Whether any track is enabled
    pub fn enabled(&self) -> bool {
        self.tracks.iter().any(|t| t.is_enabled())
    }

    /// Stop every track, returning how many were live
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Capture device access (`getUserMedia`)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open capture devices matching the constraints
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, DeviceError>;
}

/// Playback surfaces a stream can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSink {
    /// Self-view
    LocalVideo,
    /// Peer video
    RemoteVideo,
    /// Peer audio
    RemoteAudio,
}

/// Media events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// A local stream became current
    StreamStarted {
        /// Stream identifier
        stream_id: String,
        /// Audio present
        has_audio: bool,
        /// Video present
        has_video: bool,
    },
    /// A local stream was released
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// A remote stream was attached
    RemoteAttached {
        /// Stream identifier
        stream_id: String,
    },
    /// A sweep found tracks that were still live
    Swept {
        /// Number of tracks stopped
        stopped: usize,
    },
}

#[derive(Default)]
struct MediaState {
    current_local: Option<MediaStreamHandle>,
    remote: Option<MediaStreamHandle>,
    sinks: HashMap<MediaSink, String>,
    registry: Vec<Arc<MediaTrack>>,
    generation: u64,
    muted: bool,
}

impl MediaState {
    fn register(&mut self, stream: &MediaStreamHandle) {
        for track in stream.tracks() {
            if !self.registry.iter().any(|t| t.id() == track.id()) {
                self.registry.push(track.clone());
            }
        }
    }
}

/// Single authority over local capture and playback sinks
pub struct MediaLifecycleManager {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<MediaState>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaLifecycleManager {
    /// Create a manager over the given devices
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            state: Mutex::new(MediaState::default()),
            event_sender,
        }
    }

    /// Check that the devices for a call of this kind can be opened
    ///
    /// Opens a throwaway stream, verifies the expected tracks are present and
    /// stops it again.
    ///
    /// # Errors
    ///
    /// Returns the device error, or `NotFound` if a required track is missing
    #[tracing::instrument(skip(self), fields(kind = kind.as_str()))]
    pub async fn preflight(&self, kind: CallKind) -> Result<(), DeviceError> {
        let stream = self.devices.get_user_media(kind.constraints()).await?;
        let complete = stream.has_audio() && (!kind.is_video() || stream.has_video());
        let stopped = stream.stop_all();
        tracing::debug!(stopped, complete, "Preflight stream released");
        if complete {
            Ok(())
        } else {
            Err(DeviceError::NotFound)
        }
    }

    /// Capture a new local stream and make it current
    ///
    /// The previous local stream, if any, is stopped first.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails, or `Cancelled` if the media was
    /// released while the capture was in flight
    #[tracing::instrument(skip(self), fields(kind = kind.as_str()))]
    pub async fn acquire_local(&self, kind: CallKind) -> Result<MediaStreamHandle, DeviceError> {
        let generation = self.state.lock().generation;
        let stream = self.devices.get_user_media(kind.constraints()).await?;

        let mut state = self.state.lock();
        state.register(&stream);
        if state.generation != generation {
            drop(state);
            let stopped = stream.stop_all();
            tracing::info!(stopped, "Capture completed after release, stopped");
            return Err(DeviceError::Cancelled);
        }

        if let Some(previous) = state.current_local.take() {
            let stopped = previous.stop_all();
            tracing::debug!(stream_id = previous.id(), stopped, "Replaced local stream");
        }
        let muted = state.muted;
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(!muted);
        }
        if stream.has_video() {
            state
                .sinks
                .insert(MediaSink::LocalVideo, stream.id().to_string());
        }
        state.current_local = Some(stream.clone());
        drop(state);

        tracing::info!(
            stream_id = stream.id(),
            has_audio = stream.has_audio(),
            has_video = stream.has_video(),
            "Local stream acquired"
        );
        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream.id().to_string(),
            has_audio: stream.has_audio(),
            has_video: stream.has_video(),
        });
        Ok(stream)
    }

    /// Take ownership of a local stream captured by the calling SDK
    ///
    /// The stream is registered and becomes current. Tracks of the previous
    /// stream that the adopted one does not share are stopped.
    pub fn adopt_local(&self, stream: MediaStreamHandle) {
        let mut state = self.state.lock();
        state.register(&stream);
        if let Some(current) = &state.current_local {
            if current.id() == stream.id() {
                return;
            }
        }
        if let Some(previous) = state.current_local.take() {
            // tracks shared with the adopted stream stay live
            for track in previous.tracks() {
                if !stream.tracks().iter().any(|t| t.id() == track.id()) {
                    track.stop();
                }
            }
        }
        let muted = state.muted;
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(!muted);
        }
        if stream.has_video() {
            state
                .sinks
                .insert(MediaSink::LocalVideo, stream.id().to_string());
        }
        tracing::debug!(stream_id = stream.id(), "Adopted SDK local stream");
        state.current_local = Some(stream);
    }

    /// Switch the local camera off or on, keeping the audio tracks
    ///
    /// Turning video off stops the video tracks. Turning it on captures a new
    /// video track and joins it with the existing audio tracks.
    ///
    /// # Errors
    ///
    /// Returns error if a new camera track cannot be captured
    #[tracing::instrument(skip(self))]
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), DeviceError> {
        if !enabled {
            let mut state = self.state.lock();
            if let Some(current) = state.current_local.take() {
                let mut stopped = 0;
                for track in current.tracks_of(TrackKind::Video) {
                    if track.stop() {
                        stopped += 1;
                    }
                }
                let audio: Vec<_> = current.tracks_of(TrackKind::Audio).cloned().collect();
                state.current_local = Some(MediaStreamHandle::new(StreamOrigin::Local, audio));
                tracing::debug!(stopped, "Local video stopped");
            }
            state.sinks.remove(&MediaSink::LocalVideo);
            return Ok(());
        }

        let has_audio = self
            .state
            .lock()
            .current_local
            .as_ref()
            .is_some_and(MediaStreamHandle::has_audio);
        if !has_audio {
            return self.acquire_local(CallKind::Video).await.map(|_| ());
        }

        let generation = self.state.lock().generation;
        let video = self
            .devices
            .get_user_media(MediaConstraints::video_only())
            .await?;

        let mut state = self.state.lock();
        state.register(&video);
        if state.generation != generation {
            drop(state);
            video.stop_all();
            return Err(DeviceError::Cancelled);
        }
        let mut tracks: Vec<_> = state
            .current_local
            .as_ref()
            .map(|s| s.tracks_of(TrackKind::Audio).cloned().collect())
            .unwrap_or_default();
        if let Some(previous) = state.current_local.take() {
            for track in previous.tracks_of(TrackKind::Video) {
                track.stop();
            }
        }
        tracks.extend(video.tracks_of(TrackKind::Video).cloned());
        let stream = MediaStreamHandle::new(StreamOrigin::Local, tracks);
        state
            .sinks
            .insert(MediaSink::LocalVideo, stream.id().to_string());
        state.current_local = Some(stream);
        tracing::debug!("Local video restarted");
        Ok(())
    }

    /// Mute or unmute the local audio tracks
    pub fn set_muted(&self, muted: bool) {
        let mut state = self.state.lock();
        state.muted = muted;
        if let Some(current) = &state.current_local {
            for track in current.tracks_of(TrackKind::Audio) {
                track.set_enabled(!muted);
            }
        }
    }

    /// Whether the microphone is muted
    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Attach the peer's stream to the remote sinks
    ///
    /// Returns whether the stream carries audio and video.
    pub fn attach_remote(&self, stream: MediaStreamHandle) -> (bool, bool) {
        let has_audio = stream.has_audio();
        let has_video = stream.has_video();
        let mut state = self.state.lock();
        if has_video {
            state
                .sinks
                .insert(MediaSink::RemoteVideo, stream.id().to_string());
        }
        if has_audio {
            state
                .sinks
                .insert(MediaSink::RemoteAudio, stream.id().to_string());
        }
        let stream_id = stream.id().to_string();
        state.remote = Some(stream);
        drop(state);

        tracing::info!(%stream_id, has_audio, has_video, "Remote stream attached");
        let _ = self.event_sender.send(MediaEvent::RemoteAttached { stream_id });
        (has_audio, has_video)
    }

    /// Stop the current local stream and detach every sink
    ///
    /// Also cancels captures still in flight. The remote stream is detached,
    /// never stopped; it belongs to the SDK.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.sinks.clear();
        state.remote = None;
        state.muted = false;
        let released = state.current_local.take();
        drop(state);

        if let Some(stream) = released {
            let stopped = stream.stop_all();
            tracing::info!(stream_id = stream.id(), stopped, "Local stream released");
            let _ = self.event_sender.send(MediaEvent::StreamStopped {
                stream_id: stream.id().to_string(),
            });
        }
    }

    /// Stop every registered track that is still live, outside the current stream
    ///
    /// Returns the number of tracks stopped. Ended tracks are pruned.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let current: Vec<String> = state
            .current_local
            .as_ref()
            .map(|s| s.tracks().iter().map(|t| t.id().to_string()).collect())
            .unwrap_or_default();
        let mut stopped = 0;
        for track in &state.registry {
            if !current.iter().any(|id| id == track.id()) && track.stop() {
                stopped += 1;
            }
        }
        state.registry.retain(|t| t.is_live());
        drop(state);

        if stopped > 0 {
            tracing::warn!(stopped, "Media sweep stopped orphaned tracks");
            let _ = self.event_sender.send(MediaEvent::Swept { stopped });
        } else {
            tracing::debug!("Media sweep found nothing live");
        }
        stopped
    }

    /// Number of local tracks handed out that are still live
    pub fn live_local_tracks(&self) -> usize {
        self.state
            .lock()
            .registry
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    /// The current local stream
    pub fn current_local(&self) -> Option<MediaStreamHandle> {
        self.state.lock().current_local.clone()
    }

    /// The attached remote stream
    pub fn remote(&self) -> Option<MediaStreamHandle> {
        self.state.lock().remote.clone()
    }

    /// Id of the stream attached to a sink
    pub fn attached(&self, sink: MediaSink) -> Option<String> {
        self.state.lock().sinks.get(&sink).cloned()
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDevices;

    fn manager() -> (Arc<LoopbackDevices>, MediaLifecycleManager) {
        let devices = Arc::new(LoopbackDevices::new());
        let manager = MediaLifecycleManager::new(devices.clone());
        (devices, manager)
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            DeviceError::NotFound.user_message(CallKind::Audio),
            "No microphone found"
        );
        assert_eq!(
            DeviceError::NotFound.user_message(CallKind::Video),
            "No camera or microphone found"
        );
        assert!(DeviceError::PermissionDenied
            .user_message(CallKind::Audio)
            .contains("microphone"));
    }

    #[tokio::test]
    async fn test_preflight_leaves_nothing_live() {
        let (devices, manager) = manager();
        manager.preflight(CallKind::Video).await.unwrap();
        assert_eq!(devices.live_tracks(), 0);
        assert!(manager.current_local().is_none());
    }

    #[tokio::test]
    async fn test_preflight_reports_missing_camera() {
        let (devices, manager) = manager();
        devices.set_has_camera(false);
        assert_eq!(
            manager.preflight(CallKind::Video).await,
            Err(DeviceError::NotFound)
        );
        manager.preflight(CallKind::Audio).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_replaces_previous_stream() {
        let (_devices, manager) = manager();
        let first = manager.acquire_local(CallKind::Audio).await.unwrap();
        let second = manager.acquire_local(CallKind::Video).await.unwrap();
        assert!(first.tracks().iter().all(|t| !t.is_live()));
        assert!(second.tracks().iter().all(|t| t.is_live()));
        assert_eq!(manager.live_local_tracks(), 2);
        assert_eq!(
            manager.attached(MediaSink::LocalVideo).as_deref(),
            Some(second.id())
        );
    }

    #[tokio::test]
    async fn test_release_stops_everything() {
        let (devices, manager) = manager();
        manager.acquire_local(CallKind::Video).await.unwrap();
        manager.release_all();
        assert_eq!(manager.live_local_tracks(), 0);
        assert_eq!(devices.live_tracks(), 0);
        assert!(manager.attached(MediaSink::LocalVideo).is_none());
    }

    #[tokio::test]
    async fn test_video_off_keeps_audio_track() {
        let (_devices, manager) = manager();
        let stream = manager.acquire_local(CallKind::Video).await.unwrap();
        let audio = stream.tracks_of(TrackKind::Audio).next().unwrap().clone();

        manager.set_video_enabled(false).await.unwrap();
        let current = manager.current_local().unwrap();
        assert!(!current.has_video());
        assert!(audio.is_live());
        assert_eq!(manager.live_local_tracks(), 1);

        manager.set_video_enabled(true).await.unwrap();
        let current = manager.current_local().unwrap();
        assert!(current.has_video());
        assert_eq!(current.tracks_of(TrackKind::Audio).next().unwrap().id(), audio.id());
    }

    #[tokio::test]
    async fn test_mute_applies_to_new_streams() {
        let (_devices, manager) = manager();
        let stream = manager.acquire_local(CallKind::Audio).await.unwrap();
        manager.set_muted(true);
        assert!(!stream.enabled());
        let next = manager.acquire_local(CallKind::Video).await.unwrap();
        assert!(next.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
        assert!(manager.is_muted());
    }

    #[tokio::test]
    async fn test_sweep_stops_tracks_outside_current_stream() {
        let (_devices, manager) = manager();
        let stream = manager.acquire_local(CallKind::Audio).await.unwrap();
        // lose the reference without releasing the tracks
        manager.state.lock().current_local = None;
        assert_eq!(manager.sweep(), 1);
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
        assert_eq!(manager.sweep(), 0);
    }

    #[tokio::test]
    async fn test_attach_remote_sets_sinks() {
        let (_devices, manager) = manager();
        let remote = MediaStreamHandle::new(
            StreamOrigin::Remote,
            vec![MediaTrack::new(TrackKind::Audio)],
        );
        assert_eq!(manager.attach_remote(remote.clone()), (true, false));
        assert_eq!(
            manager.attached(MediaSink::RemoteAudio).as_deref(),
            Some(remote.id())
        );
        assert!(manager.attached(MediaSink::RemoteVideo).is_none());
        manager.release_all();
        // remote tracks belong to the SDK
        assert!(remote.tracks()[0].is_live());
        assert!(manager.remote().is_none());
    }
}
