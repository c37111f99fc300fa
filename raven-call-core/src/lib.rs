//! Raven Call - call session coordination for the Raven chat client
//!
//! This library coordinates one-to-one voice and video calls on top of an
//! external WebRTC calling SDK and the chat backend's realtime channel. It
//! features:
//!
//! - **Single call slot**: a pure state machine drives every call, whether
//!   the input is a button press, a signaling event, an SDK callback or a timer
//! - **Idempotent convergence**: local answer and remote confirmation meet in
//!   `connected` exactly once; history is saved at most once per session
//! - **Owned media**: every captured track is registered and stopped on every
//!   exit path
//! - **Presence**: calls arriving while busy are auto-rejected and remembered
//!   for a call back
//!
//! # Examples
//!
//! ```rust,no_run
//! use raven_call_core::loopback::LoopbackWorld;
//! use raven_call_core::{CallKind, CallService, SignalingHandler, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let world = LoopbackWorld::new("alice");
//! let signaling = Arc::new(SignalingHandler::new(world.realtime.clone()));
//!
//! let service = CallService::builder(signaling, world.collaborators())
//!     .build()
//!     .await?;
//! service.start().await?;
//!
//! let session_id = service
//!     .controller()
//!     .dial(&UserId::new("bob"), None, CallKind::Audio)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// User identity
pub mod identity;

/// Call session state machine
pub mod machine;

/// Call session controller
pub mod controller;

/// Service orchestration and builder
pub mod service;

/// Chat backend RPC surface
pub mod backend;

/// Calling SDK surface
pub mod sdk;

/// Local and remote media lifecycle
pub mod media;

/// Ringtone and ringback cues
pub mod cues;

/// Network quality monitoring
pub mod network;

/// Process-wide call presence
pub mod presence;

/// Realtime signaling events and routing
pub mod signaling;

/// Service configuration
pub mod config;

/// In-memory collaborators for tests and simulations
pub mod loopback;

// Re-export main types at crate root
pub use backend::{BackendError, CallBackend, CallCredentials, CallHistoryEntry, ChannelId};
pub use config::{CallConfig, ConfigError, CueConfig, NetworkMonitorConfig, ServiceConfig};
pub use controller::{CallError, CallSessionController, Collaborators};
pub use cues::{AudioCueManager, Cue, CueError, CueOutput, CuePlayer};
pub use identity::{LocalUser, UserId};
pub use machine::{CallEffect, CallInput, CallMachine, TransitionError};
pub use media::{
    DeviceError, MediaDevices, MediaEvent, MediaLifecycleManager, MediaSink, MediaStreamHandle,
    MediaTrack, TrackKind,
};
#[cfg(feature = "http-probe")]
pub use network::HttpLatencyProbe;
pub use network::{LatencyProbe, NetworkInfo, NetworkQualityMonitor, ProbeError};
pub use presence::{GlobalCallPresenceManager, PresenceDecision};
pub use sdk::{CallingClient, ClientEvent, SdkCall, SdkCallEvent, SdkError};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{RealtimeEvent, RealtimeTransport, SignalingEventRouter, SignalingHandler};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ServiceConfig;
    pub use crate::controller::{CallError, CallSessionController, Collaborators};
    pub use crate::identity::{LocalUser, UserId};
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{RealtimeEvent, RealtimeTransport, SignalingHandler};
    pub use crate::types::{
        CallDirection, CallEvent, CallKind, CallSession, CallStatus, NetworkStats, SessionId,
    };
}
