//! Call service orchestration
//!
//! [`CallService`] wires a [`CallSessionController`] to its event sources:
//! it fetches the SDK credentials, connects the calling client, pumps client
//! events and realtime signaling into the controller, and looks for an
//! abandoned call to offer for rejoin.

use crate::backend::{BackendError, CallCredentials};
use crate::config::ServiceConfig;
use crate::controller::{CallSessionController, Collaborators};
use crate::sdk::SdkError;
use crate::signaling::{RealtimeTransport, SignalingHandler};
use crate::types::{CallEvent, OngoingCall};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Credentials could not be fetched
    #[error("Initialization error: {0}")]
    InitError(#[from] BackendError),

    /// The calling client could not connect
    #[error("Calling client error: {0}")]
    Client(#[from] SdkError),

    /// `start` was called twice
    #[error("Service already started")]
    AlreadyStarted,
}

/// Main call service
pub struct CallService<T: RealtimeTransport + 'static> {
    signaling: Arc<SignalingHandler<T>>,
    collaborators: Collaborators,
    credentials: CallCredentials,
    controller: CallSessionController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: RealtimeTransport + 'static> CallService<T> {
    /// Create the service for the user the backend issues credentials to
    ///
    /// # Errors
    ///
    /// Returns error if the credentials cannot be fetched
    pub async fn new(
        signaling: Arc<SignalingHandler<T>>,
        collaborators: Collaborators,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let credentials = collaborators.backend.get_call_credentials().await?;
        tracing::debug!(user = %credentials.user.user_id, "Call credentials fetched");
        let controller = CallSessionController::new(
            credentials.user.clone(),
            collaborators.clone(),
            &config,
        );
        Ok(Self {
            signaling,
            collaborators,
            credentials,
            controller,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect the calling client and start pumping events
    ///
    /// Returns the abandoned call offered for rejoin, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the client cannot connect or the service is running
    #[tracing::instrument(skip(self), fields(user = %self.credentials.user.user_id))]
    pub async fn start(&self) -> Result<Option<OngoingCall>, ServiceError> {
        if !self.tasks.lock().is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }
        tracing::info!("Starting call service");

        // subscribe first so the connection events are not missed
        let mut client_events = self.collaborators.client.subscribe();
        let controller = self.controller.clone();
        let client_task = tokio::spawn(async move {
            loop {
                match client_events.recv().await {
                    Ok(event) => controller.handle_client_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Client events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let signaling = self.signaling.clone();
        let controller = self.controller.clone();
        let signaling_task = tokio::spawn(async move {
            loop {
                match signaling.receive_event().await {
                    Ok(event) => controller.handle_realtime(event).await,
                    Err(e) => tracing::debug!(error = %e, "Realtime receive failed"),
                }
            }
        });
        self.tasks.lock().extend([client_task, signaling_task]);

        if let Err(e) = self
            .collaborators
            .client
            .connect(&self.credentials.token)
            .await
        {
            tracing::error!(error = %e, "Calling client failed to connect");
            self.stop();
            return Err(e.into());
        }

        let ongoing = self.controller.presence().check_ongoing().await;
        tracing::info!(rejoin_offered = ongoing.is_some(), "Call service started");
        Ok(ongoing)
    }

    /// Stop pumping events
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Whether `start` succeeded and `stop` has not been called
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// The call controller
    #[must_use]
    pub fn controller(&self) -> &CallSessionController {
        &self.controller
    }

    /// Credentials the service runs with
    #[must_use]
    pub fn credentials(&self) -> &CallCredentials {
        &self.credentials
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.controller.subscribe_events()
    }

    /// Create a builder
    #[must_use]
    pub fn builder(
        signaling: Arc<SignalingHandler<T>>,
        collaborators: Collaborators,
    ) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(signaling, collaborators)
    }
}

impl<T: RealtimeTransport + 'static> Drop for CallService<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: RealtimeTransport + 'static> {
    signaling: Arc<SignalingHandler<T>>,
    collaborators: Collaborators,
    config: ServiceConfig,
}

impl<T: RealtimeTransport + 'static> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(signaling: Arc<SignalingHandler<T>>, collaborators: Collaborators) -> Self {
        Self {
            signaling,
            collaborators,
            config: ServiceConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if service creation fails
    pub async fn build(self) -> Result<CallService<T>, ServiceError> {
        CallService::new(self.signaling, self.collaborators, self.config).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::loopback::{LoopbackRealtime, LoopbackWorld};
    use crate::signaling::{CallStatusUpdate, RealtimeEvent};
    use crate::types::{CallKind, SessionId};
    use pretty_assertions::assert_eq;

    async fn service(world: &LoopbackWorld) -> CallService<LoopbackRealtime> {
        let signaling = Arc::new(SignalingHandler::new(world.realtime.clone()));
        CallService::builder(signaling, world.collaborators())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_connects_and_reports_connection() {
        let world = LoopbackWorld::new("alice");
        let service = service(&world).await;
        let mut events = service.subscribe_events();

        assert_eq!(service.start().await.unwrap(), None);
        assert!(world.client.is_connected());
        assert!(service.is_running());
        assert_eq!(
            events.recv().await.unwrap(),
            CallEvent::ClientConnection { connected: true }
        );
        assert!(matches!(
            service.start().await,
            Err(ServiceError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_offers_rejoin() {
        let world = LoopbackWorld::new("alice");
        let ongoing = OngoingCall {
            session_id: SessionId::new("call_7"),
            peer: UserId::new("bob"),
            peer_name: Some("Bob".to_string()),
            kind: CallKind::Video,
        };
        world.backend.set_ongoing(Some(ongoing.clone()));
        let service = service(&world).await;

        assert_eq!(service.start().await.unwrap(), Some(ongoing.clone()));
        assert_eq!(service.controller().presence().pending_rejoin(), Some(ongoing));
    }

    #[tokio::test]
    async fn test_realtime_events_reach_the_controller() {
        let world = LoopbackWorld::new("alice");
        let service = service(&world).await;
        service.start().await.unwrap();

        let session_id = service
            .controller()
            .dial(&UserId::new("bob"), None, CallKind::Audio)
            .await
            .unwrap();
        world
            .realtime
            .publish(RealtimeEvent::CallStatusUpdate(CallStatusUpdate {
                session_id,
                status: "connected".to_string(),
                answered_at: None,
                end_time: None,
            }));

        let mut connected = false;
        for _ in 0..50 {
            if service.controller().status() == Some(crate::types::CallStatus::Connected) {
                connected = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(connected);
    }
}
