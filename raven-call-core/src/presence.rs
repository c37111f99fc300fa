//! Process-wide call presence
//!
//! Tracks whether the user is in a call, auto-rejects further incoming calls
//! while they are, remembers who called meanwhile, and offers to rejoin a
//! call abandoned by a reload.

use crate::backend::CallBackend;
use crate::identity::UserId;
use crate::types::{CallEvent, Notice, OngoingCall, SessionId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Whether an incoming call may ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDecision {
    /// Show the call
    Ring,
    /// Auto-reject; the caller was recorded as missed
    Busy,
}

/// Presence held for a caller announced ahead of the SDK call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Announced caller; `None` when the notification did not name one
    pub caller: Option<UserId>,
    /// Announced session
    pub session_id: SessionId,
}

#[derive(Debug, Default)]
struct PresenceState {
    in_call: bool,
    reservation: Option<Reservation>,
    missed: Vec<UserId>,
    pending_rejoin: Option<OngoingCall>,
}

/// Single owner of the in-call flag and the missed-call list
pub struct GlobalCallPresenceManager {
    backend: Arc<dyn CallBackend>,
    state: Mutex<PresenceState>,
    events: broadcast::Sender<CallEvent>,
}

impl GlobalCallPresenceManager {
    /// Create an idle presence manager publishing to `events`
    pub fn new(backend: Arc<dyn CallBackend>, events: broadcast::Sender<CallEvent>) -> Self {
        Self {
            backend,
            state: Mutex::new(PresenceState::default()),
            events,
        }
    }

    /// Whether the user is in a call
    pub fn is_in_call(&self) -> bool {
        self.state.lock().in_call
    }

    /// Set the in-call flag
    ///
    /// Clearing it drops any reservation and, when callers are waiting for a
    /// call back, publishes a reminder.
    pub fn set_in_call(&self, in_call: bool) {
        let mut state = self.state.lock();
        let was = state.in_call;
        state.in_call = in_call;
        if in_call {
            drop(state);
            if !was {
                tracing::debug!("Presence: in call");
            }
            return;
        }
        state.reservation = None;
        let callers = state.missed.clone();
        drop(state);

        if was {
            tracing::debug!("Presence: available");
        }
        if was && !callers.is_empty() {
            tracing::info!(count = callers.len(), "Reminding about missed callers");
            let _ = self.events.send(CallEvent::CallbackReminder { callers });
        }
    }

    fn is_reserved_for(state: &PresenceState, caller: &UserId) -> bool {
        state
            .reservation
            .as_ref()
            .is_some_and(|r| r.caller.as_ref().map_or(true, |c| c == caller))
    }

    fn record_missed(&self, state: &mut PresenceState, caller: &UserId) {
        if !state.missed.contains(caller) {
            state.missed.push(caller.clone());
        }
        let _ = self.events.send(CallEvent::MissedWhileBusy {
            caller: caller.clone(),
        });
        let _ = self.events.send(CallEvent::Notice(Notice::warning(format!(
            "{caller} called while you were in another call"
        ))));
    }

    /// Decide whether an incoming SDK call may ring
    ///
    /// Busy callers are recorded synchronously, before any UI is shown.
    #[tracing::instrument(skip(self), fields(caller = %caller))]
    pub fn screen_incoming(&self, caller: &UserId) -> PresenceDecision {
        let mut state = self.state.lock();
        if !state.in_call {
            return PresenceDecision::Ring;
        }
        if Self::is_reserved_for(&state, caller) {
            // the announced call has rung; presence now belongs to its session
            if let Some(reservation) = state.reservation.take() {
                tracing::debug!(session_id = %reservation.session_id, "Presence reservation consumed");
            }
            return PresenceDecision::Ring;
        }
        self.record_missed(&mut state, caller);
        tracing::info!("Auto-rejecting call while busy");
        PresenceDecision::Busy
    }

    /// Record a caller rejected because the call slot was still taken
    ///
    /// Covers calls that pass screening but cannot be installed, e.g. while
    /// the previous session is still tearing down.
    #[tracing::instrument(skip(self), fields(caller = %caller))]
    pub fn record_busy(&self, caller: &UserId) {
        let mut state = self.state.lock();
        self.record_missed(&mut state, caller);
        tracing::info!("Rejecting call while the call slot is taken");
    }

    /// Hold presence for a caller announced by the `incoming_call` topic
    ///
    /// Returns `Busy` if another call already holds presence; a named caller
    /// is then recorded as missed.
    pub fn reserve(&self, caller: Option<&UserId>, session_id: &SessionId) -> PresenceDecision {
        let mut state = self.state.lock();
        if state.in_call {
            let same_caller = match caller {
                Some(caller) => Self::is_reserved_for(&state, caller),
                None => state
                    .reservation
                    .as_ref()
                    .is_some_and(|r| &r.session_id == session_id),
            };
            if !same_caller {
                if let Some(caller) = caller {
                    self.record_missed(&mut state, caller);
                }
                return PresenceDecision::Busy;
            }
        }
        state.in_call = true;
        state.reservation = Some(Reservation {
            caller: caller.cloned(),
            session_id: session_id.clone(),
        });
        tracing::debug!(?caller, %session_id, "Presence reserved");
        PresenceDecision::Ring
    }

    /// Drop the reservation for a session that ended before it rang
    ///
    /// Returns true if a reservation was released.
    pub fn release_reservation(&self, session_id: &SessionId) -> bool {
        let matches = self
            .state
            .lock()
            .reservation
            .as_ref()
            .is_some_and(|r| &r.session_id == session_id);
        if matches {
            tracing::debug!(%session_id, "Presence reservation released");
            self.set_in_call(false);
        }
        matches
    }

    /// Current reservation
    pub fn reservation(&self) -> Option<Reservation> {
        self.state.lock().reservation.clone()
    }

    /// Callers recorded while busy
    pub fn missed_calls(&self) -> Vec<UserId> {
        self.state.lock().missed.clone()
    }

    /// Forget a missed caller. Returns true if it was recorded.
    pub fn dismiss_missed(&self, caller: &UserId) -> bool {
        let mut state = self.state.lock();
        let before = state.missed.len();
        state.missed.retain(|c| c != caller);
        before != state.missed.len()
    }

    /// Ask the backend for a call this user abandoned and offer to rejoin it
    #[tracing::instrument(skip(self))]
    pub async fn check_ongoing(&self) -> Option<OngoingCall> {
        match self.backend.check_ongoing_calls().await {
            Ok(Some(call)) => {
                tracing::info!(session_id = %call.session_id, peer = %call.peer, "Found ongoing call");
                self.state.lock().pending_rejoin = Some(call.clone());
                let _ = self.events.send(CallEvent::RejoinOffer(call.clone()));
                Some(call)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Ongoing call check failed");
                None
            }
        }
    }

    /// The rejoin offer, if one is open
    pub fn pending_rejoin(&self) -> Option<OngoingCall> {
        self.state.lock().pending_rejoin.clone()
    }

    /// Accept the rejoin offer, handing it to the caller
    pub fn take_rejoin(&self) -> Option<OngoingCall> {
        self.state.lock().pending_rejoin.take()
    }

    /// Decline the rejoin offer and reset presence
    ///
    /// Returns false if there was no offer.
    #[tracing::instrument(skip(self))]
    pub async fn decline_rejoin(&self) -> bool {
        let Some(call) = self.take_rejoin() else {
            return false;
        };
        if let Err(e) = self.backend.decline_rejoin(&call.session_id).await {
            tracing::warn!(session_id = %call.session_id, error = %e, "Decline rejoin failed");
        }
        self.set_in_call(false);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{BackendRequest, LoopbackBackend};
    use crate::types::CallKind;
    use pretty_assertions::assert_eq;

    fn presence() -> (
        Arc<LoopbackBackend>,
        GlobalCallPresenceManager,
        broadcast::Receiver<CallEvent>,
    ) {
        let backend = Arc::new(LoopbackBackend::new("me"));
        let (tx, rx) = broadcast::channel(64);
        let presence = GlobalCallPresenceManager::new(backend.clone(), tx);
        (backend, presence, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_busy_caller_is_recorded() {
        let (_backend, presence, mut rx) = presence();
        assert_eq!(
            presence.screen_incoming(&UserId::new("carol")),
            PresenceDecision::Ring
        );
        presence.set_in_call(true);
        assert_eq!(
            presence.screen_incoming(&UserId::new("carol")),
            PresenceDecision::Busy
        );
        presence.screen_incoming(&UserId::new("carol"));
        assert_eq!(presence.missed_calls(), vec![UserId::new("carol")]);
        assert!(drain(&mut rx).contains(&CallEvent::MissedWhileBusy {
            caller: UserId::new("carol")
        }));
    }

    #[test]
    fn test_reminder_when_call_ends() {
        let (_backend, presence, mut rx) = presence();
        presence.set_in_call(true);
        presence.screen_incoming(&UserId::new("dave"));
        drain(&mut rx);

        presence.set_in_call(false);
        assert_eq!(
            drain(&mut rx),
            vec![CallEvent::CallbackReminder {
                callers: vec![UserId::new("dave")]
            }]
        );
        assert!(presence.dismiss_missed(&UserId::new("dave")));
        assert!(presence.missed_calls().is_empty());
    }

    #[test]
    fn test_reservation_lets_announced_caller_ring() {
        let (_backend, presence, _rx) = presence();
        let session = SessionId::new("call_1");
        assert_eq!(
            presence.reserve(Some(&UserId::new("erin")), &session),
            PresenceDecision::Ring
        );
        assert!(presence.is_in_call());
        assert_eq!(
            presence.screen_incoming(&UserId::new("frank")),
            PresenceDecision::Busy
        );
        assert_eq!(
            presence.screen_incoming(&UserId::new("erin")),
            PresenceDecision::Ring
        );
        assert!(presence.reservation().is_none());
        assert!(presence.is_in_call());
    }

    #[test]
    fn test_unreleased_reservation_can_be_released() {
        let (_backend, presence, _rx) = presence();
        let session = SessionId::new("call_1");
        presence.reserve(Some(&UserId::new("erin")), &session);

        assert!(!presence.release_reservation(&SessionId::new("other")));
        assert!(presence.release_reservation(&session));
        assert!(!presence.is_in_call());
    }

    #[test]
    fn test_unnamed_reservation_is_consumed_by_first_ring() {
        let (_backend, presence, mut rx) = presence();
        presence.reserve(None, &SessionId::new("call_7"));
        assert_eq!(
            presence.screen_incoming(&UserId::new("bob")),
            PresenceDecision::Ring
        );
        assert!(presence.reservation().is_none());

        assert_eq!(
            presence.screen_incoming(&UserId::new("carol")),
            PresenceDecision::Busy
        );
        assert_eq!(presence.missed_calls(), vec![UserId::new("carol")]);
        assert!(drain(&mut rx).contains(&CallEvent::MissedWhileBusy {
            caller: UserId::new("carol")
        }));
    }

    #[test]
    fn test_record_busy_notifies_without_presence() {
        let (_backend, presence, mut rx) = presence();
        presence.record_busy(&UserId::new("gina"));
        assert_eq!(presence.missed_calls(), vec![UserId::new("gina")]);
        let events = drain(&mut rx);
        assert!(events.contains(&CallEvent::MissedWhileBusy {
            caller: UserId::new("gina")
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, CallEvent::Notice(_))));
    }

    #[tokio::test]
    async fn test_rejoin_offer_and_decline() {
        let (backend, presence, mut rx) = presence();
        let ongoing = OngoingCall {
            session_id: SessionId::new("call_old"),
            peer: UserId::new("gina"),
            peer_name: None,
            kind: CallKind::Audio,
        };
        backend.set_ongoing(Some(ongoing.clone()));

        assert_eq!(presence.check_ongoing().await, Some(ongoing.clone()));
        assert_eq!(drain(&mut rx), vec![CallEvent::RejoinOffer(ongoing)]);

        presence.set_in_call(true);
        assert!(presence.decline_rejoin().await);
        assert!(!presence.is_in_call());
        assert!(presence.pending_rejoin().is_none());
        assert!(backend
            .requests()
            .contains(&BackendRequest::DeclineRejoin(SessionId::new("call_old"))));
        assert!(!presence.decline_rejoin().await);
    }
}
