//! Call service tests: events flow from the loopback client and realtime
//! channel through the service loops into the controller

#![allow(clippy::unwrap_used)]

use raven_call_core::loopback::{LoopbackRealtime, LoopbackWorld, SdkAction};
use raven_call_core::signaling::{CallStatusUpdate, IncomingCallNotice};
use raven_call_core::{
    CallEvent, CallKind, CallService, CallStatus, RealtimeEvent, ServiceConfig, SessionId,
    SignalingHandler, UserId,
};
use std::sync::Arc;
use std::time::Duration;

async fn started(world: &LoopbackWorld) -> CallService<LoopbackRealtime> {
    let signaling = Arc::new(SignalingHandler::new(world.realtime.clone()));
    let service = CallService::builder(signaling, world.collaborators())
        .with_config(ServiceConfig::default())
        .build()
        .await
        .unwrap();
    service.start().await.unwrap();
    service
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_announced_incoming_call_is_answered() {
    let world = LoopbackWorld::new("alice");
    let service = started(&world).await;
    let controller = service.controller().clone();

    world
        .realtime
        .publish(RealtimeEvent::IncomingCall(IncomingCallNotice {
            callee_id: UserId::new("alice"),
            call_type: CallKind::Audio,
            session_id: SessionId::new("call_3"),
            caller_name: Some("Bob".to_string()),
            caller_id: Some(UserId::new("bob")),
        }));
    assert!(wait_for(|| controller.presence().is_in_call()).await);

    let call = world.client.ring("bob", false);
    assert!(wait_for(|| controller.session().is_some()).await);
    assert_eq!(controller.session_id(), Some(SessionId::new("call_3")));

    controller.answer().await.unwrap();
    assert_eq!(controller.status(), Some(CallStatus::Connected));
    assert_eq!(call.actions(), vec![SdkAction::Answer]);

    world
        .realtime
        .publish(RealtimeEvent::CallStatusUpdate(CallStatusUpdate {
            session_id: SessionId::new("call_3"),
            status: "ended".to_string(),
            answered_at: None,
            end_time: None,
        }));
    assert!(wait_for(|| controller.status() == Some(CallStatus::Ended)).await);
    assert_eq!(world.devices.live_tracks(), 0);
}

#[tokio::test]
async fn test_sdk_hangup_signal_ends_call() {
    let world = LoopbackWorld::new("alice");
    let service = started(&world).await;
    let controller = service.controller().clone();

    controller
        .dial(&UserId::new("bob"), None, CallKind::Audio)
        .await
        .unwrap();
    let call = world.client.last_call().unwrap();
    call.signal(3, "Answered");
    assert!(wait_for(|| controller.status() == Some(CallStatus::Connected)).await);

    call.deliver_remote(true, false);
    call.signal(6, "Ended");
    assert!(wait_for(|| controller.status() == Some(CallStatus::Ended)).await);
    assert!(!controller.presence().is_in_call());
}

#[tokio::test]
async fn test_client_disconnect_is_reported() {
    let world = LoopbackWorld::new("alice");
    let service = started(&world).await;
    let mut events = service.subscribe_events();

    world.client.disconnect();
    let mut saw_disconnect = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(CallEvent::ClientConnection { connected: false })) => {
                saw_disconnect = true;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_disconnect);

    service.stop();
    assert!(!service.is_running());
}
