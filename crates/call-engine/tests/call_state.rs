//! Live call state and the event projector over the in-memory stores

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::memory_bus;
use rdial_call_engine::call_state::{
    CallState, CallStateCoordinator, CallStateProjector, CallStateStore, CallStateUpdate, ParticipantRole,
    PROJECTOR_GROUP,
};
use rdial_call_engine::metadata::CallMetadata;
use rdial_call_engine::store::{CallStore, MemoryCallStore};
use rdial_call_engine::types::{CallDirection, CallStatus};
use rdial_event_bus::{channels, names, Event, EventHandler, MemoryStore, NewEvent};
use serde_json::json;

fn coordinator() -> (CallStateCoordinator, Arc<MemoryCallStore>) {
    let calls = Arc::new(MemoryCallStore::new());
    let states = CallStateStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600));
    (CallStateCoordinator::new(states, calls.clone()), calls)
}

fn event_at(name: &str, data: serde_json::Value, secs: i64) -> Event {
    let mut event = Event::stamp(NewEvent::new(name, "tenant-1", data));
    event.timestamp = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
    event
}

fn initiated(call_id: &str) -> Event {
    event_at(
        names::CALL_INITIATED,
        json!({
            "callId": call_id,
            "leadId": "lead-1",
            "campaignId": "camp-1",
            "phoneNumber": "+15551234567",
            "direction": "outbound",
        }),
        0,
    )
}

#[tokio::test]
async fn test_hold_flag_merges_into_existing_metadata() {
    let (coordinator, _) = coordinator();
    let state = CallState::new("c-1", "tenant-1", CallStatus::Answered).with_metadata(
        CallMetadata::new()
            .with_screen_pop(json!({ "name": "Ada Lovelace" }))
            .with_extra("crmTicket", json!(4711)),
    );
    coordinator.set_call_state(&state).await.unwrap();

    coordinator
        .update_call_state("c-1", CallStateUpdate::metadata(CallMetadata::new().with_hold(true)))
        .await
        .unwrap();

    let stored = coordinator.get_call_state("c-1").await.unwrap().unwrap();
    assert!(stored.metadata.on_hold());
    assert_eq!(stored.metadata.screen_pop, Some(json!({ "name": "Ada Lovelace" })));
    assert_eq!(stored.metadata.extra.get("crmTicket"), Some(&json!(4711)));
}

#[tokio::test]
async fn test_lifecycle_projection_is_idempotent() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator.clone());

    let events = vec![
        initiated("c-1"),
        event_at(names::CALL_ANSWERED, json!({ "callId": "c-1" }), 5),
        event_at(
            names::CALL_TRANSFERRED,
            json!({ "callId": "c-1", "destination": "queue-default" }),
            20,
        ),
        event_at(
            names::CALL_ENDED,
            json!({ "callId": "c-1", "disposition": "TRANSFERRED" }),
            65,
        ),
    ];

    // every event delivered twice, as after a redelivery
    for event in events.iter().chain(events.iter()) {
        projector.handle(event).await.unwrap();
    }

    assert_eq!(calls.len(), 1);
    let record = calls.get("c-1").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert_eq!(record.direction, CallDirection::Outbound);
    assert_eq!(record.answered_at, Some(Utc.timestamp_opt(1_700_000_005, 0).unwrap()));
    assert_eq!(record.ended_at, Some(Utc.timestamp_opt(1_700_000_065, 0).unwrap()));
    assert_eq!(record.duration, Some(60));
    assert_eq!(record.metadata.lead_id.as_deref(), Some("lead-1"));
    assert_eq!(record.metadata.disposition.as_deref(), Some("TRANSFERRED"));
    assert_eq!(
        record.metadata.transfer.as_ref().map(|t| t.destination.as_str()),
        Some("queue-default")
    );

    let state = coordinator.get_call_state("c-1").await.unwrap().unwrap();
    assert_eq!(state.status, CallStatus::Completed);
    assert!(state
        .participants
        .iter()
        .any(|p| p.role == ParticipantRole::Callee && p.number == "+15551234567"));
}

#[tokio::test]
async fn test_failed_call_without_record_is_acknowledged() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator);

    let failed = event_at(
        names::CALL_FAILED,
        json!({ "callId": "never-created", "reason": "USER_BUSY" }),
        0,
    );
    projector.handle(&failed).await.unwrap();

    assert_eq!(calls.len(), 0);
}

#[tokio::test]
async fn test_answer_ahead_of_initiated_keeps_its_timing() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator.clone());

    let answered = event_at(
        names::CALL_ANSWERED,
        json!({ "callId": "c-2", "leadId": "lead-1", "campaignId": "camp-1" }),
        5,
    );
    projector.handle(&answered).await.unwrap();
    let placeholder = calls.get("c-2").await.unwrap().unwrap();
    assert_eq!(placeholder.status, CallStatus::Answered);
    assert_eq!(placeholder.to_number, "");

    projector.handle(&initiated("c-2")).await.unwrap();
    let state = coordinator.get_call_state("c-2").await.unwrap().unwrap();
    assert_eq!(state.status, CallStatus::Answered);
    assert!(state.participants.iter().any(|p| p.number == "+15551234567"));

    projector
        .handle(&event_at(names::CALL_ENDED, json!({ "callId": "c-2" }), 65))
        .await
        .unwrap();

    assert_eq!(calls.len(), 1);
    let record = calls.get("c-2").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert_eq!(record.to_number, "+15551234567");
    assert_eq!(record.campaign_id.as_deref(), Some("camp-1"));
    assert_eq!(record.metadata.lead_id.as_deref(), Some("lead-1"));
    assert_eq!(record.metadata.originated_by.as_deref(), Some("dialer"));
    assert_eq!(record.answered_at, Some(Utc.timestamp_opt(1_700_000_005, 0).unwrap()));
    assert_eq!(record.duration, Some(60));
}

#[tokio::test]
async fn test_transfer_ahead_of_initiated_is_kept() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator);

    projector
        .handle(&event_at(
            names::CALL_TRANSFERRED,
            json!({ "callId": "c-3", "destination": "queue-sales", "transferType": "warm" }),
            10,
        ))
        .await
        .unwrap();
    projector.handle(&initiated("c-3")).await.unwrap();

    let record = calls.get("c-3").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Initiated);
    assert_eq!(record.to_number, "+15551234567");
    assert_eq!(
        record.metadata.transfer.as_ref().map(|t| t.destination.as_str()),
        Some("queue-sales")
    );
}

#[tokio::test]
async fn test_malformed_event_is_dropped() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator);

    let no_number = event_at(names::CALL_INITIATED, json!({ "callId": "c-9" }), 0);
    projector.handle(&no_number).await.unwrap();
    let bad_direction = event_at(
        names::CALL_INITIATED,
        json!({ "callId": "c-9", "phoneNumber": "+1555", "direction": "sideways" }),
        0,
    );
    projector.handle(&bad_direction).await.unwrap();

    assert_eq!(calls.len(), 0);
}

#[tokio::test]
async fn test_live_state_rebuilt_after_expiry() {
    let (coordinator, calls) = coordinator();
    let projector = CallStateProjector::new(coordinator.clone());
    projector.handle(&initiated("c-1")).await.unwrap();

    coordinator.remove_call_state("c-1").await.unwrap();
    assert!(coordinator.get_call_state("c-1").await.unwrap().is_none());

    let state = coordinator.live_state("c-1").await.unwrap().unwrap();
    assert_eq!(state.status, CallStatus::Initiated);
    assert_eq!(state.metadata.campaign_id.as_deref(), Some("camp-1"));
    assert!(coordinator.get_call_state("c-1").await.unwrap().is_some());
    assert_eq!(calls.len(), 1);
}

#[tokio::test]
async fn test_projector_follows_the_bus() {
    let (bus, _) = memory_bus();
    bus.initialize().await.unwrap();
    let (coordinator, calls) = coordinator();

    let subscription = bus
        .subscribe_in_group(
            PROJECTOR_GROUP,
            channels::CALL,
            CallStateProjector::new(coordinator.clone()),
            "projector-1",
        )
        .await
        .unwrap();

    let publish = |name: &'static str, data: serde_json::Value| {
        let bus = bus.clone();
        async move { bus.publish(channels::CALL, NewEvent::new(name, "tenant-1", data)).await.unwrap() }
    };
    publish(
        names::CALL_INITIATED,
        json!({ "callId": "c-7", "phoneNumber": "+15551234567", "leadId": "lead-7" }),
    )
    .await;
    publish(names::CALL_ANSWERED, json!({ "callId": "c-7" })).await;
    publish(names::CALL_ENDED, json!({ "callId": "c-7", "disposition": "NOT_INTERESTED" })).await;

    let done = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(record) = calls.get("c-7").await.unwrap() {
                if record.metadata.disposition.is_some() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("projector caught up");

    assert_eq!(done.status, CallStatus::Completed);
    assert_eq!(done.metadata.disposition.as_deref(), Some("NOT_INTERESTED"));
    assert!(done.answered_at.is_some());

    tokio::time::timeout(Duration::from_secs(2), async {
        while bus.pending(PROJECTOR_GROUP, channels::CALL).await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("every entry acknowledged");

    subscription.unsubscribe().await;
}
