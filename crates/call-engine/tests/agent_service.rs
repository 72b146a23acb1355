//! Agent phone flows over the in-memory stores

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::memory_bus;
use rdial_call_engine::agent::{
    AgentCallService, AgentContext, AgentStatus, AgentStatusStore, IncomingCall, OriginateRequest, TransferProgress,
};
use rdial_call_engine::call_state::{CallStateCoordinator, CallStateStore, ParticipantRole, ParticipantStatus};
use rdial_call_engine::config::AgentConfig;
use rdial_call_engine::error::EngineError;
use rdial_call_engine::metadata::TransferType;
use rdial_call_engine::store::{CallStore, MemoryCallStore};
use rdial_call_engine::types::{CallDirection, CallStatus};
use rdial_event_bus::{names, EventBus, MemoryStore};
use serde_json::json;

struct Rig {
    service: AgentCallService,
    calls: Arc<MemoryCallStore>,
    bus: EventBus,
    agent: AgentContext,
}

fn rig(config: AgentConfig) -> Rig {
    let kv = Arc::new(MemoryStore::new());
    let calls = Arc::new(MemoryCallStore::new());
    let coordinator = CallStateCoordinator::new(CallStateStore::new(kv.clone(), Duration::from_secs(3600)), calls.clone());
    let agents = AgentStatusStore::new(kv, Duration::from_secs(86_400));
    let (bus, _) = memory_bus();
    Rig {
        service: AgentCallService::new(config, coordinator, agents, bus.clone()),
        calls,
        bus,
        agent: AgentContext::new("agent-1", "tenant-1"),
    }
}

fn dial(number: &str) -> OriginateRequest {
    OriginateRequest {
        phone_number: number.to_string(),
        caller_id: Some("+15550001111".to_string()),
        campaign_id: Some("camp-1".to_string()),
    }
}

async fn published(bus: &EventBus) -> Vec<String> {
    bus.get_events(50)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect()
}

#[tokio::test]
async fn test_unknown_agent_is_offline() {
    let rig = rig(AgentConfig::default());
    let view = rig.service.status("nobody").await.unwrap();
    assert_eq!(view.entry.status, AgentStatus::Offline);
    assert_eq!(view.entry.current_call_id, None);
}

#[tokio::test]
async fn test_manual_status_change_is_announced() {
    let rig = rig(AgentConfig::default());

    let view = rig.service.set_status(&rig.agent, AgentStatus::Away).await.unwrap();
    assert_eq!(view.entry.status, AgentStatus::Away);
    assert_eq!(rig.service.status("agent-1").await.unwrap().entry.status, AgentStatus::Away);

    let err = rig.service.set_status(&rig.agent, AgentStatus::OnCall).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let events = rig.bus.get_events(10).await.unwrap();
    let changed: Vec<_> = events.iter().filter(|e| e.event == names::AGENT_STATUS_CHANGED).collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].data_str("status"), Some("away"));
}

#[tokio::test]
async fn test_originate_records_call_and_puts_agent_on_call() {
    let rig = rig(AgentConfig::default());

    let call = rig.service.originate(&rig.agent, dial(" +15551234567 ")).await.unwrap();
    assert_eq!(call.phone_number, "+15551234567");
    assert_eq!(call.status, CallStatus::Initiated);
    assert!(call.call_sid.starts_with("call_"));

    let record = rig.calls.get(&call.call_id).await.unwrap().unwrap();
    assert_eq!(record.direction, CallDirection::Outbound);
    assert_eq!(record.call_sid.as_deref(), Some(call.call_sid.as_str()));
    assert_eq!(record.created_by_id.as_deref(), Some("agent-1"));
    assert_eq!(record.metadata.originated_by.as_deref(), Some("agent-phone"));

    let state = rig.service.coordinator().get_call_state(&call.call_id).await.unwrap().unwrap();
    let agent = state.participants.iter().find(|p| p.role == ParticipantRole::Agent).unwrap();
    let callee = state.participants.iter().find(|p| p.role == ParticipantRole::Callee).unwrap();
    assert_eq!(agent.status, ParticipantStatus::Answered);
    assert_eq!(callee.status, ParticipantStatus::Ringing);
    assert_eq!(callee.number, "+15551234567");

    let status = rig.service.status("agent-1").await.unwrap().entry;
    assert_eq!(status.status, AgentStatus::OnCall);
    assert_eq!(status.current_call_id.as_deref(), Some(call.call_id.as_str()));

    assert!(published(&rig.bus).await.contains(&names::CALL_INITIATED.to_string()));
    assert_eq!(rig.service.pending_fallbacks(), 0);
}

#[tokio::test]
async fn test_originate_requires_a_number() {
    let rig = rig(AgentConfig::default());
    let err = rig.service.originate(&rig.agent, dial("   ")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(rig.calls.len(), 0);
}

#[tokio::test]
async fn test_answer_then_hangup_frees_the_agent() {
    let rig = rig(AgentConfig::default());
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();

    let answered = rig.service.answer(&rig.agent, &call.call_id).await.unwrap();
    let record = rig.calls.get(&call.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert_eq!(record.answered_at, Some(answered.answered_at));
    assert_eq!(record.metadata.answered_by_agent_id.as_deref(), Some("agent-1"));

    let ended = rig.service.hangup(&rig.agent, &call.call_id).await.unwrap();
    assert_eq!(ended.status, CallStatus::Completed);
    assert!(ended.duration >= 0);

    let state = rig.service.coordinator().get_call_state(&call.call_id).await.unwrap().unwrap();
    assert_eq!(state.status, CallStatus::Completed);
    assert!(state
        .participants
        .iter()
        .all(|p| p.status == ParticipantStatus::Disconnected));

    let status = rig.service.status("agent-1").await.unwrap().entry;
    assert_eq!(status.status, AgentStatus::Available);
    assert_eq!(status.current_call_id, None);

    let events = rig.bus.get_events(50).await.unwrap();
    let ended_event = events.iter().find(|e| e.event == names::CALL_ENDED).unwrap();
    assert_eq!(ended_event.data_str("endReason"), Some("agent_hangup"));
}

#[tokio::test]
async fn test_unknown_call_is_not_found() {
    let rig = rig(AgentConfig::default());
    for result in [
        rig.service.answer(&rig.agent, "missing").await.err(),
        rig.service.hangup(&rig.agent, "missing").await.err(),
        rig.service.toggle_hold(&rig.agent, "missing").await.err(),
        rig.service
            .transfer(&rig.agent, "missing", "queue-default", TransferType::Blind)
            .await
            .err(),
        rig.service.screen_pop("missing").await.err(),
    ] {
        assert!(matches!(result, Some(EngineError::CallNotFound(_))));
    }
}

#[tokio::test]
async fn test_hold_toggles_and_keeps_screen_pop() {
    let rig = rig(AgentConfig::default());
    let accepted = rig
        .service
        .incoming(IncomingCall {
            tenant_id: Some("tenant-1".into()),
            from: Some("+15559876543".into()),
            screen_pop_data: Some(json!({ "name": "Grace Hopper" })),
            ..Default::default()
        })
        .await
        .unwrap();
    rig.service.answer(&rig.agent, &accepted.call_id).await.unwrap();

    let held = rig.service.toggle_hold(&rig.agent, &accepted.call_id).await.unwrap();
    assert!(held.is_on_hold);
    let state = rig.service.coordinator().get_call_state(&accepted.call_id).await.unwrap().unwrap();
    assert!(state.metadata.on_hold());
    assert_eq!(state.metadata.screen_pop, Some(json!({ "name": "Grace Hopper" })));
    let caller = state.participants.iter().find(|p| p.role == ParticipantRole::Caller).unwrap();
    assert_eq!(caller.status, ParticipantStatus::Held);

    let resumed = rig.service.toggle_hold(&rig.agent, &accepted.call_id).await.unwrap();
    assert!(!resumed.is_on_hold);
    let state = rig.service.coordinator().get_call_state(&accepted.call_id).await.unwrap().unwrap();
    let caller = state.participants.iter().find(|p| p.role == ParticipantRole::Caller).unwrap();
    assert_eq!(caller.status, ParticipantStatus::Answered);

    let hold_events = rig
        .bus
        .get_events(50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event == names::CALL_HOLD)
        .count();
    assert_eq!(hold_events, 2);
}

#[tokio::test]
async fn test_hold_on_ended_call_is_rejected() {
    let rig = rig(AgentConfig::default());
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();
    rig.service.hangup(&rig.agent, &call.call_id).await.unwrap();

    let err = rig.service.toggle_hold(&rig.agent, &call.call_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_blind_transfer_frees_the_agent() {
    let rig = rig(AgentConfig::default());
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();

    let outcome = rig
        .service
        .transfer(&rig.agent, &call.call_id, "queue-sales", TransferType::Blind)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferProgress::Transferred);

    let record = rig.calls.get(&call.call_id).await.unwrap().unwrap();
    let transfer = record.metadata.transfer.unwrap();
    assert_eq!(transfer.destination, "queue-sales");
    assert_eq!(transfer.by_agent_id.as_deref(), Some("agent-1"));
    assert_eq!(rig.service.status("agent-1").await.unwrap().entry.status, AgentStatus::Available);
    assert!(published(&rig.bus).await.contains(&names::CALL_TRANSFERRED.to_string()));
}

#[tokio::test]
async fn test_warm_transfer_keeps_the_agent_on_call() {
    let rig = rig(AgentConfig::default());
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();

    let outcome = rig
        .service
        .transfer(&rig.agent, &call.call_id, "1002", TransferType::Warm)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferProgress::Consulting);
    assert_eq!(rig.service.status("agent-1").await.unwrap().entry.status, AgentStatus::OnCall);
    assert!(!published(&rig.bus).await.contains(&names::CALL_TRANSFERRED.to_string()));

    let state = rig.service.coordinator().get_call_state(&call.call_id).await.unwrap().unwrap();
    assert_eq!(state.metadata.transfer.map(|t| t.transfer_type), Some(TransferType::Warm));

    let err = rig
        .service
        .transfer(&rig.agent, &call.call_id, "  ", TransferType::Blind)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_dtmf_digits_are_validated() {
    let rig = rig(AgentConfig::default());
    for digit in ["0", "7", "*", "#"] {
        let sent = rig.service.send_dtmf("c-1", digit).await.unwrap();
        assert!(sent.sent);
    }
    for digit in ["", "12", "a", "A"] {
        assert!(matches!(
            rig.service.send_dtmf("c-1", digit).await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}

#[tokio::test]
async fn test_incoming_call_rings_and_pops() {
    let rig = rig(AgentConfig::default());
    let accepted = rig
        .service
        .incoming(IncomingCall {
            tenant_id: Some("tenant-1".into()),
            call_id: Some("carrier-42".into()),
            caller_number: Some("+15559876543".into()),
            caller_name: Some("Grace".into()),
            prospect_data: Some(json!({ "account": "A-17" })),
            queue_name: Some("support".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(accepted.call_sid, "carrier-42");
    assert_eq!(accepted.status, CallStatus::Ringing);

    let record = rig.calls.get(&accepted.call_id).await.unwrap().unwrap();
    assert_eq!(record.direction, CallDirection::Inbound);
    assert_eq!(record.metadata.queue_name.as_deref(), Some("support"));

    let pop = rig.service.screen_pop(&accepted.call_id).await.unwrap();
    assert_eq!(pop.data, json!({ "account": "A-17" }));

    // live state gone, the durable record still answers
    rig.service.coordinator().remove_call_state(&accepted.call_id).await.unwrap();
    let pop = rig.service.screen_pop(&accepted.call_id).await.unwrap();
    assert_eq!(pop.data, json!({ "account": "A-17" }));

    let events = rig.bus.get_events(10).await.unwrap();
    let incoming = events.iter().find(|e| e.event == names::AGENT_CALL_INCOMING).unwrap();
    assert_eq!(incoming.data_str("callerNumber"), Some("+15559876543"));
}

#[tokio::test]
async fn test_incoming_requires_tenant() {
    let rig = rig(AgentConfig::default());
    let err = rig.service.incoming(IncomingCall::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_history_pages_through_agent_calls() {
    let rig = rig(AgentConfig::default());
    for n in 0..3 {
        rig.service
            .originate(&rig.agent, dial(&format!("+1555123000{}", n)))
            .await
            .unwrap();
    }
    rig.service
        .originate(&AgentContext::new("agent-2", "tenant-1"), dial("+15551239999"))
        .await
        .unwrap();

    let page = rig.service.history(&rig.agent, 2, 0).await.unwrap();
    assert_eq!(page.calls.len(), 2);
    assert!(page.has_more);

    let rest = rig.service.history(&rig.agent, 2, 2).await.unwrap();
    assert_eq!(rest.calls.len(), 1);
    assert!(!rest.has_more);

    assert!(matches!(
        rig.service.history(&rig.agent, 0, 0).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_answer_fallback_marks_unanswered_call() {
    let rig = rig(AgentConfig {
        answer_fallback_ms: 2_000,
        ..Default::default()
    });
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();
    assert_eq!(rig.service.pending_fallbacks(), 1);

    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let record = rig.calls.get(&call.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert_eq!(record.metadata.answered_by_agent_id, None);
    assert_eq!(rig.service.pending_fallbacks(), 0);
    assert!(published(&rig.bus).await.contains(&names::CALL_ANSWERED.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_answer_cancels_fallback() {
    let rig = rig(AgentConfig {
        answer_fallback_ms: 2_000,
        ..Default::default()
    });
    let call = rig.service.originate(&rig.agent, dial("+15551234567")).await.unwrap();
    rig.service.answer(&rig.agent, &call.call_id).await.unwrap();
    assert_eq!(rig.service.pending_fallbacks(), 0);

    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let answered = rig
        .bus
        .get_events(50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event == names::CALL_ANSWERED)
        .count();
    assert_eq!(answered, 1);
}
