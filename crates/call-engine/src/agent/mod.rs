//! # Agent Call Service
//!
//! The effects behind the agent phone: presence, agent-placed and incoming
//! calls, in-call controls, screen pops and call history. Presence lives in
//! the fast store under `agent:status:<id>`; everything else goes through
//! the [`CallStateCoordinator`](crate::call_state::CallStateCoordinator).

pub mod service;
pub mod status;

pub use service::{
    AgentCallService, AgentContext, AgentStatusView, AnsweredCall, CallHistory, DtmfSent, EndedCall, HoldState,
    IncomingAccepted, IncomingCall, OriginateRequest, OriginatedCall, ScreenPop, TransferOutcome, TransferProgress,
};
pub use status::{AgentStatus, AgentStatusEntry, AgentStatusStore, AGENT_STATUS_PREFIX};
