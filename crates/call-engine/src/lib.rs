//! # rdial call engine
//!
//! The call-handling core of the rdial dialer:
//!
//! - [`dialer`]: the autodialer ("Hopper") turning dialable leads into
//!   outbound calls within the switch's capacity
//! - [`fronter`]: the answered-call flow (intro prompt, key press, transfer
//!   or hangup), one task per leg
//! - [`call_state`]: live call state in the fast store, reconciled with the
//!   durable call record
//! - [`agent`]: presence and call control for human agents
//!
//! Every component receives its collaborators (switch connector, stores,
//! [`EventBus`](rdial_event_bus::EventBus)) through its constructor, so a
//! process builds one of each and tests swap in the in-memory versions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rdial_call_engine::config::CallEngineConfig;
//! use rdial_call_engine::dialer::Hopper;
//! use rdial_call_engine::store::MemoryLeadStore;
//! use rdial_event_bus::{EventBus, MemoryStore};
//! use rdial_switch_control::InboundConnector;
//!
//! # tokio_test::block_on(async {
//! let config = CallEngineConfig::load(None)?;
//! let fast = Arc::new(MemoryStore::new());
//! let bus = EventBus::with_store(fast.clone(), config.events.clone());
//! let hopper = Hopper::new(
//!     config.dialer.clone(),
//!     Arc::new(InboundConnector::new(config.switch.inbound())),
//!     Arc::new(MemoryLeadStore::new()),
//!     fast,
//!     bus,
//! );
//! let outcome = hopper.tick().await?;
//! println!("{:?}", outcome);
//! # Ok::<(), rdial_call_engine::EngineError>(())
//! # });
//! ```

pub mod agent;
pub mod call_state;
pub mod config;
pub mod dialer;
pub mod error;
pub mod fronter;
pub mod metadata;
pub mod scheduler;
pub mod store;
pub mod types;

pub use agent::{AgentCallService, AgentContext, AgentStatus, AgentStatusStore};
pub use call_state::{CallState, CallStateCoordinator, CallStateProjector, CallStateStore, CallStateUpdate};
pub use config::CallEngineConfig;
pub use dialer::{Hopper, ReconcileSweep, TickOutcome};
pub use error::{EngineError, Result};
pub use fronter::{Disposition, Fronter, FronterOutcome, FronterServer, FronterState};
pub use metadata::CallMetadata;
pub use scheduler::ScheduledTask;
pub use types::{CallDirection, CallRecord, CallStatus, LeadStatus, LeadToDial};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
