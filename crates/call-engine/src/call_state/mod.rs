//! # Call State Coordinator
//!
//! Active calls are mirrored in the fast store under `call:state:<id>` with
//! an expiry refreshed on every write. The durable call record remains the
//! system of record: a missing live state means "not currently active", and
//! [`CallStateCoordinator::live_state`] rebuilds it from the durable record
//! when the call turns out to still be running.
//!
//! [`CallStateProjector`] keeps both stores in step with `call.*` events
//! from the reliable path.

pub mod coordinator;
pub mod model;
pub mod projector;
pub mod store;

pub use coordinator::CallStateCoordinator;
pub use model::{CallState, CallStateUpdate, CallTimer, Participant, ParticipantRole, ParticipantStatus};
pub use projector::{CallStateProjector, PROJECTOR_GROUP};
pub use store::{call_state_key, CallStateStore, CALL_STATE_PREFIX};
