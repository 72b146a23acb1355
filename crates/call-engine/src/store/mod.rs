//! Durable store contracts
//!
//! Leads, campaigns and call records live in the relational database owned
//! by the rest of the platform. The engine only needs the narrow operations
//! below; [`postgres`] implements them with `sqlx` and [`memory`] keeps
//! everything in process for tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::metadata::CallMetadata;
use crate::types::{CallRecord, CallStatus, LeadStatus, LeadToDial, NewCall};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCallStore, MemoryLeadStore};
pub use postgres::{connect_pool, PgCallStore, PgLeadStore};

/// Lead and campaign access used by the dialer and the call flow
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Up to `limit` NEW or RECYCLED leads of ACTIVE campaigns, oldest
    /// first, skipping the ids in `exclude`
    async fn fetch_dialable(&self, limit: usize, exclude: &[String]) -> Result<Vec<LeadToDial>>;

    /// Move the lead to DIALING if it is still NEW or RECYCLED.
    ///
    /// Returns `false` when somebody else claimed it first.
    async fn try_claim(&self, lead_id: &str) -> Result<bool>;

    async fn update_status(&self, lead_id: &str, status: LeadStatus) -> Result<()>;

    async fn lead_status(&self, lead_id: &str) -> Result<Option<LeadStatus>>;

    /// The campaign's own intro prompt, if it configures one
    async fn campaign_intro_audio(&self, campaign_id: &str) -> Result<Option<String>>;

    /// Return leads stuck in DIALING for longer than `older_than` to NEW
    async fn revert_stale_dialing(&self, older_than: Duration) -> Result<u64>;
}

/// Durable call records.
///
/// Every transition is conditional so replaying it is harmless. `create`
/// never overwrites a stored value, `mark_answered` never moves an ended
/// call back and `mark_ended` applies once.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert `call`, or fill the gaps of an existing record with its values;
    /// returns the stored record
    async fn create(&self, call: NewCall) -> Result<CallRecord>;

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>>;

    /// INITIATED/RINGING -> ANSWERED, keeping the first answer time
    async fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> Result<Option<CallRecord>>;

    /// Set the final status, end time and duration unless the call already ended
    async fn mark_ended(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<Option<CallRecord>>;

    async fn merge_metadata(&self, call_id: &str, patch: CallMetadata) -> Result<Option<CallRecord>>;

    /// Calls the agent placed or answered, newest first
    async fn list_for_agent(&self, tenant_id: &str, agent_id: &str, limit: i64, offset: i64) -> Result<Vec<CallRecord>>;
}
