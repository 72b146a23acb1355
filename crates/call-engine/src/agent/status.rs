//! Agent presence in the fast store

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rdial_event_bus::KeyValueStore;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Key prefix of agent status entries
pub const AGENT_STATUS_PREFIX: &str = "agent:status:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    Available,
    Away,
    Dnd,
    Offline,
    /// Only set by call transitions
    OnCall,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Away => "away",
            AgentStatus::Dnd => "dnd",
            AgentStatus::Offline => "offline",
            AgentStatus::OnCall => "on-call",
        }
    }

    /// Whether an agent may pick this status by hand
    pub fn is_manual(&self) -> bool {
        !matches!(self, AgentStatus::OnCall)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(AgentStatus::Available),
            "away" => Ok(AgentStatus::Away),
            "dnd" => Ok(AgentStatus::Dnd),
            "offline" => Ok(AgentStatus::Offline),
            "on-call" => Ok(AgentStatus::OnCall),
            other => Err(EngineError::invalid_input(format!("unknown agent status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEntry {
    pub status: AgentStatus,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_call_id: Option<String>,
}

impl AgentStatusEntry {
    pub fn now(status: AgentStatus, current_call_id: Option<String>) -> Self {
        Self {
            status,
            last_updated: Utc::now(),
            current_call_id,
        }
    }

    pub fn offline() -> Self {
        Self::now(AgentStatus::Offline, None)
    }
}

/// One entry per agent, rewritten on every status-affecting transition
#[derive(Clone)]
pub struct AgentStatusStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl AgentStatusStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(agent_id: &str) -> String {
        format!("{}{}", AGENT_STATUS_PREFIX, agent_id)
    }

    /// Current entry; an agent we know nothing about is offline
    pub async fn get(&self, agent_id: &str) -> Result<AgentStatusEntry> {
        match self.kv.get(&Self::key(agent_id)).await? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Ok(AgentStatusEntry::offline()),
        }
    }

    pub async fn set(&self, agent_id: &str, entry: &AgentStatusEntry) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        self.kv.set_ex(&Self::key(agent_id), &value, self.ttl).await?;
        Ok(())
    }
}
