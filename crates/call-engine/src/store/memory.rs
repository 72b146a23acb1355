//! In-process durable stores

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CallStore, LeadStore};
use crate::error::{EngineError, Result};
use crate::metadata::CallMetadata;
use crate::types::{
    call_duration, CallRecord, CallStatus, Campaign, CampaignStatus, LeadStatus, LeadToDial, NewCall,
};

#[derive(Debug, Clone)]
struct LeadRow {
    id: String,
    phone_number: String,
    campaign_id: String,
    status: LeadStatus,
    /// Insertion order stands in for the creation time
    seq: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct LeadTables {
    leads: HashMap<String, LeadRow>,
    campaigns: HashMap<String, Campaign>,
    next_seq: u64,
}

/// Leads and campaigns held in memory
#[derive(Clone, Default)]
pub struct MemoryLeadStore {
    tables: Arc<Mutex<LeadTables>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.tables.lock().campaigns.insert(campaign.id.clone(), campaign);
    }

    /// Add an ACTIVE campaign with no intro override
    pub fn add_active_campaign(&self, id: &str, tenant_id: &str) {
        self.add_campaign(Campaign {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: id.to_string(),
            status: CampaignStatus::Active,
            intro_audio: None,
        });
    }

    /// Add a lead; leads added earlier are dialed first
    pub fn add_lead(&self, id: &str, phone_number: &str, campaign_id: &str, status: LeadStatus) {
        let mut tables = self.tables.lock();
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.leads.insert(
            id.to_string(),
            LeadRow {
                id: id.to_string(),
                phone_number: phone_number.to_string(),
                campaign_id: campaign_id.to_string(),
                status,
                seq,
                updated_at: Utc::now(),
            },
        );
    }

    /// Pretend the lead was last written at `at`
    pub fn set_updated_at(&self, lead_id: &str, at: DateTime<Utc>) {
        if let Some(lead) = self.tables.lock().leads.get_mut(lead_id) {
            lead.updated_at = at;
        }
    }

    pub fn status_of(&self, lead_id: &str) -> Option<LeadStatus> {
        self.tables.lock().leads.get(lead_id).map(|l| l.status)
    }

    pub fn count_in(&self, status: LeadStatus) -> usize {
        self.tables
            .lock()
            .leads
            .values()
            .filter(|l| l.status == status)
            .count()
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn fetch_dialable(&self, limit: usize, exclude: &[String]) -> Result<Vec<LeadToDial>> {
        let tables = self.tables.lock();
        let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();

        let mut rows: Vec<(&LeadRow, &Campaign)> = tables
            .leads
            .values()
            .filter(|lead| lead.status.is_dialable() && !excluded.contains(lead.id.as_str()))
            .filter_map(|lead| {
                tables
                    .campaigns
                    .get(&lead.campaign_id)
                    .filter(|c| c.status == CampaignStatus::Active)
                    .map(|c| (lead, c))
            })
            .collect();
        rows.sort_by_key(|(lead, _)| lead.seq);

        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(lead, campaign)| LeadToDial {
                id: lead.id.clone(),
                phone_number: lead.phone_number.clone(),
                campaign_id: lead.campaign_id.clone(),
                tenant_id: campaign.tenant_id.clone(),
                campaign_name: campaign.name.clone(),
            })
            .collect())
    }

    async fn try_claim(&self, lead_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.leads.get_mut(lead_id) {
            Some(lead) if lead.status.is_dialable() => {
                lead.status = LeadStatus::Dialing;
                lead.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::LeadNotFound(lead_id.to_string())),
        }
    }

    async fn update_status(&self, lead_id: &str, status: LeadStatus) -> Result<()> {
        let mut tables = self.tables.lock();
        let lead = tables
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| EngineError::LeadNotFound(lead_id.to_string()))?;
        lead.status = status;
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn lead_status(&self, lead_id: &str) -> Result<Option<LeadStatus>> {
        Ok(self.status_of(lead_id))
    }

    async fn campaign_intro_audio(&self, campaign_id: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .lock()
            .campaigns
            .get(campaign_id)
            .and_then(|c| c.intro_audio.clone()))
    }

    async fn revert_stale_dialing(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut reverted = 0;
        for lead in self.tables.lock().leads.values_mut() {
            if lead.status == LeadStatus::Dialing && lead.updated_at < cutoff {
                lead.status = LeadStatus::New;
                lead.updated_at = Utc::now();
                reverted += 1;
            }
        }
        Ok(reverted)
    }
}

/// Call records held in memory
#[derive(Clone, Default)]
pub struct MemoryCallStore {
    calls: Arc<Mutex<HashMap<String, CallRecord>>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    fn update<F>(&self, call_id: &str, apply: F) -> Option<CallRecord>
    where
        F: FnOnce(&mut CallRecord),
    {
        let mut calls = self.calls.lock();
        let record = calls.get_mut(call_id)?;
        apply(record);
        Some(record.clone())
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create(&self, call: NewCall) -> Result<CallRecord> {
        let mut calls = self.calls.lock();
        if let Some(record) = calls.get_mut(&call.id) {
            record.fill_gaps(call);
            return Ok(record.clone());
        }
        let record = CallRecord::from_new(call, Utc::now());
        calls.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        Ok(self.calls.lock().get(call_id).cloned())
    }

    async fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> Result<Option<CallRecord>> {
        Ok(self.update(call_id, |record| {
            if matches!(record.status, CallStatus::Initiated | CallStatus::Ringing) {
                record.status = CallStatus::Answered;
            }
            if record.ended_at.is_none() {
                record.answered_at.get_or_insert(at);
            }
        }))
    }

    async fn mark_ended(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<Option<CallRecord>> {
        Ok(self.update(call_id, |record| {
            if record.ended_at.is_none() {
                record.status = status;
                record.ended_at = Some(at);
                record.duration = Some(call_duration(record.answered_at, at));
            }
        }))
    }

    async fn merge_metadata(&self, call_id: &str, patch: CallMetadata) -> Result<Option<CallRecord>> {
        Ok(self.update(call_id, |record| record.metadata.merge(patch)))
    }

    async fn list_for_agent(&self, tenant_id: &str, agent_id: &str, limit: i64, offset: i64) -> Result<Vec<CallRecord>> {
        let mut calls: Vec<CallRecord> = self
            .calls
            .lock()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .filter(|c| {
                c.created_by_id.as_deref() == Some(agent_id)
                    || c.metadata.answered_by_agent_id.as_deref() == Some(agent_id)
            })
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        Ok(calls
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
