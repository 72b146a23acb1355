//! Postgres implementation of the durable store contracts
//!
//! The schema belongs to the platform's migration tooling: tables `leads`,
//! `campaigns` and `calls` with quoted camelCase columns and Postgres enum
//! types `LeadStatus`, `CallStatus` and `CallDirection`. Enum columns are
//! cast to text on the way out and from text on the way in.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::{CallStore, LeadStore};
use crate::error::Result;
use crate::metadata::CallMetadata;
use crate::types::{CallRecord, CallStatus, LeadStatus, LeadToDial, NewCall};

/// Open a connection pool
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("🗄️ Connecting to durable store");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    info!("✅ Durable store connected");
    Ok(pool)
}

/// Leads and campaigns in Postgres
#[derive(Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lead_from_row(row: &PgRow) -> Result<LeadToDial> {
    Ok(LeadToDial {
        id: row.try_get("id")?,
        phone_number: row.try_get("phoneNumber")?,
        campaign_id: row.try_get("campaignId")?,
        tenant_id: row.try_get("tenantId")?,
        campaign_name: row.try_get("campaign_name")?,
    })
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn fetch_dialable(&self, limit: usize, exclude: &[String]) -> Result<Vec<LeadToDial>> {
        let rows = sqlx::query(
            r#"SELECT l.id, l."phoneNumber", l."campaignId", c."tenantId", c.name AS campaign_name
               FROM "leads" l
               INNER JOIN "campaigns" c ON l."campaignId" = c.id
               WHERE l.status IN ('NEW', 'RECYCLED')
                 AND c.status = 'ACTIVE'
                 AND NOT (l.id = ANY($2))
               ORDER BY l."createdAt" ASC
               LIMIT $1"#,
        )
        .bind(limit as i64)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lead_from_row).collect()
    }

    async fn try_claim(&self, lead_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE "leads"
               SET status = 'DIALING'::"LeadStatus", "updatedAt" = NOW()
               WHERE id = $1 AND status IN ('NEW', 'RECYCLED')"#,
        )
        .bind(lead_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, lead_id: &str, status: LeadStatus) -> Result<()> {
        sqlx::query(r#"UPDATE "leads" SET status = $1::"LeadStatus", "updatedAt" = NOW() WHERE id = $2"#)
            .bind(status.as_str())
            .bind(lead_id)
            .execute(&self.pool)
            .await?;

        debug!(lead_id, status = %status, "lead status updated");
        Ok(())
    }

    async fn lead_status(&self, lead_id: &str) -> Result<Option<LeadStatus>> {
        let row = sqlx::query(r#"SELECT status::text AS status FROM "leads" WHERE id = $1"#)
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some(status.parse()?))
            }
            None => Ok(None),
        }
    }

    async fn campaign_intro_audio(&self, campaign_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(r#"SELECT metadata->>'introAudio' AS intro_audio FROM "campaigns" WHERE id = $1"#)
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => row.try_get::<Option<String>, _>("intro_audio")?,
            None => None,
        })
    }

    async fn revert_stale_dialing(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE "leads"
               SET status = 'NEW'::"LeadStatus", "updatedAt" = NOW()
               WHERE status = 'DIALING'
                 AND "updatedAt" < NOW() - make_interval(secs => $1)"#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Call records in Postgres
#[derive(Clone)]
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CALL_COLUMNS: &str = r#"id, "tenantId", "callSid", "toNumber", direction::text AS direction,
    status::text AS status, "campaignId", "createdById", metadata, "createdAt", "answeredAt",
    "endedAt", duration"#;

fn call_from_row(row: &PgRow) -> Result<CallRecord> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let metadata: Option<Json<CallMetadata>> = row.try_get("metadata")?;
    let duration: Option<i32> = row.try_get("duration")?;

    Ok(CallRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenantId")?,
        call_sid: row.try_get("callSid")?,
        to_number: row.try_get("toNumber")?,
        direction: direction.parse()?,
        status: status.parse()?,
        campaign_id: row.try_get("campaignId")?,
        created_by_id: row.try_get("createdById")?,
        metadata: metadata.map(|m| m.0).unwrap_or_default(),
        created_at: row.try_get("createdAt")?,
        answered_at: row.try_get("answeredAt")?,
        ended_at: row.try_get("endedAt")?,
        duration: duration.map(i64::from),
    })
}

impl PgCallStore {
    async fn fetch(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let sql = format!(r#"SELECT {} FROM "calls" WHERE id = $1"#, CALL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_from_row).transpose()
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn create(&self, call: NewCall) -> Result<CallRecord> {
        sqlx::query(
            r#"INSERT INTO "calls" (id, "tenantId", "callSid", "toNumber", direction, status,
                   "campaignId", "createdById", metadata, "startedAt", "createdAt", "updatedAt")
               VALUES ($1, $2, $3, $4, $5::"CallDirection", $6::"CallStatus", $7, $8, $9, NOW(), NOW(), NOW())
               ON CONFLICT (id) DO UPDATE SET
                   "toNumber" = CASE WHEN "calls"."toNumber" = '' THEN EXCLUDED."toNumber" ELSE "calls"."toNumber" END,
                   direction = CASE WHEN "calls"."toNumber" = '' THEN EXCLUDED.direction ELSE "calls".direction END,
                   "callSid" = COALESCE("calls"."callSid", EXCLUDED."callSid"),
                   "campaignId" = COALESCE("calls"."campaignId", EXCLUDED."campaignId"),
                   "createdById" = COALESCE("calls"."createdById", EXCLUDED."createdById"),
                   metadata = COALESCE(EXCLUDED.metadata, '{}'::jsonb) || COALESCE("calls".metadata, '{}'::jsonb),
                   "updatedAt" = NOW()"#,
        )
        .bind(&call.id)
        .bind(&call.tenant_id)
        .bind(&call.call_sid)
        .bind(&call.to_number)
        .bind(call.direction.as_str())
        .bind(call.status.as_str())
        .bind(&call.campaign_id)
        .bind(&call.created_by_id)
        .bind(Json(&call.metadata))
        .execute(&self.pool)
        .await?;

        match self.fetch(&call.id).await? {
            Some(record) => Ok(record),
            None => Err(crate::error::EngineError::call_not_found(call.id)),
        }
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.fetch(call_id).await
    }

    async fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> Result<Option<CallRecord>> {
        sqlx::query(
            r#"UPDATE "calls"
               SET status = CASE WHEN status IN ('INITIATED', 'RINGING') THEN 'ANSWERED'::"CallStatus" ELSE status END,
                   "answeredAt" = CASE WHEN "endedAt" IS NULL THEN COALESCE("answeredAt", $2) ELSE "answeredAt" END,
                   "updatedAt" = NOW()
               WHERE id = $1"#,
        )
        .bind(call_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.fetch(call_id).await
    }

    async fn mark_ended(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<Option<CallRecord>> {
        sqlx::query(
            r#"UPDATE "calls"
               SET status = $2::"CallStatus",
                   "endedAt" = $3,
                   duration = CASE WHEN "answeredAt" IS NULL THEN 0
                                   ELSE GREATEST(0, FLOOR(EXTRACT(EPOCH FROM ($3 - "answeredAt"))))::int END,
                   "updatedAt" = NOW()
               WHERE id = $1 AND "endedAt" IS NULL"#,
        )
        .bind(call_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.fetch(call_id).await
    }

    async fn merge_metadata(&self, call_id: &str, patch: CallMetadata) -> Result<Option<CallRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(r#"SELECT metadata FROM "calls" WHERE id = $1 FOR UPDATE"#)
            .bind(call_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let current: Option<Json<CallMetadata>> = row.try_get("metadata")?;
        let merged = current.map(|m| m.0).unwrap_or_default().merged(patch);

        sqlx::query(r#"UPDATE "calls" SET metadata = $2, "updatedAt" = NOW() WHERE id = $1"#)
            .bind(call_id)
            .bind(Json(&merged))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.fetch(call_id).await
    }

    async fn list_for_agent(&self, tenant_id: &str, agent_id: &str, limit: i64, offset: i64) -> Result<Vec<CallRecord>> {
        let sql = format!(
            r#"SELECT {} FROM "calls"
               WHERE "tenantId" = $1
                 AND ("createdById" = $2 OR metadata->>'answeredByAgentId' = $2)
               ORDER BY "createdAt" DESC
               LIMIT $3 OFFSET $4"#,
            CALL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(agent_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(call_from_row).collect()
    }
}
