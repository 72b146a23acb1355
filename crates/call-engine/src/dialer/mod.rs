//! # Autodialer ("the Hopper")
//!
//! Turns dialable leads into outbound calls without exceeding the switch's
//! capacity. Every poll interval the dialer:
//!
//! 1. makes sure it has a switch connection, reconnecting if needed,
//! 2. works out how many calls are in flight (cached counter first, the
//!    switch's own count as a fallback),
//! 3. fetches at most `max_concurrent - in_flight` leads, oldest first,
//! 4. claims each lead (NEW/RECYCLED -> DIALING) before dialing it,
//! 5. originates the claimed leads in background tasks, handing the answered
//!    leg back to the fronter's socket listener.
//!
//! A failed originate releases the claim (see [`FailureLedger`] for the
//! retry spacing). Leads left in DIALING by a crash are swept back by
//! [`ReconcileSweep`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdial_event_bus::{channels, names, EventBus, KeyValueStore, NewEvent};
use rdial_switch_control::{parse_calls_count, Originate, SwitchApi, SwitchConnector};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::DialerConfig;
use crate::error::Result;
use crate::store::LeadStore;
use crate::types::{LeadStatus, LeadToDial};

pub mod ledger;
pub mod phone;
pub mod reconcile;

pub use ledger::{FailureLedger, FailureVerdict, RetryPolicy};
pub use phone::normalize_phone;
pub use reconcile::ReconcileSweep;

/// Fast-store key of the in-flight call counter
pub const ACTIVE_CALLS_KEY: &str = "dialer:active_calls";

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No switch connection; nothing was attempted
    NotConnected,
    /// Every slot is taken
    NoCapacity { in_flight: usize },
    /// Capacity was free but nothing is waiting to be dialed
    Idle,
    Dispatched {
        fetched: usize,
        claimed: usize,
        /// Leads another dialer claimed between our fetch and our claim
        skipped: usize,
    },
}

/// The autodialer
#[derive(Clone)]
pub struct Hopper {
    inner: Arc<Inner>,
}

struct Inner {
    config: DialerConfig,
    connector: Arc<dyn SwitchConnector>,
    switch: Mutex<Option<Arc<dyn SwitchApi>>>,
    leads: Arc<dyn LeadStore>,
    counters: Arc<dyn KeyValueStore>,
    bus: EventBus,
    ledger: FailureLedger,
    /// Originates issued but not yet resolved by the switch
    pending: AtomicUsize,
    /// Last count obtained from any source
    last_in_flight: AtomicUsize,
    originates: tokio::sync::Mutex<JoinSet<()>>,
}

impl Hopper {
    pub fn new(
        config: DialerConfig,
        connector: Arc<dyn SwitchConnector>,
        leads: Arc<dyn LeadStore>,
        counters: Arc<dyn KeyValueStore>,
        bus: EventBus,
    ) -> Self {
        let ledger = FailureLedger::new(config.retry_policy());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                switch: Mutex::new(None),
                leads,
                counters,
                bus,
                ledger,
                pending: AtomicUsize::new(0),
                last_in_flight: AtomicUsize::new(0),
                originates: tokio::sync::Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.inner.config
    }

    /// Originates still waiting on the switch
    pub fn pending_originates(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.inner.ledger
    }

    /// Run ticks every poll interval until `stop` flips to true.
    ///
    /// Ticks never overlap: a slow tick delays the next one.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            "🚀 Dialer started (max_concurrent={}, poll={}ms, batch={}, switch={})",
            self.inner.config.max_concurrent,
            self.inner.config.poll_interval_ms,
            self.inner.config.batch_size,
            self.inner.connector.describe()
        );

        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Dispatched { fetched, claimed, skipped }) => {
                            info!("📞 Dispatched {} of {} fetched leads ({} taken elsewhere)", claimed, fetched, skipped);
                        }
                        Ok(outcome) => debug!(?outcome, "dialer tick"),
                        Err(e) => error!("Dialer tick failed: {}", e),
                    }
                }
                _ = stop.changed() => break,
            }
        }

        self.drain().await;
        info!("🛑 Dialer stopped");
    }

    /// One pass of the dialing loop
    pub async fn tick(&self) -> Result<TickOutcome> {
        let inner = &self.inner;
        self.reap().await;

        let Some(switch) = self.ensure_connected().await else {
            return Ok(TickOutcome::NotConnected);
        };

        let in_flight = self.in_flight(switch.as_ref()).await + self.pending_originates();
        let available = inner.config.max_concurrent.saturating_sub(in_flight);
        if available == 0 {
            return Ok(TickOutcome::NoCapacity { in_flight });
        }

        let limit = available.min(inner.config.batch_size);
        let cooling = inner.ledger.cooling_down();
        let leads = inner.leads.fetch_dialable(limit, &cooling).await?;
        if leads.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let fetched = leads.len();
        let mut claimed = 0;
        let mut skipped = 0;
        for lead in leads {
            if !inner.leads.try_claim(&lead.id).await? {
                debug!(lead_id = %lead.id, "lead claimed elsewhere");
                skipped += 1;
                continue;
            }
            claimed += 1;
            inner.pending.fetch_add(1, Ordering::SeqCst);

            let dialer = self.clone();
            let switch = switch.clone();
            let span = tracing::info_span!("originate", lead_id = %lead.id, campaign_id = %lead.campaign_id);
            inner
                .originates
                .lock()
                .await
                .spawn(async move { dialer.originate(switch, lead).await }.instrument(span));
        }

        Ok(TickOutcome::Dispatched {
            fetched,
            claimed,
            skipped,
        })
    }

    /// Wait for every originate in flight to resolve
    pub async fn drain(&self) {
        let mut originates = self.inner.originates.lock().await;
        while originates.join_next().await.is_some() {}
    }

    async fn reap(&self) {
        let mut originates = self.inner.originates.lock().await;
        while originates.try_join_next().is_some() {}
    }

    async fn ensure_connected(&self) -> Option<Arc<dyn SwitchApi>> {
        let current = self.inner.switch.lock().clone();
        if let Some(switch) = current {
            if switch.is_connected() {
                return Some(switch);
            }
            warn!("Switch connection lost, reconnecting");
        }

        match self.inner.connector.connect().await {
            Ok(switch) => {
                info!("✅ Dialer connected to {}", self.inner.connector.describe());
                *self.inner.switch.lock() = Some(switch.clone());
                Some(switch)
            }
            Err(e) => {
                warn!("Switch not available, skipping tick: {}", e);
                *self.inner.switch.lock() = None;
                None
            }
        }
    }

    /// Calls in flight: the cached counter, else the switch's own count
    async fn in_flight(&self, switch: &dyn SwitchApi) -> usize {
        let inner = &self.inner;
        match inner.counters.get(ACTIVE_CALLS_KEY).await {
            Ok(Some(value)) => match value.parse::<usize>() {
                Ok(count) => {
                    inner.last_in_flight.store(count, Ordering::SeqCst);
                    return count;
                }
                Err(_) => warn!("Ignoring malformed in-flight counter '{}'", value),
            },
            Ok(None) => {}
            Err(e) => debug!("In-flight counter unavailable, asking the switch: {}", e),
        }

        let count = match switch.api("show calls count").await {
            Ok(body) => parse_calls_count(&body).map(|count| count as usize),
            Err(e) => {
                warn!("Could not query switch call count: {}", e);
                None
            }
        };

        match count {
            Some(count) => {
                inner.last_in_flight.store(count, Ordering::SeqCst);
                let ttl = Duration::from_secs(inner.config.in_flight_ttl_secs);
                if let Err(e) = inner.counters.set_ex(ACTIVE_CALLS_KEY, &count.to_string(), ttl).await {
                    debug!("Could not cache in-flight count: {}", e);
                }
                count
            }
            None => inner.last_in_flight.load(Ordering::SeqCst),
        }
    }

    async fn originate(&self, switch: Arc<dyn SwitchApi>, lead: LeadToDial) {
        let inner = &self.inner;
        let config = &inner.config;
        let call_id = Uuid::new_v4().to_string();
        let phone = normalize_phone(&lead.phone_number);

        let command = Originate::new(
            call_id.as_str(),
            format!("{}/{}", config.gateway, phone),
            config.socket_address(),
        )
        .caller_id(config.caller_id.as_str(), config.caller_id_name.as_str())
        .correlate("lead_id", lead.id.as_str())
        .correlate("campaign_id", lead.campaign_id.as_str())
        .correlate("tenant_id", lead.tenant_id.as_str())
        .to_command();

        info!(call_id = %call_id, phone = %phone, "Originating call");
        let result = switch.bgapi(&command).await;
        inner.pending.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(reply) => {
                inner.ledger.clear(&lead.id);
                let ttl = Duration::from_secs(config.in_flight_ttl_secs);
                match inner.counters.incr(ACTIVE_CALLS_KEY, ttl).await {
                    Ok(count) => inner.last_in_flight.store(count.max(0) as usize, Ordering::SeqCst),
                    Err(e) => {
                        debug!("Could not bump in-flight counter: {}", e);
                        inner.last_in_flight.fetch_add(1, Ordering::SeqCst);
                    }
                }
                info!(call_id = %call_id, "✅ Originate accepted: {}", reply.trim());
                self.announce(names::CALL_INITIATED, &lead, &call_id, &phone, None).await;
            }
            Err(e) => {
                error!(call_id = %call_id, "Originate failed: {}", e);
                let status = match inner.ledger.record_failure(&lead.id) {
                    FailureVerdict::Retry { failures, after } => {
                        debug!(failures, retry_in_ms = after.as_millis() as u64, "lead returned for retry");
                        LeadStatus::New
                    }
                    FailureVerdict::GiveUp { failures } => {
                        warn!(failures, "Giving up on lead after repeated originate failures");
                        LeadStatus::Failed
                    }
                };
                if let Err(e) = inner.leads.update_status(&lead.id, status).await {
                    error!("Could not release lead {} after failed originate: {}", lead.id, e);
                }
                self.announce(names::CALL_FAILED, &lead, &call_id, &phone, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn announce(&self, name: &str, lead: &LeadToDial, call_id: &str, phone: &str, reason: Option<String>) {
        let mut data = json!({
            "callId": call_id,
            "leadId": lead.id,
            "campaignId": lead.campaign_id,
            "phoneNumber": phone,
            "direction": "outbound",
        });
        if let Some(reason) = reason {
            data["reason"] = json!(reason);
        }

        if let Err(e) = self
            .inner
            .bus
            .publish(channels::CALL, NewEvent::new(name, lead.tenant_id.as_str(), data))
            .await
        {
            warn!("Could not publish {} for {}: {}", name, call_id, e);
        }
    }
}
