//! # Fronter
//!
//! Drives one answered outbound call through the cold-call flow:
//!
//! ```text
//! ANSWERING -> PLAYING_INTRO -> AWAITING_INPUT -> TRANSFERRING -> TERMINAL
//!                                              \-> HANGING_UP  -> TERMINAL
//! ```
//!
//! Key `1` transfers the caller to the configured destination, `9` ends the
//! call as not interested, silence ends it as no response and any other key
//! as other. A switch error anywhere hangs up and records the lead as
//! FAILED. The lead's final status is written and the leg released on every
//! path.
//!
//! The flow only talks to the leg through [`CallLeg`], so each leg is
//! isolated from every other and tests can drive it with a scripted fake.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rdial_event_bus::{channels, names, EventBus, NewEvent};
use rdial_infra_common::LogContext;
use rdial_switch_control::{correlation_var, CallLeg, SwitchError};
use serde_json::{json, Value};
use tracing::{error, info, warn, Instrument, Level};

use crate::config::FronterConfig;
use crate::store::LeadStore;
use crate::types::LeadStatus;

pub mod dtmf;
pub mod server;

pub use dtmf::{wait_for_digit, DigitWait, SingleWinner};
pub use server::FronterServer;

/// Hangup cause used for every hangup we initiate
const HANGUP_CAUSE: &str = "NORMAL_CLEARING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FronterState {
    Answering,
    PlayingIntro,
    AwaitingInput,
    Transferring,
    HangingUp,
    Terminal,
}

impl fmt::Display for FronterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FronterState::Answering => "ANSWERING",
            FronterState::PlayingIntro => "PLAYING_INTRO",
            FronterState::AwaitingInput => "AWAITING_INPUT",
            FronterState::Transferring => "TRANSFERRING",
            FronterState::HangingUp => "HANGING_UP",
            FronterState::Terminal => "TERMINAL",
        };
        f.write_str(name)
    }
}

/// How an answered call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Transferred,
    NotInterested,
    NoResponse,
    Other,
    Failed,
}

impl Disposition {
    /// The lead status recording this outcome
    pub fn lead_status(&self) -> LeadStatus {
        match self {
            Disposition::Transferred => LeadStatus::Transferred,
            Disposition::NotInterested => LeadStatus::NotInterested,
            Disposition::NoResponse => LeadStatus::NoResponse,
            Disposition::Other => LeadStatus::Other,
            Disposition::Failed => LeadStatus::Failed,
        }
    }

    /// Outcome of the key-press wait
    pub fn from_input(input: DigitWait) -> Option<Disposition> {
        match input {
            DigitWait::Digit('1') => Some(Disposition::Transferred),
            DigitWait::Digit('9') => Some(Disposition::NotInterested),
            DigitWait::Digit(_) => Some(Disposition::Other),
            DigitWait::TimedOut => Some(Disposition::NoResponse),
            DigitWait::Closed => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lead_status().as_str())
    }
}

/// Correlation ids the dialer attached to the leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegCorrelation {
    pub call_id: String,
    pub lead_id: Option<String>,
    pub campaign_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Result of driving one leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FronterOutcome {
    pub correlation: LegCorrelation,
    /// States in the order they were entered
    pub states: Vec<FronterState>,
    pub disposition: Disposition,
    pub digit: Option<char>,
}

/// Runs the answered-call flow
pub struct Fronter {
    config: FronterConfig,
    leads: Arc<dyn LeadStore>,
    bus: EventBus,
}

impl Fronter {
    pub fn new(config: FronterConfig, leads: Arc<dyn LeadStore>, bus: EventBus) -> Self {
        Self { config, leads, bus }
    }

    pub fn config(&self) -> &FronterConfig {
        &self.config
    }

    /// Drive `leg` to a disposition. Never fails: errors end the flow as FAILED.
    pub async fn handle<L: CallLeg + ?Sized>(&self, leg: &mut L) -> FronterOutcome {
        let correlation = read_correlation(leg).await;
        let span = LogContext::with_operation("fronter", "handle_leg")
            .with_field("call_id", correlation.call_id.as_str())
            .with_optional_field("lead_id", correlation.lead_id.as_deref())
            .with_optional_field("campaign_id", correlation.campaign_id.as_deref())
            .span(Level::INFO);

        self.drive(leg, correlation).instrument(span).await
    }

    async fn drive<L: CallLeg + ?Sized>(&self, leg: &mut L, correlation: LegCorrelation) -> FronterOutcome {
        info!("📞 Handling answered call");
        self.set_lead_status(&correlation, LeadStatus::InCall).await;
        self.announce(names::CALL_ANSWERED, &correlation, json!({})).await;

        let mut states = Vec::new();
        let (disposition, digit) = match self.run_flow(leg, &correlation, &mut states).await {
            Ok(result) => result,
            Err(e) => {
                error!("Call flow failed in {}: {}", states.last().copied().unwrap_or(FronterState::Answering), e);
                states.push(FronterState::HangingUp);
                if !e.is_connection_lost() {
                    if let Err(e) = leg.execute_detached("hangup", HANGUP_CAUSE).await {
                        warn!("Hangup after failure did not go through: {}", e);
                    }
                }
                (Disposition::Failed, None)
            }
        };

        states.push(FronterState::Terminal);
        if disposition != Disposition::Transferred {
            self.set_lead_status(&correlation, disposition.lead_status()).await;
        }
        leg.release().await;

        self.announce(
            names::CALL_ENDED,
            &correlation,
            json!({ "disposition": disposition.to_string(), "digit": digit.map(String::from) }),
        )
        .await;
        info!("✅ Call finished with {}", disposition);

        FronterOutcome {
            correlation,
            states,
            disposition,
            digit,
        }
    }

    async fn run_flow<L: CallLeg + ?Sized>(
        &self,
        leg: &mut L,
        correlation: &LegCorrelation,
        states: &mut Vec<FronterState>,
    ) -> Result<(Disposition, Option<char>), SwitchError> {
        states.push(FronterState::Answering);
        answer(leg).await?;
        leg.execute("sleep", &self.config.answer_pause_ms.to_string()).await?;

        states.push(FronterState::PlayingIntro);
        let intro = self.intro_audio(correlation.campaign_id.as_deref()).await;
        info!(file = %intro, "Playing intro");
        leg.execute("playback", &intro).await?;

        states.push(FronterState::AwaitingInput);
        let digits = leg.subscribe_dtmf().await?;
        let input = wait_for_digit(digits, self.config.dtmf_timeout()).await;
        let digit = match input {
            DigitWait::Digit(c) => Some(c),
            _ => None,
        };
        info!(?input, "Caller input");

        let disposition = Disposition::from_input(input).ok_or(SwitchError::ConnectionClosed)?;
        if disposition == Disposition::Transferred {
            states.push(FronterState::Transferring);
            self.set_lead_status(correlation, LeadStatus::Transferred).await;

            let target = self.config.transfer_target();
            info!(destination = %self.config.transfer_destination, "Transferring call");
            leg.execute_detached("transfer", &target).await?;
            self.announce(
                names::CALL_TRANSFERRED,
                correlation,
                json!({ "destination": self.config.transfer_destination }),
            )
            .await;
        } else {
            states.push(FronterState::HangingUp);
            info!(reason = %disposition, "Hanging up");
            leg.execute_detached("hangup", HANGUP_CAUSE).await?;
        }

        Ok((disposition, digit))
    }

    async fn intro_audio(&self, campaign_id: Option<&str>) -> String {
        if let Some(campaign_id) = campaign_id {
            match self.leads.campaign_intro_audio(campaign_id).await {
                Ok(Some(audio)) if !audio.is_empty() => return audio,
                Ok(_) => {}
                Err(e) => warn!("Could not load campaign intro, using default: {}", e),
            }
        }
        self.config.intro_audio.clone()
    }

    async fn set_lead_status(&self, correlation: &LegCorrelation, status: LeadStatus) {
        let Some(lead_id) = correlation.lead_id.as_deref() else {
            return;
        };
        if let Err(e) = self.leads.update_status(lead_id, status).await {
            error!("Failed to update lead {} to {}: {}", lead_id, status, e);
        }
    }

    async fn announce(&self, name: &str, correlation: &LegCorrelation, extra: Value) {
        let mut data = json!({
            "callId": correlation.call_id,
            "leadId": correlation.lead_id,
            "campaignId": correlation.campaign_id,
        });
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }

        let tenant = correlation.tenant_id.clone().unwrap_or_default();
        if let Err(e) = self.bus.publish(channels::CALL, NewEvent::new(name, tenant, data)).await {
            warn!("Could not publish {}: {}", name, e);
        }
    }
}

/// Read back the correlation variables set at originate time
pub async fn read_correlation<L: CallLeg + ?Sized>(leg: &mut L) -> LegCorrelation {
    let read = |value: Result<Option<String>, SwitchError>, name: &str| match value {
        Ok(value) => value.filter(|v| !v.is_empty()),
        Err(e) => {
            warn!("Could not read {}: {}", name, e);
            None
        }
    };

    let lead_var = correlation_var("lead_id");
    let campaign_var = correlation_var("campaign_id");
    let tenant_var = correlation_var("tenant_id");
    let lead_id = read(leg.variable(&lead_var).await, &lead_var);
    let campaign_id = read(leg.variable(&campaign_var).await, &campaign_var);
    let tenant_id = read(leg.variable(&tenant_var).await, &tenant_var);

    LegCorrelation {
        call_id: leg.call_id().to_string(),
        lead_id,
        campaign_id,
        tenant_id,
    }
}

/// `answer` is idempotent, so a refused answer is tried once more
async fn answer<L: CallLeg + ?Sized>(leg: &mut L) -> Result<(), SwitchError> {
    match leg.execute("answer", "").await {
        Err(SwitchError::CommandFailed { reply, .. }) => {
            warn!("Answer refused ({}), retrying once", reply);
            tokio::time::sleep(Duration::from_millis(100)).await;
            leg.execute("answer", "").await
        }
        other => other,
    }
}
