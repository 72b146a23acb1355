//! Engine configuration
//!
//! Loaded from an optional file and `RDIAL_`-prefixed environment variables,
//! with `__` separating sections: `RDIAL_DIALER__MAX_CONCURRENT=25` sets
//! `dialer.max_concurrent`. Every section has working defaults.

use std::path::Path;
use std::time::Duration;

use rdial_event_bus::EventBusConfig;
use rdial_infra_common::LoggingConfig;
use rdial_switch_control::{InboundConfig, OutboundConfig};
use serde::Deserialize;

use crate::dialer::RetryPolicy;
use crate::error::{EngineError, Result};

/// Top level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    pub switch: SwitchSettings,
    pub dialer: DialerConfig,
    pub fronter: FronterConfig,
    pub store: StoreSettings,
    pub events: EventBusConfig,
    pub call_state: CallStateConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

impl CallEngineConfig {
    /// Load from `path` (if any) overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RDIAL")
                .separator("__")
                .try_parsing(true),
        );

        let config: CallEngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dialer.max_concurrent == 0 {
            return Err(EngineError::config("dialer.max_concurrent must be at least 1"));
        }
        if self.dialer.batch_size == 0 {
            return Err(EngineError::config("dialer.batch_size must be at least 1"));
        }
        if self.dialer.poll_interval_ms == 0 {
            return Err(EngineError::config("dialer.poll_interval_ms must be positive"));
        }
        if self.fronter.dtmf_timeout_ms == 0 {
            return Err(EngineError::config("fronter.dtmf_timeout_ms must be positive"));
        }
        if self.fronter.transfer_destination.trim().is_empty() {
            return Err(EngineError::config("fronter.transfer_destination is required"));
        }
        Ok(())
    }
}

/// Event socket connection to the switch
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwitchSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Upper bound for a background job such as `originate`
    pub job_timeout_secs: u64,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8021,
            password: "ClueCon".to_string(),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 5_000,
            job_timeout_secs: 90,
        }
    }
}

impl SwitchSettings {
    pub fn inbound(&self) -> InboundConfig {
        InboundConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
        }
    }
}

/// Autodialer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Ceiling on calls in flight across the switch
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    /// Most leads fetched in one tick
    pub batch_size: usize,
    pub caller_id: String,
    pub caller_id_name: String,
    /// Prefix of the dial string; the E.164 number is appended
    pub gateway: String,
    /// Where the switch hands answered calls back to us
    pub socket_host: String,
    pub socket_port: u16,
    /// Lifetime of the cached in-flight count
    pub in_flight_ttl_secs: u64,
    /// Consecutive originate failures before a lead is marked FAILED; 0 retries forever
    pub max_originate_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub reconcile_interval_secs: u64,
    /// How long a lead may sit in DIALING before the sweep releases it
    pub dialing_grace_secs: u64,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            poll_interval_ms: 1_000,
            batch_size: 50,
            caller_id: "+15551234567".to_string(),
            caller_id_name: "rdial".to_string(),
            gateway: "sofia/gateway/telnyx".to_string(),
            socket_host: "127.0.0.1".to_string(),
            socket_port: 8084,
            in_flight_ttl_secs: 15,
            max_originate_attempts: 5,
            retry_backoff_ms: 5_000,
            max_retry_backoff_ms: 300_000,
            reconcile_interval_secs: 60,
            dialing_grace_secs: 300,
        }
    }
}

impl DialerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.socket_host, self.socket_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_originate_attempts,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_retry_backoff_ms),
        }
    }
}

/// Answered-call flow settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FronterConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// How long to wait for a key press after the intro
    pub dtmf_timeout_ms: u64,
    /// Played when the campaign has no intro of its own
    pub intro_audio: String,
    pub transfer_destination: String,
    pub transfer_dialplan: String,
    pub transfer_context: String,
    /// Silence after answering so the intro is not clipped
    pub answer_pause_ms: u64,
    pub command_timeout_ms: u64,
    pub execute_timeout_secs: u64,
}

impl Default for FronterConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8084,
            dtmf_timeout_ms: 10_000,
            intro_audio: "ivr/ivr-welcome.wav".to_string(),
            transfer_destination: "queue-default".to_string(),
            transfer_dialplan: "XML".to_string(),
            transfer_context: "default".to_string(),
            answer_pause_ms: 500,
            command_timeout_ms: 5_000,
            execute_timeout_secs: 300,
        }
    }
}

impl FronterConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn dtmf_timeout(&self) -> Duration {
        Duration::from_millis(self.dtmf_timeout_ms)
    }

    /// Argument of the `transfer` application
    pub fn transfer_target(&self) -> String {
        format!(
            "{} {} {}",
            self.transfer_destination, self.transfer_dialplan, self.transfer_context
        )
    }

    pub fn outbound(&self) -> OutboundConfig {
        OutboundConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            execute_timeout: Duration::from_secs(self.execute_timeout_secs),
        }
    }
}

/// Durable and fast store connections
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub redis_url: String,
    pub redis_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/rdial".to_string(),
            max_connections: 10,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallStateConfig {
    /// Lifetime of a live call state, refreshed on every write
    pub ttl_secs: u64,
}

impl Default for CallStateConfig {
    fn default() -> Self {
        Self { ttl_secs: 3_600 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub status_ttl_secs: u64,
    /// Mark agent-originated calls answered after this long if nothing else
    /// does; 0 disables the fallback
    pub answer_fallback_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 86_400,
            answer_fallback_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallEngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dialer.max_concurrent, 10);
        assert_eq!(config.fronter.transfer_target(), "queue-default XML default");
        assert_eq!(config.events.stream_key, "events:stream");
        assert_eq!(config.switch.inbound().address(), "localhost:8021");
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = CallEngineConfig::default();
        config.dialer.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_sections() {
        std::env::set_var("RDIAL_DIALER__MAX_CONCURRENT", "25");
        std::env::set_var("RDIAL_FRONTER__TRANSFER_DESTINATION", "sales");
        let config = CallEngineConfig::load(None);
        std::env::remove_var("RDIAL_DIALER__MAX_CONCURRENT");
        std::env::remove_var("RDIAL_FRONTER__TRANSFER_DESTINATION");

        let config = config.unwrap();
        assert_eq!(config.dialer.max_concurrent, 25);
        assert_eq!(config.fronter.transfer_destination, "sales");
        assert_eq!(config.dialer.batch_size, 50);
    }
}
