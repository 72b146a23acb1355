//! Scripted switch fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdial_event_bus::{EventBus, EventBusConfig, MemoryStore};
use rdial_switch_control::{correlation_var, CallLeg, Result, SwitchApi, SwitchConnector, SwitchError};
use tokio::sync::mpsc;

pub fn memory_bus() -> (EventBus, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = EventBusConfig {
        idle_wait_ms: 10,
        error_backoff_ms: 10,
        ..Default::default()
    };
    (EventBus::with_store(store.clone(), config), store)
}

/// Control connection answering `show calls count` and recording originates
pub struct FakeSwitch {
    connected: AtomicBool,
    calls_count: Mutex<String>,
    fail_originates: AtomicBool,
    originate_delay: Mutex<Duration>,
    originates: Mutex<Vec<String>>,
    count_queries: AtomicUsize,
}

impl FakeSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            calls_count: Mutex::new("0 total.".to_string()),
            fail_originates: AtomicBool::new(false),
            originate_delay: Mutex::new(Duration::ZERO),
            originates: Mutex::new(Vec::new()),
            count_queries: AtomicUsize::new(0),
        })
    }

    pub fn set_calls_count(&self, count: usize) {
        *self.calls_count.lock() = format!("\n{} total.\n", count);
    }

    pub fn fail_originates(&self, fail: bool) {
        self.fail_originates.store(fail, Ordering::SeqCst);
    }

    pub fn set_originate_delay(&self, delay: Duration) {
        *self.originate_delay.lock() = delay;
    }

    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn originates(&self) -> Vec<String> {
        self.originates.lock().clone()
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }

    /// Lead ids carried by the recorded originate commands
    pub fn originated_leads(&self) -> Vec<String> {
        let marker = format!("{}=", correlation_var("lead_id"));
        self.originates()
            .iter()
            .filter_map(|command| {
                let start = command.find(&marker)? + marker.len();
                let rest = &command[start..];
                let end = rest.find([',', '}']).unwrap_or(rest.len());
                Some(rest[..end].to_string())
            })
            .collect()
    }
}

#[async_trait]
impl SwitchApi for FakeSwitch {
    async fn api(&self, command: &str) -> Result<String> {
        if command == "show calls count" {
            self.count_queries.fetch_add(1, Ordering::SeqCst);
            return Ok(self.calls_count.lock().clone());
        }
        Err(SwitchError::command_failed(command, "-ERR unknown command"))
    }

    async fn bgapi(&self, command: &str) -> Result<String> {
        let delay = *self.originate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.originates.lock().push(command.to_string());
        if self.fail_originates.load(Ordering::SeqCst) {
            return Err(SwitchError::command_failed("originate", "-ERR USER_BUSY"));
        }
        Ok("+OK 6f2d0e4a-1111-2222-3333-444455556666".to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out the same fake switch, unless told the switch is down
pub struct FakeConnector {
    switch: Arc<FakeSwitch>,
    available: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(switch: Arc<FakeSwitch>) -> Arc<Self> {
        Arc::new(Self {
            switch,
            available: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwitchConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn SwitchApi>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SwitchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.switch.connected.store(true, Ordering::SeqCst);
        Ok(self.switch.clone())
    }

    fn describe(&self) -> String {
        "fake-switch".to_string()
    }
}

/// An answered leg following a script of key presses and failures
pub struct ScriptedLeg {
    call_id: String,
    variables: HashMap<String, String>,
    /// Key presses sent this long after the digit subscription
    digits: Vec<(Duration, char)>,
    /// Close the digit stream right after subscribing
    hang_up_on_subscribe: bool,
    /// Application that fails with `-ERR`
    fail_app: Option<String>,
    /// Keeps the digit stream open until the leg is dropped
    digit_tx: Option<mpsc::UnboundedSender<char>>,
    pub commands: Vec<(String, String)>,
    pub detached: Vec<(String, String)>,
    pub released: bool,
}

impl ScriptedLeg {
    pub fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            variables: HashMap::new(),
            digits: Vec::new(),
            hang_up_on_subscribe: false,
            fail_app: None,
            digit_tx: None,
            commands: Vec::new(),
            detached: Vec::new(),
            released: false,
        }
    }

    /// A leg carrying the dialer's correlation variables
    pub fn for_lead(call_id: &str, lead_id: &str, campaign_id: &str, tenant_id: &str) -> Self {
        Self::new(call_id)
            .with_variable(&correlation_var("lead_id"), lead_id)
            .with_variable(&correlation_var("campaign_id"), campaign_id)
            .with_variable(&correlation_var("tenant_id"), tenant_id)
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    pub fn pressing(mut self, after: Duration, digit: char) -> Self {
        self.digits.push((after, digit));
        self
    }

    pub fn hanging_up_on_subscribe(mut self) -> Self {
        self.hang_up_on_subscribe = true;
        self
    }

    pub fn failing(mut self, app: &str) -> Self {
        self.fail_app = Some(app.to_string());
        self
    }

    pub fn executed(&self, app: &str) -> Option<&str> {
        self.commands
            .iter()
            .chain(self.detached.iter())
            .find(|(a, _)| a == app)
            .map(|(_, arg)| arg.as_str())
    }

    fn check(&self, app: &str) -> Result<()> {
        if self.fail_app.as_deref() == Some(app) {
            return Err(SwitchError::command_failed(app, "-ERR scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CallLeg for ScriptedLeg {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn variable(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.variables.get(name).cloned())
    }

    async fn execute(&mut self, app: &str, arg: &str) -> Result<()> {
        self.commands.push((app.to_string(), arg.to_string()));
        self.check(app)
    }

    async fn execute_detached(&mut self, app: &str, arg: &str) -> Result<()> {
        self.detached.push((app.to_string(), arg.to_string()));
        self.check(app)
    }

    async fn subscribe_dtmf(&mut self) -> Result<mpsc::UnboundedReceiver<char>> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (after, digit) in self.digits.clone() {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(digit);
            });
        }
        if !self.hang_up_on_subscribe {
            self.digit_tx = Some(tx);
        }
        Ok(rx)
    }

    async fn release(&mut self) {
        self.released = true;
        self.digit_tx = None;
    }
}
