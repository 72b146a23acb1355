//! Outbound sessions: the switch connects to us once per answered call
//!
//! Every accepted socket is handshaken with `connect`, which returns the
//! channel's data as headers, then `myevents` so the session receives its
//! own channel's events, and `linger` so trailing events are not cut off by
//! the hangup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::api::CallLeg;
use crate::commands::getvar;
use crate::connection::EslConnection;
use crate::error::{Result, SwitchError};
use crate::event::{decode_value, SwitchEvent, CHANNEL_EXECUTE_COMPLETE};
use crate::message::{encode_command, EslMessage};

/// Reply body of `uuid_getvar` for an unset variable
const UNDEFINED_VARIABLE: &str = "_undef_";

/// Settings for outbound sessions
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub command_timeout: Duration,
    /// Upper bound for one blocking `execute`, e.g. a long playback
    pub execute_timeout: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            execute_timeout: Duration::from_secs(300),
        }
    }
}

/// Listener the switch's `socket` application connects to
pub struct OutboundListener {
    listener: TcpListener,
    config: OutboundConfig,
}

impl OutboundListener {
    pub async fn bind(address: &str, config: OutboundConfig) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        debug!("outbound listener bound on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next raw connection.
    ///
    /// The handshake is left to [`PendingLeg::establish`] so a slow peer
    /// never stalls the accept loop.
    pub async fn accept(&self) -> Result<PendingLeg> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(PendingLeg {
            stream,
            peer,
            config: self.config.clone(),
        })
    }
}

/// An accepted socket that has not been handshaken yet
pub struct PendingLeg {
    stream: TcpStream,
    peer: SocketAddr,
    config: OutboundConfig,
}

impl PendingLeg {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn establish(self) -> Result<OutboundSession> {
        OutboundSession::establish(self.stream, self.peer, self.config).await
    }
}

/// Control over one call leg
pub struct OutboundSession {
    conn: Arc<EslConnection>,
    events: mpsc::UnboundedReceiver<SwitchEvent>,
    channel: HashMap<String, String>,
    call_id: String,
    config: OutboundConfig,
    released: bool,
}

impl OutboundSession {
    async fn establish(stream: TcpStream, peer: SocketAddr, config: OutboundConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events) = mpsc::unbounded_channel();
        let conn = EslConnection::start(
            BufReader::new(read_half),
            write_half,
            peer,
            Some(events_tx),
            config.command_timeout,
        );

        let reply = conn.send(encode_command("connect", &[])).await?;
        let channel = channel_data(&reply);
        let call_id = channel
            .get("Unique-ID")
            .or_else(|| channel.get("Channel-Unique-ID"))
            .cloned()
            .ok_or_else(|| SwitchError::protocol("connect reply carried no Unique-ID"))?;

        for command in ["myevents", "linger"] {
            let reply = conn.send(encode_command(command, &[])).await?;
            if reply.is_error() {
                return Err(SwitchError::command_failed(command, reply.outcome()));
            }
        }

        debug!("outbound session {} established from {}", call_id, peer);
        Ok(Self {
            conn,
            events,
            channel,
            call_id,
            config,
            released: false,
        })
    }

    /// Channel data from the `connect` reply
    pub fn channel_data(&self) -> &HashMap<String, String> {
        &self.channel
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    async fn sendmsg(&self, app: &str, arg: &str, event_uuid: &str, lock: bool) -> Result<()> {
        let mut headers = vec![
            ("call-command", "execute"),
            ("execute-app-name", app),
        ];
        if !arg.is_empty() {
            headers.push(("execute-app-arg", arg));
        }
        if lock {
            headers.push(("event-lock", "true"));
        }
        headers.push(("Event-UUID", event_uuid));

        let reply = self.conn.send(encode_command("sendmsg", &headers)).await?;
        if reply.is_error() {
            return Err(SwitchError::command_failed(
                format!("execute {} {}", app, arg),
                reply.outcome(),
            ));
        }
        Ok(())
    }

    /// Wait for the completion event of the application tagged `event_uuid`
    async fn wait_complete(&mut self, app: &str, event_uuid: &str) -> Result<()> {
        let limit = self.config.execute_timeout;
        let wait = async {
            loop {
                let event = self.events.recv().await.ok_or(SwitchError::ConnectionClosed)?;
                if event.is_hangup() {
                    return Err(SwitchError::Hangup {
                        cause: event.hangup_cause().unwrap_or("UNKNOWN").to_string(),
                    });
                }
                if event.is(CHANNEL_EXECUTE_COMPLETE) && event.application_uuid() == Some(event_uuid) {
                    trace!(
                        "{} completed on {}: {:?}",
                        app,
                        self.call_id,
                        event.header("Application-Response")
                    );
                    return Ok(());
                }
            }
        };

        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(SwitchError::timeout(format!("execute {}", app), limit)),
        }
    }
}

#[async_trait]
impl CallLeg for OutboundSession {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn variable(&mut self, name: &str) -> Result<Option<String>> {
        if let Some(value) = self.channel.get(&format!("variable_{}", name)) {
            return Ok(Some(value.clone()));
        }

        match self.conn.api(&getvar(&self.call_id, name)).await {
            Ok(value) if value.is_empty() || value == UNDEFINED_VARIABLE => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(SwitchError::CommandFailed { reply, .. }) => {
                debug!("uuid_getvar {} on {} failed: {}", name, self.call_id, reply);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&mut self, app: &str, arg: &str) -> Result<()> {
        let event_uuid = Uuid::new_v4().to_string();
        self.sendmsg(app, arg, &event_uuid, true).await?;
        self.wait_complete(app, &event_uuid).await
    }

    async fn execute_detached(&mut self, app: &str, arg: &str) -> Result<()> {
        let event_uuid = Uuid::new_v4().to_string();
        self.sendmsg(app, arg, &event_uuid, false).await
    }

    async fn subscribe_dtmf(&mut self) -> Result<mpsc::UnboundedReceiver<char>> {
        // Key presses from before this point stay in the general queue and
        // are never reported as input.
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn.route_dtmf(Some(tx));

        let reply = self.conn.send(encode_command("event plain DTMF", &[])).await?;
        if reply.is_error() {
            self.conn.route_dtmf(None);
            return Err(SwitchError::command_failed("event plain DTMF", reply.outcome()));
        }
        Ok(rx)
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.conn.route_dtmf(None);
        if !self.conn.is_closed() {
            if let Err(e) = self.conn.send(encode_command("nixevent DTMF", &[])).await {
                trace!("nixevent on {} failed: {}", self.call_id, e);
            }
        }
        self.conn.shutdown().await;
        debug!("released call leg {}", self.call_id);
    }
}

impl Drop for OutboundSession {
    fn drop(&mut self) {
        if !self.released {
            warn!("call leg {} dropped without release", self.call_id);
        }
    }
}

/// Percent-decoded channel data from the `connect` reply headers
fn channel_data(reply: &EslMessage) -> HashMap<String, String> {
    reply
        .headers()
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v)))
        .collect()
}
