//! Inbound control connection
//!
//! We dial the switch's event socket, authenticate with the shared password
//! and subscribe to background job results so `bgapi` calls can be resolved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::api::{SwitchApi, SwitchConnector};
use crate::connection::{write_frame, EslConnection};
use crate::error::{Result, SwitchError};
use crate::message::{content_type, encode_command, read_message};

/// Settings for the inbound control connection
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long a `bgapi` job may run before we give up on its result
    pub job_timeout: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8021,
            password: "ClueCon".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(90),
        }
    }
}

impl InboundConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An authenticated control connection
pub struct InboundClient {
    conn: Arc<EslConnection>,
    job_timeout: Duration,
}

impl InboundClient {
    /// Connect, authenticate and subscribe to job results
    pub async fn connect(config: &InboundConfig) -> Result<Self> {
        let address = config.address();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| SwitchError::timeout(format!("connect {}", address), config.connect_timeout))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The switch greets with an auth request before accepting anything.
        let greeting = tokio::time::timeout(config.command_timeout, read_message(&mut reader))
            .await
            .map_err(|_| SwitchError::timeout("auth/request", config.command_timeout))??
            .ok_or(SwitchError::ConnectionClosed)?;
        if greeting.content_type() != Some(content_type::AUTH_REQUEST) {
            return Err(SwitchError::protocol(format!(
                "expected auth/request, got {:?}",
                greeting.content_type()
            )));
        }

        let auth = encode_command(&format!("auth {}", config.password), &[]);
        write_frame(&mut write_half, &auth).await?;
        let reply = tokio::time::timeout(config.command_timeout, read_message(&mut reader))
            .await
            .map_err(|_| SwitchError::timeout("auth", config.command_timeout))??
            .ok_or(SwitchError::ConnectionClosed)?;
        if !reply.reply_text().is_some_and(|t| t.starts_with("+OK")) {
            return Err(SwitchError::AuthFailed {
                reply: reply.outcome(),
            });
        }
        debug!("authenticated with switch at {}", peer);

        let conn = EslConnection::start(reader, write_half, peer, None, config.command_timeout);
        let subscribed = conn
            .send(encode_command("event plain BACKGROUND_JOB", &[]))
            .await?;
        if subscribed.is_error() {
            return Err(SwitchError::command_failed(
                "event plain BACKGROUND_JOB",
                subscribed.outcome(),
            ));
        }

        info!("✅ Connected to switch event socket at {}", peer);
        Ok(Self {
            conn,
            job_timeout: config.job_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    /// Close the control connection
    pub async fn close(&self) {
        self.conn.shutdown().await;
    }
}

#[async_trait]
impl SwitchApi for InboundClient {
    async fn api(&self, command: &str) -> Result<String> {
        self.conn.api(command).await
    }

    async fn bgapi(&self, command: &str) -> Result<String> {
        self.conn.bgapi(command, self.job_timeout).await
    }

    fn is_connected(&self) -> bool {
        !self.conn.is_closed()
    }
}

/// Opens [`InboundClient`] connections on demand
#[derive(Debug, Clone)]
pub struct InboundConnector {
    config: InboundConfig,
}

impl InboundConnector {
    pub fn new(config: InboundConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SwitchConnector for InboundConnector {
    async fn connect(&self) -> Result<Arc<dyn SwitchApi>> {
        let client = InboundClient::connect(&self.config).await?;
        Ok(Arc::new(client))
    }

    fn describe(&self) -> String {
        self.config.address()
    }
}
