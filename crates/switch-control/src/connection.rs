//! Shared connection core for inbound and outbound sockets
//!
//! A single reader task owns the read half. Replies to `api`, `bgapi` and
//! `sendmsg` arrive strictly in the order the commands were written, so they
//! are matched to waiters through a FIFO queue that is pushed while the
//! writer lock is held. Background job results are matched by `Job-UUID`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Result, SwitchError};
use crate::event::{self, SwitchEvent};
use crate::message::{content_type, encode_command, read_message, EslMessage};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) struct EslConnection {
    peer: SocketAddr,
    writer: AsyncMutex<BoxedWriter>,
    replies: Mutex<VecDeque<oneshot::Sender<EslMessage>>>,
    jobs: DashMap<String, oneshot::Sender<SwitchEvent>>,
    events: Mutex<Option<mpsc::UnboundedSender<SwitchEvent>>>,
    dtmf: Mutex<Option<mpsc::UnboundedSender<char>>>,
    closed: AtomicBool,
    command_timeout: Duration,
}

impl EslConnection {
    /// Take over an already handshaken stream and start the reader task.
    ///
    /// Events that are neither job results nor routed DTMF go to `events`.
    pub(crate) fn start<R, W>(
        reader: BufReader<R>,
        writer: W,
        peer: SocketAddr,
        events: Option<mpsc::UnboundedSender<SwitchEvent>>,
        command_timeout: Duration,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Arc::new(Self {
            peer,
            writer: AsyncMutex::new(Box::new(writer)),
            replies: Mutex::new(VecDeque::new()),
            jobs: DashMap::new(),
            events: Mutex::new(events),
            dtmf: Mutex::new(None),
            closed: AtomicBool::new(false),
            command_timeout,
        });

        tokio::spawn(read_loop(reader, Arc::downgrade(&conn)));
        conn
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write a raw frame and wait for its reply
    pub(crate) async fn send(&self, frame: String) -> Result<EslMessage> {
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Err(SwitchError::ConnectionClosed);
            }
            self.replies.lock().push_back(tx);
            if let Err(e) = write_frame(&mut *writer, &frame).await {
                self.mark_closed();
                return Err(e);
            }
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SwitchError::ConnectionClosed),
            Err(_) => {
                // a late reply would be matched to the next waiter
                warn!("no reply from {} to {}, dropping the connection", self.peer, first_line(&frame));
                self.mark_closed();
                Err(SwitchError::timeout(first_line(&frame), self.command_timeout))
            }
        }
    }

    /// Synchronous `api` command; returns the response body
    pub(crate) async fn api(&self, command: &str) -> Result<String> {
        let reply = self.send(encode_command(&format!("api {}", command), &[])).await?;
        if reply.is_error() {
            return Err(SwitchError::command_failed(command, reply.outcome()));
        }
        Ok(reply.body().unwrap_or_default().trim().to_string())
    }

    /// Background `bgapi` command; resolves when the job result event arrives
    pub(crate) async fn bgapi(&self, command: &str, job_timeout: Duration) -> Result<String> {
        let job_uuid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.jobs.insert(job_uuid.clone(), tx);

        let frame = encode_command(&format!("bgapi {}", command), &[("Job-UUID", &job_uuid)]);
        let reply = match self.send(frame).await {
            Ok(reply) => reply,
            Err(e) => {
                self.jobs.remove(&job_uuid);
                return Err(e);
            }
        };
        if reply.is_error() {
            self.jobs.remove(&job_uuid);
            return Err(SwitchError::command_failed(command, reply.outcome()));
        }
        debug!("bgapi accepted, job {}", job_uuid);

        let result = match tokio::time::timeout(job_timeout, rx).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => return Err(SwitchError::ConnectionClosed),
            Err(_) => {
                self.jobs.remove(&job_uuid);
                return Err(SwitchError::timeout(format!("bgapi {}", command), job_timeout));
            }
        };

        let body = result.body().unwrap_or_default().trim().to_string();
        if body.starts_with("-ERR") || body.starts_with("-USAGE") {
            return Err(SwitchError::command_failed(command, body));
        }
        Ok(body)
    }

    /// Route DTMF events to `sink` instead of the general event channel
    pub(crate) fn route_dtmf(&self, sink: Option<mpsc::UnboundedSender<char>>) {
        *self.dtmf.lock() = sink;
    }

    /// Close the write side; the reader task ends once the peer hangs up
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("shutdown of {} failed: {}", self.peer, e);
        }
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders wakes every waiter with a closed error.
        self.replies.lock().clear();
        self.jobs.clear();
        self.events.lock().take();
        self.dtmf.lock().take();
        debug!("connection to {} closed", self.peer);
    }

    /// Handle one inbound frame; false means the switch is going away
    fn dispatch(&self, message: EslMessage) -> bool {
        match message.content_type() {
            Some(content_type::COMMAND_REPLY) | Some(content_type::API_RESPONSE) => {
                match self.replies.lock().pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => warn!("unsolicited reply from {}: {}", self.peer, message.outcome()),
                }
                true
            }
            Some(content_type::EVENT_PLAIN) => {
                let body = message.body().unwrap_or_default();
                match SwitchEvent::parse_plain(body) {
                    Ok(event) => self.route_event(event),
                    Err(e) => warn!("dropping undecodable event from {}: {}", self.peer, e),
                }
                true
            }
            Some(content_type::DISCONNECT_NOTICE) | Some(content_type::RUDE_REJECTION) => {
                debug!("switch at {} sent {:?}", self.peer, message.content_type());
                false
            }
            other => {
                trace!("ignoring frame with content type {:?}", other);
                true
            }
        }
    }

    fn route_event(&self, event: SwitchEvent) {
        if event.is(event::BACKGROUND_JOB) {
            if let Some(job) = event.job_uuid() {
                if let Some((_, waiter)) = self.jobs.remove(job) {
                    let _ = waiter.send(event);
                    return;
                }
            }
        }

        if event.is(event::DTMF) {
            if let (Some(sink), Some(digit)) = (self.dtmf.lock().as_ref(), event.dtmf_digit()) {
                let _ = sink.send(digit);
                return;
            }
        }

        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, conn: Weak<EslConnection>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!("event socket read failed: {}", e);
                break;
            }
        };

        let Some(conn) = conn.upgrade() else { break };
        if !conn.dispatch(message) {
            break;
        }
    }

    if let Some(conn) = conn.upgrade() {
        conn.mark_closed();
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn first_line(frame: &str) -> String {
    frame.lines().next().unwrap_or_default().to_string()
}
