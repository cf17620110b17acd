//! Persistent-channel adapter multiplexing calls over one TCP connection.
//!
//! Frames are newline-delimited JSON objects. A request frame is
//! `{"id": u64, "tool": str, "args": value}`; the matching reply carries the
//! same `id` and either a `result` or an `error` of the form
//! `{"code": i64, "message": str}`. Replies may arrive in any order.
//!
//! The reserved tools `_health` and `_info` serve the health probe and the
//! discovery info document.

use super::info::ServerInfoPayload;
use crate::gateway::{
    domain::{Endpoint, ServerDescriptor, ServerRecord, ToolName},
    ports::{ToolServerTransport, TransportError, TransportResult, deadline_after},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reserved tool answering health probes.
pub const HEALTH_TOOL: &str = "_health";

/// Reserved tool answering discovery info requests.
pub const INFO_TOOL: &str = "_info";

/// Error code a server uses to reject arguments.
pub const INVALID_PARAMS_CODE: i64 = -32602;

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    id: u64,
    tool: &'a str,
    args: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ReplyFrame {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorFrame>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorFrame {
    code: i64,
    #[serde(default)]
    message: String,
}

type Reply = Result<Value, ErrorFrame>;

/// Calls awaiting a reply, keyed by correlation id.
#[derive(Debug, Default)]
struct PendingCalls {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    closed: AtomicBool,
}

impl PendingCalls {
    /// Registers a waiter; returns `false` once the connection is closed.
    fn insert(&self, id: u64, waiter: oneshot::Sender<Reply>) -> bool {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        waiters.insert(id, waiter);
        true
    }

    fn remove(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Marks the connection dead and releases every waiter with a closed
    /// channel.
    fn close(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::Release);
        waiters.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One live connection and its reply-dispatching reader task.
#[derive(Debug)]
struct ChannelConnection {
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl ChannelConnection {
    fn open(stream: TcpStream, address: String) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(PendingCalls::default());
        let reader = tokio::spawn(read_replies(read_half, Arc::clone(&pending), address));
        Self {
            writer: AsyncMutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    async fn call(
        &self,
        tool: &str,
        args: &Value,
        deadline: Instant,
        budget: Duration,
    ) -> TransportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&RequestFrame { id, tool, args })
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        line.push(b'\n');

        let (waiter, reply) = oneshot::channel();
        if !self.pending.insert(id, waiter) {
            return Err(channel_closed());
        }

        let mut writing = false;
        let written = tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            writing = true;
            writer.write_all(&line).await?;
            writer.flush().await
        })
        .await;
        match written {
            Err(_) => {
                self.pending.remove(id);
                if writing {
                    // A partly written frame would corrupt the next one.
                    debug!(id, "write interrupted by deadline, retiring channel");
                    self.pending.close();
                }
                return Err(TransportError::Timeout(budget));
            }
            Ok(Err(err)) => {
                self.pending.remove(id);
                self.pending.close();
                return Err(TransportError::io(err));
            }
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout_at(deadline, reply).await {
            Err(_) => {
                self.pending.remove(id);
                Err(TransportError::Timeout(budget))
            }
            Ok(Err(_)) => Err(channel_closed()),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) if error.code == INVALID_PARAMS_CODE => {
                Err(TransportError::Rejected(error.message))
            }
            Ok(Ok(Err(error))) => Err(TransportError::Application {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

fn channel_closed() -> TransportError {
    TransportError::io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "channel closed before reply",
    ))
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(read_half: OwnedReadHalf, pending: Arc<PendingCalls>, address: String) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<ReplyFrame>(&line) {
                Ok(frame) => dispatch_reply(&pending, frame),
                Err(err) => warn!(%address, error = %err, "discarding malformed reply frame"),
            },
            Ok(None) => {
                debug!(%address, "channel closed by peer");
                break;
            }
            Err(err) => {
                warn!(%address, error = %err, "channel read failed");
                break;
            }
        }
    }
    pending.close();
}

fn dispatch_reply(pending: &PendingCalls, frame: ReplyFrame) {
    let Some(waiter) = pending.remove(frame.id) else {
        debug!(id = frame.id, "reply for unknown or expired call");
        return;
    };
    let reply = match (frame.error, frame.result) {
        (Some(error), _) => Err(error),
        (None, result) => Ok(result.unwrap_or(Value::Null)),
    };
    // The waiter may have timed out between removal and send.
    drop(waiter.send(reply));
}

/// Persistent-channel tool-server adapter.
///
/// Keeps at most one live connection per server address. Connections are
/// opened lazily and replaced once their reader observes EOF or an error.
#[derive(Debug, Default)]
pub struct ChannelToolTransport {
    connections: AsyncMutex<HashMap<String, Arc<ChannelConnection>>>,
}

impl ChannelToolTransport {
    /// Creates an adapter with no open connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many calls are awaiting replies on `endpoint`.
    pub async fn in_flight(&self, endpoint: &Endpoint) -> usize {
        self.connections
            .lock()
            .await
            .get(endpoint.address())
            .map_or(0, |connection| connection.pending.len())
    }

    async fn connection(
        &self,
        endpoint: &Endpoint,
        deadline: Instant,
        budget: Duration,
    ) -> TransportResult<Arc<ChannelConnection>> {
        let address = endpoint.address();
        if let Some(existing) = self.connections.lock().await.get(address)
            && !existing.is_closed()
        {
            return Ok(Arc::clone(existing));
        }

        let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(address)).await {
            Err(_) => return Err(TransportError::Timeout(budget)),
            Ok(Err(err)) => return Err(TransportError::io(err)),
            Ok(Ok(stream)) => stream,
        };
        debug!(%address, "opened persistent channel");

        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(address)
            && !existing.is_closed()
        {
            return Ok(Arc::clone(existing));
        }
        let connection = Arc::new(ChannelConnection::open(stream, address.to_owned()));
        connections.insert(address.to_owned(), Arc::clone(&connection));
        Ok(connection)
    }

    async fn call(
        &self,
        endpoint: &Endpoint,
        tool: &str,
        args: &Value,
        deadline: Instant,
    ) -> TransportResult<Value> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let connection = self.connection(endpoint, deadline, budget).await?;
        connection.call(tool, args, deadline, budget).await
    }
}

#[async_trait]
impl ToolServerTransport for ChannelToolTransport {
    async fn invoke(
        &self,
        server: &ServerRecord,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> TransportResult<Value> {
        self.call(server.endpoint(), tool.as_str(), &args, deadline)
            .await
    }

    async fn probe(&self, server: &ServerRecord, timeout: Duration) -> TransportResult<()> {
        match self
            .call(
                server.endpoint(),
                HEALTH_TOOL,
                &json!({}),
                deadline_after(timeout),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(TransportError::Application { message, .. }) => {
                Err(TransportError::Unhealthy(message))
            }
            Err(err) => Err(err),
        }
    }

    async fn describe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> TransportResult<ServerDescriptor> {
        let info = self
            .call(endpoint, INFO_TOOL, &json!({}), deadline_after(timeout))
            .await?;
        let payload: ServerInfoPayload = serde_json::from_value(info)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        Ok(payload.into_descriptor(endpoint.clone())?)
    }
}
