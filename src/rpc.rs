//! Request/response correlation over a one-way message channel to the admin
//! frame.
//!
//! Every call gets a fresh correlation id and a slot in the pending table.
//! Responses come back through [`RpcClient::handle_message`], which only
//! trusts messages from the admin origin, removes the slot and then resolves
//! the waiting [`PendingCall`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};
use url::Url;

/// Ids at or below this value are never handed out.
const UID_SENTINEL: u64 = 1;

pub trait FrameTransport: Send + Sync {
    fn post_message(&self, message: &str, target_origin: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("admin frame returned an error: {0}")]
    Remote(Value),
    #[error("admin call {uid} timed out after {timeout:?}")]
    Timeout { uid: u64, timeout: Duration },
    #[error("admin channel closed")]
    Closed,
    #[error("failed to post to admin frame: {0}")]
    Transport(String),
    #[error("invalid admin url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("admin url {0} has no usable origin")]
    OpaqueOrigin(String),
    #[error("failed to encode admin request")]
    Encode(#[from] serde_json::Error),
}

type Reply = std::result::Result<Value, RpcError>;
type PendingTable = Arc<Mutex<HashMap<u64, Sender<Reply>>>>;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    uid: u64,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

/// Origin (`scheme://host[:port]`) the admin frame is served from.
pub fn admin_origin(admin_url: &str) -> std::result::Result<String, RpcError> {
    let url = Url::parse(admin_url)?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(RpcError::OpaqueOrigin(admin_url.to_string()));
    }
    Ok(origin.ascii_serialization())
}

pub struct RpcClient {
    transport: Arc<dyn FrameTransport>,
    origin: String,
    next_uid: AtomicU64,
    pending: PendingTable,
    closed: AtomicBool,
}

impl RpcClient {
    pub fn new(
        admin_url: &str,
        transport: Arc<dyn FrameTransport>,
    ) -> std::result::Result<Self, RpcError> {
        Ok(Self {
            transport,
            origin: admin_origin(admin_url)?,
            next_uid: AtomicU64::new(UID_SENTINEL),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Posts `{uid, action, ...args}` to the admin frame and registers the
    /// call. `uid` and `action` always win over same-named args.
    pub fn call(
        &self,
        action: &str,
        args: Map<String, Value>,
    ) -> std::result::Result<PendingCall, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst) + 1;

        let mut payload = args;
        payload.insert("uid".into(), Value::from(uid));
        payload.insert("action".into(), Value::from(action));
        let message = serde_json::to_string(&Value::Object(payload))?;

        let (tx, rx) = bounded(1);
        self.pending.lock().insert(uid, tx);

        if let Err(err) = self.transport.post_message(&message, &self.origin) {
            self.pending.lock().remove(&uid);
            return Err(RpcError::Transport(format!("{err:#}")));
        }
        debug!(uid, action, "posted admin request");

        Ok(PendingCall {
            uid,
            rx,
            pending: self.pending.clone(),
        })
    }

    /// Feeds one inbound message. Returns true when it resolved a call.
    pub fn handle_message(&self, origin: &str, data: &str) -> bool {
        if origin != self.origin {
            return false;
        }

        let response: RpcResponse = match serde_json::from_str(data) {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "failed to parse admin frame message");
                return false;
            }
        };

        let sender = self.pending.lock().remove(&response.uid);
        let Some(sender) = sender else {
            debug!(uid = response.uid, "no pending admin call for response");
            return false;
        };

        let reply = match response.error {
            Some(error) if is_truthy(&error) => Err(RpcError::Remote(error)),
            _ => Ok(response.result.unwrap_or(Value::Null)),
        };
        if sender.send(reply).is_err() {
            debug!(uid = response.uid, "admin call abandoned before response");
        }
        true
    }

    /// Rejects every outstanding call and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            warn!(dropped, "closed admin channel with calls in flight");
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub struct PendingCall {
    uid: u64,
    rx: Receiver<Reply>,
    pending: PendingTable,
}

impl PendingCall {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Blocks until the admin frame answers. With a timeout the slot is
    /// evicted on expiry, so a late response is ignored.
    pub fn wait(self, timeout: Option<Duration>) -> Reply {
        let Some(timeout) = timeout else {
            return self.rx.recv().unwrap_or(Err(RpcError::Closed));
        };
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Closed),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&self.uid);
                if let Ok(reply) = self.rx.try_recv() {
                    return reply;
                }
                Err(RpcError::Timeout {
                    uid: self.uid,
                    timeout,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target_origin: String,
    pub data: String,
}

/// Hands outgoing messages to whoever embeds the admin frame.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: Sender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<OutboundMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl FrameTransport for ChannelTransport {
    fn post_message(&self, message: &str, target_origin: &str) -> Result<()> {
        let outbound = OutboundMessage {
            target_origin: target_origin.to_string(),
            data: message.to_string(),
        };
        if self.tx.send(outbound).is_err() {
            bail!("admin frame detached");
        }
        Ok(())
    }
}
