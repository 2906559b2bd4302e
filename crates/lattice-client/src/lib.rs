//! lattice-client: native WebSocket client for a lattice node.
//!
//! `LatticeClient` manages the connection lifecycle: dialing the client
//! namespace, correlating requests with their terminal events, surfacing
//! progress, and keepalive.

use futures_util::{SinkExt, StreamExt};
use lattice_core::protocol::{decode_event, encode_event, CLIENT_WS_PATH};
use lattice_core::{make_id, ClientEvent, ErrorPayload, LatticeError, LatticeResult, TID_LEN};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Configuration for connecting to a node.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Ping interval in seconds (0 = disabled).
    pub ping_interval_secs: u64,
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Per-request timeout in seconds (0 = wait forever).
    pub request_timeout_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// How one call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Resolved(Value),
    Rejected(ErrorPayload),
    Redirected { url: String, status: u16 },
}

/// Unsolicited events the node pushes outside any call.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Cookie {
        name: String,
        value: String,
        max_age: Option<u64>,
    },
    Emit {
        name: String,
        args: Vec<Value>,
    },
}

pub type ProgressFn = Arc<dyn Fn(Value) + Send + Sync>;

struct PendingRequest {
    resolver: oneshot::Sender<CallReply>,
    progress: Option<ProgressFn>,
}

type Pending = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// The main lattice client.
pub struct LatticeClient {
    outgoing_tx: mpsc::Sender<Message>,
    pending: Pending,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    connected: Arc<AtomicBool>,
    request_timeout: Option<Duration>,
    keepalive_handle: Option<tokio::task::JoinHandle<()>>,
    dispatch_handle: Option<tokio::task::JoinHandle<()>>,
}

fn ws_url(url: &str) -> String {
    let base = url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    if base.ends_with(CLIENT_WS_PATH) {
        base
    } else {
        format!("{base}{CLIENT_WS_PATH}")
    }
}

impl LatticeClient {
    /// Connect to a node's client namespace.
    pub async fn connect(url: &str, config: ConnectConfig) -> LatticeResult<Self> {
        let url = ws_url(url);
        let timeout = Duration::from_secs(config.timeout_secs);
        let stream = match time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(LatticeError::Transport(e.to_string())),
            Err(_) => return Err(LatticeError::Timeout),
        };

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Message>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let dispatch_handle = tokio::spawn(dispatch_loop(
            stream,
            outgoing_rx,
            pending.clone(),
            events_tx,
            connected.clone(),
        ));

        let keepalive_handle = if config.ping_interval_secs > 0 {
            let interval = Duration::from_secs(config.ping_interval_secs);
            let outgoing = outgoing_tx.clone();
            let connected = connected.clone();
            Some(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.tick().await; // skip first immediate tick
                while connected.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    if outgoing.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            outgoing_tx,
            pending,
            events_rx: Mutex::new(Some(events_rx)),
            connected,
            request_timeout: match config.request_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            keepalive_handle,
            dispatch_handle: Some(dispatch_handle),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Take the stream of unsolicited server events. Callable once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.lock().expect("events lock").take()
    }

    /// Invoke a service and wait for its terminal event.
    pub async fn request(&self, service: &str, params: Value) -> LatticeResult<CallReply> {
        self.request_with_progress(service, params, None).await
    }

    /// Invoke a service, receiving progress notifications along the way.
    pub async fn request_with_progress(
        &self,
        service: &str,
        params: Value,
        progress: Option<ProgressFn>,
    ) -> LatticeResult<CallReply> {
        if !self.is_connected() {
            return Err(LatticeError::Transport("not connected".to_string()));
        }
        let tid = make_id(TID_LEN);
        let (resolver, receiver) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(tid.clone(), PendingRequest { resolver, progress });

        let frame = encode_event(&ClientEvent::Request {
            service: service.to_string(),
            params,
            tid: tid.clone(),
        })?;
        if self.outgoing_tx.send(Message::Text(frame)).await.is_err() {
            self.pending.lock().expect("pending lock").remove(&tid);
            return Err(LatticeError::Transport("connection closed".to_string()));
        }

        match self.request_timeout {
            Some(deadline) => match time::timeout(deadline, receiver).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(LatticeError::Transport("connection closed".to_string())),
                Err(_) => {
                    self.pending.lock().expect("pending lock").remove(&tid);
                    Err(LatticeError::Timeout)
                }
            },
            None => receiver
                .await
                .map_err(|_| LatticeError::Transport("connection closed".to_string())),
        }
    }

    /// Close the connection and stop background tasks.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        if let Some(handle) = self.keepalive_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.dispatch_handle.take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    mut outgoing_rx: mpsc::Receiver<Message>,
    pending: Pending,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(message) = outgoing else { break };
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match decode_event::<ClientEvent>(&text) {
                        Ok(event) => handle_event(event, &pending, &events_tx),
                        Err(e) => warn!(error = %e, "bad server frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "read error");
                        break;
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // In-flight calls will never get a reply now.
    let stranded: Vec<_> = pending
        .lock()
        .expect("pending lock")
        .drain()
        .collect();
    for (_tid, request) in stranded {
        let _ = request
            .resolver
            .send(CallReply::Rejected(ErrorPayload::gateway_timeout(
                "connection closed",
            )));
    }
}

fn handle_event(event: ClientEvent, pending: &Pending, events_tx: &mpsc::UnboundedSender<ServerEvent>) {
    match event {
        ClientEvent::Response { tid, body } => settle(pending, &tid, CallReply::Resolved(body)),
        ClientEvent::Error { tid, body } => settle(pending, &tid, CallReply::Rejected(body)),
        ClientEvent::Redirect { tid, url, status } => {
            settle(pending, &tid, CallReply::Redirected { url, status })
        }
        ClientEvent::Will { tid, body } => {
            let pending = pending.lock().expect("pending lock");
            if let Some(request) = pending.get(&tid) {
                if let Some(progress) = &request.progress {
                    progress(body);
                }
            }
        }
        ClientEvent::Cookie { name, value, max_age } => {
            let _ = events_tx.send(ServerEvent::Cookie { name, value, max_age });
        }
        ClientEvent::Emit { name, args } => {
            let _ = events_tx.send(ServerEvent::Emit { name, args });
        }
        ClientEvent::Request { tid, .. } => {
            debug!(tid = %tid, "request event from server ignored");
        }
    }
}

/// First terminal event per tid wins; anything later is dropped.
fn settle(pending: &Pending, tid: &str, reply: CallReply) {
    let request = pending.lock().expect("pending lock").remove(tid);
    match request {
        Some(request) => {
            let _ = request.resolver.send(reply);
        }
        None => debug!(tid = %tid, "terminal event for settled call dropped"),
    }
}
