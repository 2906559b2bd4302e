//! The transport-neutral request handed to every service handler.
//!
//! A [`ClientRequest`] looks the same to a handler whether the call arrived
//! over plain HTTP, a client WebSocket, or was forwarded from another node.
//! Side effects (cookies, redirects, progress, emits) are routed by origin:
//! buffered into the HTTP reply, pushed down the client socket, or captured
//! for replay on the node that actually faces the end client.

use crate::node::NodeCtx;
use crate::session::Session;
use lattice_core::envelope::{CookieInstruction, RedirectInstruction, RemoteOutcome, WireRequest};
use lattice_core::{ClientEvent, ErrorPayload, PeerEvent, RequestOrigin, ServiceType};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type HandlerResult = Result<Value, ErrorPayload>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered service implementation.
pub type ServiceHandler = Arc<dyn Fn(ClientRequest) -> BoxFuture<HandlerResult> + Send + Sync>;

/// A policy: `Err` short-circuits the pipeline with the thrown value merged
/// over a 401 shape.
pub type PolicyFn = Arc<dyn Fn(ClientRequest) -> BoxFuture<Result<(), Value>> + Send + Sync>;

/// A transform applied to a successful payload before rendering.
pub type TransformFn = Arc<dyn Fn(&ClientRequest, Value) -> Value + Send + Sync>;

/// Render a payload into a response body for `render`-type services.
pub type RendererFn = Arc<dyn Fn(&ClientRequest, &Value) -> String + Send + Sync>;

/// Side effects buffered while an HTTP-origin handler runs, drained when the
/// response is built.
#[derive(Debug, Default)]
pub struct HttpReply {
    pub cookies: Vec<CookieInstruction>,
    pub redirect: Option<RedirectInstruction>,
}

/// Where replies and side effects for this request go.
#[derive(Clone)]
pub enum ReplyChannel {
    Http(Arc<Mutex<HttpReply>>),
    Ws(mpsc::UnboundedSender<ClientEvent>),
    Remote {
        outcome: Arc<Mutex<RemoteOutcome>>,
        /// Live link back to the forwarding node, when one exists. HTTP
        /// fallback forwards have none; progress and emits are dropped.
        peer: Option<mpsc::UnboundedSender<PeerEvent>>,
    },
}

#[derive(Clone)]
pub struct ClientRequest {
    pub ctx: Arc<NodeCtx>,
    pub session: Session,
    pub origin: RequestOrigin,
    pub service_type: ServiceType,
    pub service_name: String,
    pub lang: Vec<String>,
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub original_url: Option<String>,
    pub base_url: Option<String>,
    pub params: Value,
    pub certificate: Option<Value>,
    pub remote_address: Option<String>,
    pub socket_id: Option<String>,
    pub tid: Option<String>,
    pub reply: ReplyChannel,
}

impl ClientRequest {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Set a cookie on the end client, wherever it is.
    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>, max_age: Option<u64>) {
        let instruction = CookieInstruction {
            name: name.into(),
            value: value.into(),
            max_age,
        };
        match &self.reply {
            ReplyChannel::Http(reply) => {
                reply.lock().expect("reply lock").cookies.push(instruction);
            }
            ReplyChannel::Ws(socket) => {
                let _ = socket.send(ClientEvent::Cookie {
                    name: instruction.name,
                    value: instruction.value,
                    max_age: instruction.max_age,
                });
            }
            ReplyChannel::Remote { outcome, .. } => {
                outcome
                    .lock()
                    .expect("outcome lock")
                    .remote_set_cookie
                    .push(instruction);
            }
        }
    }

    /// Redirect the end client. Defaults to 302 when no status is given.
    pub fn redirect(&self, url: impl Into<String>, status: Option<u16>) {
        let instruction = RedirectInstruction {
            url: url.into(),
            status,
        };
        match &self.reply {
            ReplyChannel::Http(reply) => {
                reply.lock().expect("reply lock").redirect = Some(instruction);
            }
            ReplyChannel::Ws(socket) => {
                let _ = socket.send(ClientEvent::Redirect {
                    tid: self.tid.clone().unwrap_or_default(),
                    url: instruction.url,
                    status: instruction.status.unwrap_or(302),
                });
            }
            ReplyChannel::Remote { outcome, .. } => {
                outcome.lock().expect("outcome lock").remote_redirect = Some(instruction);
            }
        }
    }

    /// Notify the caller of progress without resolving the call.
    /// No-op for plain HTTP callers.
    pub fn will_resolve(&self, body: Value) {
        match &self.reply {
            ReplyChannel::Http(_) => {}
            ReplyChannel::Ws(socket) => {
                if let Some(tid) = &self.tid {
                    let _ = socket.send(ClientEvent::Will {
                        tid: tid.clone(),
                        body,
                    });
                }
            }
            ReplyChannel::Remote { peer, .. } => {
                let Some(peer) = peer else { return };
                if let Some(tid) = &self.tid {
                    let _ = peer.send(PeerEvent::Will {
                        tid: tid.clone(),
                        body,
                    });
                } else if let Some(socket_id) = &self.socket_id {
                    let _ = peer.send(PeerEvent::ClientWill {
                        socket_id: socket_id.clone(),
                        tid: String::new(),
                        body,
                    });
                }
            }
        }
    }

    /// Push a named event to the end client's socket. Only meaningful for
    /// socket-born requests (directly or forwarded).
    pub fn emit(&self, name: impl Into<String>, args: Vec<Value>) {
        let name = name.into();
        match &self.reply {
            ReplyChannel::Http(_) => {}
            ReplyChannel::Ws(socket) => {
                let _ = socket.send(ClientEvent::Emit { name, args });
            }
            ReplyChannel::Remote { peer, .. } => {
                if let (Some(peer), Some(socket_id)) = (peer, &self.socket_id) {
                    let _ = peer.send(PeerEvent::ClientMsg {
                        socket_id: socket_id.clone(),
                        name,
                        args,
                    });
                }
            }
        }
    }

    /// Call another service through the full dispatch machinery, local or
    /// remote, reusing this request's session and side-effect channel.
    pub fn invoke_service(&self, name: &str, params: Value) -> BoxFuture<HandlerResult> {
        let mut forked = self.clone();
        forked.params = params;
        let name = name.to_string();
        Box::pin(async move { crate::dispatch::invoke_service(&name, forked).await })
    }

    /// Serialize for forwarding to the owning node. Sparse: only set fields
    /// travel.
    pub fn to_wire(&self) -> WireRequest {
        WireRequest {
            session: self.session.snapshot(),
            origin: self.origin,
            service_type: self.service_type,
            lang: self.lang.clone(),
            cookies: self.cookies.clone(),
            headers: self.headers.clone(),
            original_url: self.original_url.clone(),
            base_url: self.base_url.clone(),
            params: self.params.clone(),
            certificate: self.certificate.clone(),
            remote_address: self.remote_address.clone(),
            socket_id: self.socket_id.clone(),
            tid: self.tid.clone(),
        }
    }
}
