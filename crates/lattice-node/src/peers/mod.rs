//! Peer connection management: attached remotes, live links, call
//! forwarding, keep-alive probing, and dictionary exchange.

mod link;
mod pending;

pub use link::run_outbound_link;
pub use pending::{CallOutcome, PendingCalls, ProgressFn};

use crate::node::NodeCtx;
use lattice_core::dictionary::DictionarySnapshot;
use lattice_core::envelope::{RemoteOutcome, WireRequest};
use lattice_core::protocol::{
    PeerEvent, PingResponse, RemoteRequestBody, API_PATH, PING_PATH, REMOTE_REQUEST_PATH,
    SERVER_REQUEST_HEADER,
};
use lattice_core::{make_id, ClientEvent, ErrorPayload, LatticeError, LatticeResult, TID_LEN};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One attached peer and the state of our side of the relationship.
pub struct PeerRemote {
    pub host: String,
    pub passkey: String,
    pub live: bool,
    pub replica: bool,
    pub config_name: Option<String>,
    link: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    reachable: AtomicBool,
    /// Peer clock minus our send time, from the last ping. Clock-dependent.
    lag1: AtomicI64,
    /// Last ping round trip, milliseconds.
    lag2: AtomicU64,
}

impl PeerRemote {
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// (one-way estimate, round trip) from the last successful ping.
    pub fn lag(&self) -> (i64, u64) {
        (self.lag1.load(Ordering::SeqCst), self.lag2.load(Ordering::SeqCst))
    }

    pub fn set_link(&self, sender: mpsc::UnboundedSender<PeerEvent>) {
        *self.link.lock().expect("link lock") = Some(sender);
    }

    pub fn clear_link(&self) {
        *self.link.lock().expect("link lock") = None;
    }

    fn link_sender(&self) -> Option<mpsc::UnboundedSender<PeerEvent>> {
        self.link.lock().expect("link lock").clone()
    }
}

/// A live socket some peer dialed into us.
struct InboundLink {
    sender: mpsc::UnboundedSender<PeerEvent>,
    /// The dialer asked to mirror our dictionary.
    replica: bool,
}

pub struct PeerManager {
    http: reqwest::Client,
    remotes: RwLock<HashMap<String, Arc<PeerRemote>>>,
    inbound: RwLock<HashMap<String, InboundLink>>,
    pub pending: PendingCalls,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            remotes: RwLock::new(HashMap::new()),
            inbound: RwLock::new(HashMap::new()),
            pending: PendingCalls::default(),
        }
    }
}

impl PeerManager {
    /// Shared HTTP client, also used by the reverse proxy.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Register a remote. First writer wins per host; a registration with an
    /// empty passkey is a configuration error, never a silent downgrade.
    pub fn add_remote(
        &self,
        host: &str,
        passkey: &str,
        live: bool,
        replica: bool,
        config_name: Option<String>,
    ) -> LatticeResult<Arc<PeerRemote>> {
        if passkey.is_empty() {
            return Err(LatticeError::Config(format!(
                "remote server {host} registered without a passkey"
            )));
        }
        let mut remotes = self.remotes.write().expect("remotes lock");
        if let Some(existing) = remotes.get(host) {
            return Ok(existing.clone());
        }
        let remote = Arc::new(PeerRemote {
            host: host.to_string(),
            passkey: passkey.to_string(),
            live,
            replica,
            config_name,
            link: Mutex::new(None),
            // Starts unreachable so the first successful probe re-fetches
            // the dictionary even when the initial attach raced the peer's
            // startup.
            reachable: AtomicBool::new(false),
            lag1: AtomicI64::new(0),
            lag2: AtomicU64::new(0),
        });
        remotes.insert(host.to_string(), remote.clone());
        info!(host = %host, live, replica, "remote server registered");
        Ok(remote)
    }

    pub fn remote(&self, host: &str) -> Option<Arc<PeerRemote>> {
        self.remotes.read().expect("remotes lock").get(host).cloned()
    }

    pub fn remote_hosts(&self) -> Vec<String> {
        self.remotes.read().expect("remotes lock").keys().cloned().collect()
    }

    pub fn register_inbound(&self, host: &str, sender: mpsc::UnboundedSender<PeerEvent>, replica: bool) {
        self.inbound
            .write()
            .expect("inbound lock")
            .insert(host.to_string(), InboundLink { sender, replica });
        info!(host = %host, replica, "peer link attached");
    }

    pub fn remove_inbound(&self, host: &str) {
        self.inbound.write().expect("inbound lock").remove(host);
        info!(host = %host, "peer link detached");
    }

    fn inbound_sender(&self, host: &str) -> Option<mpsc::UnboundedSender<PeerEvent>> {
        self.inbound
            .read()
            .expect("inbound lock")
            .get(host)
            .map(|l| l.sender.clone())
    }

    /// Attach to a peer: register it, announce ourselves over HTTP, mirror
    /// its dictionary when asked to, and start keep-alive (plus the live
    /// link when requested).
    pub async fn attach(
        self: &Arc<Self>,
        ctx: &Arc<NodeCtx>,
        host: &str,
        passkey: &str,
        live: bool,
        replica: bool,
        config_name: Option<String>,
    ) -> LatticeResult<()> {
        let remote = self.add_remote(host, passkey, live, replica, config_name)?;
        ctx.registry.record_remote_server(lattice_core::dictionary::RemoteServerEntry {
            host_name: host.to_string(),
            passkey: passkey.to_string(),
            live,
            replica,
        });

        let body = json!({
            "local_host": ctx.config.host_name,
            "passkey": passkey,
            "live": live,
            "replica": replica,
        });
        let announce = self
            .http
            .post(format!("{host}{}", lattice_core::protocol::REMOTE_SERVER_PATH))
            .header(SERVER_REQUEST_HEADER, "true")
            .json(&body)
            .send()
            .await;
        if let Err(e) = announce {
            warn!(host = %host, error = %e, "could not announce to remote, keep-alive will retry");
        }

        if replica {
            match self.fetch_dictionary(host).await {
                Ok(snapshot) => {
                    self.apply_replica(ctx, host, snapshot);
                }
                Err(e) => warn!(host = %host, error = %e, "replica fetch failed"),
            }
        }

        if live {
            tokio::spawn(run_outbound_link(ctx.clone(), remote.clone()));
        }
        tokio::spawn(keep_alive_loop(ctx.clone(), self.clone(), remote));
        ctx.observers
            .notify("server_connection", &json!({ "host": host }));
        Ok(())
    }

    /// Fetch a peer's server-facing dictionary snapshot.
    pub async fn fetch_dictionary(&self, host: &str) -> LatticeResult<DictionarySnapshot> {
        let response = self
            .http
            .get(format!("{host}{API_PATH}"))
            .header(SERVER_REQUEST_HEADER, "true")
            .send()
            .await
            .map_err(|e| LatticeError::Transport(e.to_string()))?;
        response
            .json::<DictionarySnapshot>()
            .await
            .map_err(|e| LatticeError::Codec(e.to_string()))
    }

    /// Merge a fetched snapshot: services, static paths, and the peer's own
    /// peers (first writer wins, no live link to peers-of-peers).
    pub fn apply_replica(
        &self,
        ctx: &Arc<NodeCtx>,
        host: &str,
        snapshot: DictionarySnapshot,
    ) -> Vec<String> {
        let merged = ctx.registry.merge_remote_dictionary(
            host,
            snapshot.dict,
            snapshot.static_paths.unwrap_or_default(),
        );
        for entry in snapshot.remote_servers.unwrap_or_default() {
            if entry.host_name == ctx.config.host_name {
                continue;
            }
            ctx.registry.record_remote_server(entry.clone());
            if let Err(e) =
                self.add_remote(&entry.host_name, &entry.passkey, false, false, None)
            {
                warn!(host = %entry.host_name, error = %e, "peer-of-peer registration skipped");
            }
        }
        if !merged.is_empty() {
            self.broadcast_dict_change(ctx, &merged);
        }
        merged
    }

    /// Push a dictionary delta to every dialer that mirrors us.
    pub fn broadcast_dict_change(&self, ctx: &Arc<NodeCtx>, names: &[String]) {
        let snapshot = ctx.registry.snapshot(true);
        let delta: std::collections::BTreeMap<_, _> = snapshot
            .dict
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .collect();
        if delta.is_empty() {
            return;
        }
        let inbound = self.inbound.read().expect("inbound lock");
        for (host, link) in inbound.iter() {
            if !link.replica {
                continue;
            }
            debug!(host = %host, services = delta.len(), "pushing dictionary delta");
            let _ = link.sender.send(PeerEvent::DictChanged {
                channel: String::new(),
                dict: delta.clone(),
                static_paths: Vec::new(),
            });
        }
    }

    /// Forward a call to its owning host: live link first (either
    /// direction), HTTP fallback otherwise.
    pub async fn forward_call(
        &self,
        ctx: &Arc<NodeCtx>,
        service: &str,
        host: &str,
        wire: WireRequest,
        progress: Option<ProgressFn>,
    ) -> CallOutcome {
        if let Some(remote) = self.remote(host) {
            if let Some(sender) = remote.link_sender() {
                let tid = make_id(TID_LEN);
                let event = PeerEvent::ServerRequest {
                    service: service.to_string(),
                    request: wire,
                    tid: tid.clone(),
                };
                return self.call_over_link(ctx, sender, event, &tid, progress).await;
            }
        }
        if let Some(sender) = self.inbound_sender(host) {
            let tid = make_id(TID_LEN);
            let event = PeerEvent::Request {
                service: service.to_string(),
                request: wire,
                tid: tid.clone(),
            };
            return self.call_over_link(ctx, sender, event, &tid, progress).await;
        }
        self.forward_over_http(service, host, wire).await
    }

    async fn call_over_link(
        &self,
        ctx: &Arc<NodeCtx>,
        sender: mpsc::UnboundedSender<PeerEvent>,
        event: PeerEvent,
        tid: &str,
        progress: Option<ProgressFn>,
    ) -> CallOutcome {
        let receiver = self.pending.register(tid, progress);
        if sender.send(event).is_err() {
            self.pending.abandon(tid);
            return Err(ErrorPayload::gateway_timeout("peer link closed"));
        }
        match ctx.config.call_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(ErrorPayload::gateway_timeout("peer link dropped")),
                Err(_) => {
                    self.pending.abandon(tid);
                    Err(ErrorPayload::gateway_timeout("call deadline exceeded"))
                }
            },
            None => match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ErrorPayload::gateway_timeout("peer link dropped")),
            },
        }
    }

    async fn forward_over_http(&self, service: &str, host: &str, wire: WireRequest) -> CallOutcome {
        let body = RemoteRequestBody {
            method_name: service.to_string(),
            client_request: wire,
        };
        let response = self
            .http
            .post(format!("{host}{REMOTE_REQUEST_PATH}"))
            .header(SERVER_REQUEST_HEADER, "true")
            .json(&body)
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(host = %host, error = %e, "remote request transport failure");
                return Err(ErrorPayload::gateway_timeout(e.to_string()));
            }
        };
        let status = response.status().as_u16();
        if response.status().is_success() {
            response
                .json::<RemoteOutcome>()
                .await
                .map_err(|e| ErrorPayload::status(500).with_message(e.to_string()))
        } else {
            let payload = response
                .json::<ErrorPayload>()
                .await
                .unwrap_or_else(|_| ErrorPayload::status(status));
            Err(payload)
        }
    }

    /// Ask attached peers whether any of them serves `name`; the first hit
    /// is merged into the local registry. Lets a node route to services it
    /// never saw a full replica of.
    pub async fn discover_service(&self, ctx: &Arc<NodeCtx>, name: &str) -> bool {
        for host in self.remote_hosts() {
            let Some(remote) = self.remote(&host) else { continue };
            let body = lattice_core::protocol::ServiceQueryBody {
                local_host: ctx.config.host_name.clone(),
                passkey: remote.passkey.clone(),
                full_service_name: name.to_string(),
            };
            let response = self
                .http
                .post(format!("{host}{}", lattice_core::protocol::SERVICE_QUERY_PATH))
                .header(SERVER_REQUEST_HEADER, "true")
                .json(&body)
                .send()
                .await;
            let Ok(response) = response else { continue };
            if !response.status().is_success() {
                continue;
            }
            let Ok(dict) = response
                .json::<std::collections::BTreeMap<String, lattice_core::ServiceDescriptor>>()
                .await
            else {
                continue;
            };
            let merged = ctx.registry.merge_remote_dictionary(&host, dict, Vec::new());
            if !merged.is_empty() {
                info!(service = %name, host = %host, "service discovered on peer");
                return true;
            }
        }
        false
    }

    /// One liveness probe. Updates lag measurements on success.
    async fn ping(&self, host: &str) -> LatticeResult<()> {
        let sent = now_millis();
        let response = self
            .http
            .get(format!("{host}{PING_PATH}"))
            .header(SERVER_REQUEST_HEADER, "true")
            .send()
            .await
            .map_err(|e| LatticeError::Transport(e.to_string()))?;
        let pong: PingResponse = response
            .json()
            .await
            .map_err(|e| LatticeError::Codec(e.to_string()))?;
        let received = now_millis();
        if let Some(remote) = self.remote(host) {
            remote
                .lag1
                .store(pong.pong as i64 - sent as i64, Ordering::SeqCst);
            remote.lag2.store(received - sent, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Probe a remote at the keep-alive interval. A failed probe is re-tried at
/// the shorter retry interval, up to `keep_alive_max_retries` attempts in a
/// round; when the round fails outright the host's services are
/// soft-disabled and the loop exits. Nothing probes the host again until it
/// is attached anew.
pub async fn keep_alive_loop(ctx: Arc<NodeCtx>, peers: Arc<PeerManager>, remote: Arc<PeerRemote>) {
    loop {
        tokio::time::sleep(ctx.config.keep_alive_interval).await;
        let mut alive = false;
        for attempt in 0..ctx.config.keep_alive_max_retries {
            match peers.ping(&remote.host).await {
                Ok(()) => {
                    alive = true;
                    break;
                }
                Err(e) => {
                    debug!(host = %remote.host, attempt, error = %e, "ping failed");
                    if attempt + 1 < ctx.config.keep_alive_max_retries {
                        tokio::time::sleep(ctx.config.keep_alive_retry).await;
                    }
                }
            }
        }
        if alive {
            if !remote.reachable.swap(true, Ordering::SeqCst) {
                info!(host = %remote.host, "remote online");
                if remote.replica {
                    if let Ok(snapshot) = peers.fetch_dictionary(&remote.host).await {
                        peers.apply_replica(&ctx, &remote.host, snapshot);
                    }
                }
            }
            continue;
        }
        remote.reachable.store(false, Ordering::SeqCst);
        warn!(host = %remote.host, "remote not responding, soft-disabling its services");
        ctx.registry.mark_host_unreachable(&remote.host);
        ctx.observers
            .notify("server_not_responding", &json!({ "host": remote.host }));
        return;
    }
}

/// Handle one event arriving on a live link, from either side.
///
/// `reply` funnels frames back through the link's writer task; `from_host`
/// attributes dictionary deltas and correlates inbound calls.
pub fn handle_peer_event(
    ctx: &Arc<NodeCtx>,
    from_host: &str,
    event: PeerEvent,
    reply: mpsc::UnboundedSender<PeerEvent>,
) {
    match event {
        PeerEvent::ServerRequest { service, request, tid } => {
            spawn_remote_dispatch(ctx.clone(), service, request, tid, reply, false);
        }
        PeerEvent::Request { service, request, tid } => {
            spawn_remote_dispatch(ctx.clone(), service, request, tid, reply, true);
        }
        PeerEvent::ServerResponse { tid, outcome } | PeerEvent::Response { tid, outcome } => {
            ctx.peers.pending.resolve(&tid, Ok(outcome));
        }
        PeerEvent::Error { tid, body } => {
            ctx.peers.pending.resolve(&tid, Err(body));
        }
        PeerEvent::Will { tid, body } => {
            ctx.peers.pending.progress(&tid, body);
        }
        PeerEvent::ClientMsg { socket_id, name, args } => {
            ctx.sockets.send(&socket_id, ClientEvent::Emit { name, args });
        }
        PeerEvent::ClientWill { socket_id, tid, body } => {
            ctx.sockets.send(&socket_id, ClientEvent::Will { tid, body });
        }
        PeerEvent::DictChanged { dict, static_paths, .. } => {
            let merged = ctx
                .registry
                .merge_remote_dictionary(from_host, dict, static_paths);
            if !merged.is_empty() {
                debug!(host = %from_host, services = merged.len(), "dictionary delta merged");
                ctx.peers.broadcast_dict_change(ctx, &merged);
            }
        }
        PeerEvent::Handshake { .. } => {
            // Idempotent: a repeat handshake on an established link is noise.
            debug!(host = %from_host, "repeat handshake ignored");
        }
    }
}

fn spawn_remote_dispatch(
    ctx: Arc<NodeCtx>,
    service: String,
    request: WireRequest,
    tid: String,
    reply: mpsc::UnboundedSender<PeerEvent>,
    reverse: bool,
) {
    tokio::spawn(async move {
        let outcome =
            crate::dispatch::dispatch_remote(&ctx, &service, request, Some(reply.clone()), &tid)
                .await;
        let event = match outcome {
            Ok(outcome) if reverse => PeerEvent::Response { tid, outcome },
            Ok(outcome) => PeerEvent::ServerResponse { tid, outcome },
            Err(body) => PeerEvent::Error { tid, body },
        };
        let _ = reply.send(event);
    });
}
