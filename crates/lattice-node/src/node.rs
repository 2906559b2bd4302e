//! Node wiring: shared context, observers, the client socket registry,
//! built-in protocol services, and the bootstrap sequence.

use crate::cert::{AttachedCertificate, CertificateProvider};
use crate::config::NodeConfig;
use crate::peers::PeerManager;
use crate::registry::{ServiceDefinition, ServiceRegistry};
use crate::request::{PolicyFn, RendererFn};
use crate::schema::{AcceptAllValidator, SchemaValidator};
use crate::session::{MemoryStore, NullStore, SessionManager, SessionStore};
use lattice_core::protocol::{RemoteServerBody, ServiceQueryBody};
use lattice_core::{
    ClientEvent, ErrorPayload, LatticeError, LatticeResult, ServiceState, SERVER_REQUEST_HEADER,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type ObserverFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Named lifecycle events an embedding application can watch.
#[derive(Default)]
pub struct Observers {
    subscribers: RwLock<Vec<(String, ObserverFn)>>,
}

impl Observers {
    /// Subscribe to one event name, or `*` for everything.
    pub fn subscribe(&self, event: &str, observer: ObserverFn) {
        self.subscribers
            .write()
            .expect("observers lock")
            .push((event.to_string(), observer));
    }

    pub fn notify(&self, event: &str, payload: &Value) {
        let subscribers = self.subscribers.read().expect("observers lock");
        for (name, observer) in subscribers.iter() {
            if name == event || name == "*" {
                observer(event, payload);
            }
        }
    }
}

/// Live end-client sockets by id, for pushing events from anywhere on the
/// mesh back to the socket that started a call.
#[derive(Default)]
pub struct ClientSockets {
    sockets: RwLock<HashMap<String, mpsc::UnboundedSender<ClientEvent>>>,
}

impl ClientSockets {
    pub fn register(&self, id: &str, sender: mpsc::UnboundedSender<ClientEvent>) {
        self.sockets
            .write()
            .expect("sockets lock")
            .insert(id.to_string(), sender);
    }

    pub fn remove(&self, id: &str) {
        self.sockets.write().expect("sockets lock").remove(id);
    }

    pub fn send(&self, id: &str, event: ClientEvent) {
        let sockets = self.sockets.read().expect("sockets lock");
        if let Some(sender) = sockets.get(id) {
            let _ = sender.send(event);
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.read().expect("sockets lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a request or a background task needs from the node.
pub struct NodeCtx {
    pub config: NodeConfig,
    pub registry: ServiceRegistry,
    pub sessions: SessionManager,
    pub peers: Arc<PeerManager>,
    pub sockets: ClientSockets,
    pub observers: Observers,
    pub validator: Arc<dyn SchemaValidator>,
    pub certificates: RwLock<Arc<dyn CertificateProvider>>,
    pub renderer: RwLock<Option<RendererFn>>,
}

impl NodeCtx {
    fn build(config: NodeConfig) -> LatticeResult<Arc<Self>> {
        let store: Arc<dyn SessionStore> = match config.session_store.as_str() {
            "memory" => Arc::new(MemoryStore::default()),
            "none" => Arc::new(NullStore),
            other => {
                return Err(LatticeError::Config(format!(
                    "unknown session store: {other}"
                )))
            }
        };
        Ok(Arc::new(NodeCtx {
            registry: ServiceRegistry::new(config.host_name.clone()),
            sessions: SessionManager::new(store),
            peers: Arc::new(PeerManager::default()),
            sockets: ClientSockets::default(),
            observers: Observers::default(),
            validator: Arc::new(AcceptAllValidator),
            certificates: RwLock::new(Arc::new(AttachedCertificate) as Arc<dyn CertificateProvider>),
            renderer: RwLock::new(None),
            config,
        }))
    }

    #[cfg(test)]
    pub fn for_tests() -> Arc<Self> {
        Self::build(NodeConfig::default()).expect("test context")
    }
}

/// A running (or about to run) node.
pub struct Node {
    ctx: Arc<NodeCtx>,
}

impl Node {
    pub fn new(config: NodeConfig) -> LatticeResult<Self> {
        let ctx = NodeCtx::build(config)?;
        register_builtin_services(&ctx)?;
        Ok(Node { ctx })
    }

    pub fn ctx(&self) -> Arc<NodeCtx> {
        self.ctx.clone()
    }

    /// Register an application service and push the change to replicas.
    pub fn register_service(
        &self,
        module: &str,
        definition: ServiceDefinition,
    ) -> LatticeResult<String> {
        let name = self.ctx.registry.register(module, definition)?;
        self.ctx
            .observers
            .notify("manage_service", &json!({ "service": name }));
        self.ctx
            .peers
            .broadcast_dict_change(&self.ctx, std::slice::from_ref(&name));
        Ok(name)
    }

    pub fn add_global_policy(&self, policy: PolicyFn) {
        self.ctx.registry.add_global_policy(policy);
    }

    pub fn add_module_policy(&self, module: &str, policy: PolicyFn) {
        self.ctx.registry.add_module_policy(module, policy);
    }

    pub fn subscribe(&self, event: &str, observer: ObserverFn) {
        self.ctx.observers.subscribe(event, observer);
    }

    /// Node-wide fallback renderer for `render`-type services.
    pub fn set_renderer(&self, renderer: RendererFn) {
        *self.ctx.renderer.write().expect("renderer lock") = Some(renderer);
    }

    /// Renderer for one module; overrides the node-wide one, and is itself
    /// overridden by a renderer on the service definition.
    pub fn set_module_renderer(&self, module: &str, renderer: RendererFn) {
        self.ctx.registry.add_module_renderer(module, renderer);
    }

    /// Replace how certificate-requiring services obtain the client
    /// certificate. The default accepts only pre-attached certificates.
    pub fn set_certificate_provider(&self, provider: Arc<dyn CertificateProvider>) {
        *self.ctx.certificates.write().expect("certificates lock") = provider;
    }

    /// Attach configured peers, then serve until the listener dies.
    pub async fn run(self) -> LatticeResult<()> {
        let ctx = self.ctx;
        for server in ctx.config.servers.clone() {
            let attached = ctx
                .peers
                .attach(
                    &ctx,
                    &server.host,
                    &server.passkey,
                    server.live,
                    server.replica,
                    server.config_name.clone(),
                )
                .await;
            if let Err(e) = attached {
                // A config-level error (missing passkey) is fatal; transient
                // reachability is the keep-alive loop's problem.
                match e {
                    LatticeError::Config(_) => return Err(e),
                    other => warn!(host = %server.host, error = %other, "initial attach incomplete"),
                }
            }
        }
        info!(
            host = %ctx.config.host_name,
            port = ctx.config.port,
            "node ready"
        );
        crate::transport::http::serve(ctx).await
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The fixed protocol surface, expressed as ordinary private services so
/// the dictionary always reflects exactly what this node serves.
fn register_builtin_services(ctx: &Arc<NodeCtx>) -> LatticeResult<()> {
    // GET /api — the dictionary, filtered by caller kind.
    ctx.registry.register(
        "",
        ServiceDefinition {
            name: Some("api".into()),
            get: Some("/api".into()),
            service_state: Some(ServiceState::Stateless),
            exclude_from_replicas: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    let for_server = req.headers.contains_key(SERVER_REQUEST_HEADER);
                    let snapshot = req.ctx.registry.snapshot(for_server);
                    serde_json::to_value(snapshot)
                        .map_err(|e| ErrorPayload::status(500).with_message(e.to_string()))
                })
            })),
            ..Default::default()
        },
    )?;

    // GET /api/server/ping — liveness plus clock for lag measurement.
    ctx.registry.register(
        "server",
        ServiceDefinition {
            name: Some("ping".into()),
            get: Some("/api/server/ping".into()),
            service_state: Some(ServiceState::Stateless),
            exclude_from_replicas: true,
            handler: Some(Arc::new(|_req| {
                Box::pin(async move { Ok(json!({ "pong": now_millis() })) })
            })),
            ..Default::default()
        },
    )?;

    // POST /api/server/remoteRequest — HTTP fallback for forwarded calls.
    ctx.registry.register(
        "server",
        ServiceDefinition {
            name: Some("remoteRequest".into()),
            post: Some("/api/server/remoteRequest".into()),
            service_state: Some(ServiceState::Stateless),
            exclude_from_replicas: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    let body: lattice_core::protocol::RemoteRequestBody =
                        serde_json::from_value(req.params.clone()).map_err(|e| {
                            ErrorPayload::status(400).with_message(format!("bad remote request: {e}"))
                        })?;
                    let tid = body
                        .client_request
                        .tid
                        .clone()
                        .unwrap_or_else(|| lattice_core::make_id(lattice_core::TID_LEN));
                    let outcome = crate::dispatch::dispatch_remote(
                        &req.ctx,
                        &body.method_name,
                        body.client_request,
                        None,
                        &tid,
                    )
                    .await?;
                    serde_json::to_value(outcome)
                        .map_err(|e| ErrorPayload::status(500).with_message(e.to_string()))
                })
            })),
            ..Default::default()
        },
    )?;

    // POST /api/server/remoteServer — a peer announcing itself.
    ctx.registry.register(
        "server",
        ServiceDefinition {
            name: Some("remoteServer".into()),
            post: Some("/api/server/remoteServer".into()),
            service_state: Some(ServiceState::Stateless),
            exclude_from_replicas: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    let body: RemoteServerBody = serde_json::from_value(req.params.clone())
                        .map_err(|e| {
                            ErrorPayload::status(400)
                                .with_message(format!("bad registration: {e}"))
                        })?;
                    handle_remote_server(&req.ctx, body).await
                })
            })),
            ..Default::default()
        },
    )?;

    // POST /api/server/service — lazy single-service discovery.
    ctx.registry.register(
        "server",
        ServiceDefinition {
            name: Some("service".into()),
            post: Some("/api/server/service".into()),
            service_state: Some(ServiceState::Stateless),
            exclude_from_replicas: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    let body: ServiceQueryBody = serde_json::from_value(req.params.clone())
                        .map_err(|e| {
                            ErrorPayload::status(400).with_message(format!("bad query: {e}"))
                        })?;
                    check_gateway_passkey(&req.ctx, &body.passkey)?;
                    let Some(service) = req.ctx.registry.lookup(&body.full_service_name) else {
                        return Err(ErrorPayload::status(404)
                            .with_message(format!("Service {} not found", body.full_service_name)));
                    };
                    let mut descriptor = service.descriptor.clone();
                    if descriptor.server.as_deref() == Some("") {
                        descriptor.server = None;
                    }
                    let descriptor = serde_json::to_value(descriptor)
                        .map_err(|e| ErrorPayload::status(500).with_message(e.to_string()))?;
                    let mut dict = serde_json::Map::new();
                    dict.insert(body.full_service_name, descriptor);
                    Ok(Value::Object(dict))
                })
            })),
            ..Default::default()
        },
    )?;

    Ok(())
}

fn check_gateway_passkey(ctx: &Arc<NodeCtx>, presented: &str) -> Result<(), ErrorPayload> {
    match &ctx.config.gateway_passkey {
        Some(expected) if expected == presented => Ok(()),
        Some(_) => Err(ErrorPayload::status(401).with_message("Invalid passkey")),
        None => Err(ErrorPayload::status(403).with_message("Peer attachment is disabled")),
    }
}

/// Accept (or refuse) a peer registration, and attach back when auto-attach
/// is configured.
async fn handle_remote_server(
    ctx: &Arc<NodeCtx>,
    body: RemoteServerBody,
) -> Result<Value, ErrorPayload> {
    let presented = body
        .passkey
        .as_deref()
        .or(body.handshake.as_ref().map(|h| h.passkey.as_str()))
        .unwrap_or("");
    check_gateway_passkey(ctx, presented)?;

    let caller_host = body
        .local_host
        .clone()
        .or(body.handshake.as_ref().map(|h| h.host_name.clone()));
    if let (Some(host), Some(auto_passkey)) = (caller_host, ctx.config.auto_attach_passkey.clone())
    {
        if host != ctx.config.host_name && ctx.peers.remote(&host).is_none() {
            info!(host = %host, "auto-attaching announcing peer");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let peers = ctx.peers.clone();
                if let Err(e) = peers.attach(&ctx, &host, &auto_passkey, false, false, None).await {
                    warn!(host = %host, error = %e, "auto-attach failed");
                }
            });
        }
    }
    Ok(json!({ "result": "ok" }))
}
