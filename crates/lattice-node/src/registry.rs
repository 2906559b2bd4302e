//! The service registry: every service this node can route to, local or
//! remote, plus the route table that maps HTTP method+path onto services.
//!
//! Routes are dynamic. Peers can inject services at any time through
//! dictionary merges, so matching happens against this table at request time
//! rather than in a fixed router.

use crate::request::{PolicyFn, RendererFn, ServiceHandler, TransformFn};
use lattice_core::dictionary::{
    DictionarySnapshot, ProxyOptions, RemoteServerEntry, ServiceDescriptor, ServiceState,
    ServiceType, StaticPath,
};
use lattice_core::{LatticeError, LatticeResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Everything a caller provides when registering a local service.
#[derive(Default)]
pub struct ServiceDefinition {
    /// Absent = anonymous; a name is generated and the service is forced
    /// private.
    pub name: Option<String>,
    pub service_type: Option<ServiceType>,
    pub public: bool,
    pub service_state: Option<ServiceState>,
    pub get: Option<String>,
    pub post: Option<String>,
    pub put: Option<String>,
    pub delete: Option<String>,
    pub all: Option<String>,
    pub use_path: Option<String>,
    pub parameters: Option<String>,
    pub request_cert: bool,
    pub proxy: Option<ProxyOptions>,
    pub exclude_from_replicas: bool,
    pub policies: Vec<PolicyFn>,
    /// Shapes the merged params before the handler runs.
    pub request_transform: Option<TransformFn>,
    /// Shapes the successful payload before rendering.
    pub transform: Option<TransformFn>,
    /// Renderer for this service alone; falls back to the module renderer,
    /// then the node-wide one.
    pub renderer: Option<RendererFn>,
    pub handler: Option<ServiceHandler>,
}

/// One resolved registry entry.
pub struct RegisteredService {
    pub descriptor: ServiceDescriptor,
    /// `None` for remote-owned services.
    pub handler: Option<ServiceHandler>,
    pub policies: Vec<PolicyFn>,
    pub request_transform: Option<TransformFn>,
    pub transform: Option<TransformFn>,
    pub renderer: Option<RendererFn>,
    pub module: String,
}

impl RegisteredService {
    pub fn service_type(&self) -> ServiceType {
        self.descriptor.service_type.unwrap_or(ServiceType::Json)
    }

    pub fn service_state(&self) -> ServiceState {
        self.descriptor.service_state.unwrap_or_default()
    }

    /// Owner host. `None` = local, `Some("")` = owner currently unreachable.
    pub fn owner(&self) -> Option<&str> {
        self.descriptor.server.as_deref()
    }
}

/// A path pattern split into literal and `:param` segments.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

/// One route-table row.
#[derive(Clone)]
struct Route {
    /// Lowercase method, `all` matches every method, `use` is prefix-only.
    method: String,
    pattern: Vec<Segment>,
    /// When false (declared with a `^` prefix), a proxy keeps the original
    /// URL instead of stripping the matched prefix.
    rewrite: bool,
    service: String,
}

/// A route hit: the owning service plus captured path params.
pub struct RouteMatch {
    pub service: String,
    pub params: Map<String, Value>,
    pub rewrite: bool,
    /// Segments consumed by a prefix (`use`) route; a rewriting proxy strips
    /// this many before forwarding.
    pub prefix_segments: usize,
}

struct RegistryInner {
    services: BTreeMap<String, Arc<RegisteredService>>,
    routes: Vec<Route>,
    static_paths: Vec<StaticPath>,
    global_policies: Vec<PolicyFn>,
    module_policies: HashMap<String, Vec<PolicyFn>>,
    module_renderers: HashMap<String, RendererFn>,
    remote_servers: Vec<RemoteServerEntry>,
}

pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    host_name: String,
    pid: u32,
}

impl ServiceRegistry {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                services: BTreeMap::new(),
                routes: Vec::new(),
                static_paths: Vec::new(),
                global_policies: Vec::new(),
                module_policies: HashMap::new(),
                module_renderers: HashMap::new(),
                remote_servers: Vec::new(),
            }),
            host_name: host_name.into(),
            pid: std::process::id(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Register a local service under a module namespace. Returns the full
    /// service name. Anonymous services get a generated name and are forced
    /// private.
    pub fn register(&self, module: &str, definition: ServiceDefinition) -> LatticeResult<String> {
        let (name, public) = match definition.name {
            Some(name) => (name, definition.public),
            None => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                (format!("service{millis}"), false)
            }
        };
        let full_name = if module.is_empty() {
            name.clone()
        } else {
            format!("{module}.{name}")
        };

        let service_type = definition.service_type.unwrap_or(ServiceType::Json);
        if service_type == ServiceType::Proxy {
            let target_set = definition
                .proxy
                .as_ref()
                .map(|p| !p.target.is_empty())
                .unwrap_or(false);
            if !target_set {
                return Err(LatticeError::Config(format!(
                    "proxy service {full_name} has no target"
                )));
            }
        }

        let descriptor = ServiceDescriptor {
            name: Some(name),
            service_type: Some(service_type),
            public: Some(public),
            service_state: Some(definition.service_state.unwrap_or_default()),
            get: definition.get,
            post: definition.post,
            put: definition.put,
            delete: definition.delete,
            all: definition.all,
            r#use: definition.use_path,
            parameters: definition.parameters,
            request_cert: definition.request_cert.then_some(true),
            server: None,
            proxy: definition.proxy,
            exclude_from_replicas: definition.exclude_from_replicas.then_some(true),
        };

        let entry = Arc::new(RegisteredService {
            descriptor,
            handler: definition.handler,
            policies: definition.policies,
            request_transform: definition.request_transform,
            transform: definition.transform,
            renderer: definition.renderer,
            module: module.to_string(),
        });

        let mut inner = self.inner.write().expect("registry lock");
        inner.routes.retain(|r| r.service != full_name);
        attach_routes(&mut inner.routes, &full_name, &entry.descriptor);
        info!(service = %full_name, "service registered");
        inner.services.insert(full_name.clone(), entry);
        Ok(full_name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RegisteredService>> {
        self.inner
            .read()
            .expect("registry lock")
            .services
            .get(name)
            .cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock")
            .services
            .keys()
            .cloned()
            .collect()
    }

    /// Policy chain for a service: global, then module, then service-level.
    pub fn policy_chain(&self, service: &RegisteredService) -> Vec<PolicyFn> {
        let inner = self.inner.read().expect("registry lock");
        let mut chain = inner.global_policies.clone();
        if let Some(module_policies) = inner.module_policies.get(&service.module) {
            chain.extend(module_policies.iter().cloned());
        }
        chain.extend(service.policies.iter().cloned());
        chain
    }

    pub fn add_global_policy(&self, policy: PolicyFn) {
        self.inner
            .write()
            .expect("registry lock")
            .global_policies
            .push(policy);
    }

    pub fn add_module_policy(&self, module: &str, policy: PolicyFn) {
        self.inner
            .write()
            .expect("registry lock")
            .module_policies
            .entry(module.to_string())
            .or_default()
            .push(policy);
    }

    pub fn add_module_renderer(&self, module: &str, renderer: RendererFn) {
        self.inner
            .write()
            .expect("registry lock")
            .module_renderers
            .insert(module.to_string(), renderer);
    }

    /// Renderer for a `render`-type service: service-level first, then the
    /// service's module. The node-wide fallback lives on the context.
    pub fn renderer_for(&self, service: &RegisteredService) -> Option<RendererFn> {
        if let Some(renderer) = &service.renderer {
            return Some(renderer.clone());
        }
        self.inner
            .read()
            .expect("registry lock")
            .module_renderers
            .get(&service.module)
            .cloned()
    }

    /// Resolve an HTTP method+path against the route table, in registration
    /// order. Method-specific and `all` routes are exact matches; `use`
    /// routes match by prefix.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method = method.to_ascii_lowercase();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let inner = self.inner.read().expect("registry lock");
        for route in &inner.routes {
            let method_ok = match route.method.as_str() {
                "use" | "all" => true,
                m => m == method,
            };
            if !method_ok {
                continue;
            }
            let prefix_only = route.method == "use";
            if let Some(params) = match_segments(&route.pattern, &segments, prefix_only) {
                return Some(RouteMatch {
                    service: route.service.clone(),
                    params,
                    rewrite: route.rewrite,
                    prefix_segments: if prefix_only { route.pattern.len() } else { 0 },
                });
            }
        }
        None
    }

    /// Record a static route this node serves directly, for export to peers.
    /// Idempotent.
    pub fn add_static_path(&self, method: &str, path: &str) {
        let mut inner = self.inner.write().expect("registry lock");
        let exists = inner
            .static_paths
            .iter()
            .any(|p| p.method == method && p.path == path);
        if !exists {
            inner.static_paths.push(StaticPath {
                method: method.to_string(),
                path: path.to_string(),
            });
        }
    }

    /// Remember a peer for export in the server-facing snapshot, first
    /// writer wins per host.
    pub fn record_remote_server(&self, entry: RemoteServerEntry) {
        let mut inner = self.inner.write().expect("registry lock");
        if !inner
            .remote_servers
            .iter()
            .any(|e| e.host_name == entry.host_name)
        {
            inner.remote_servers.push(entry);
        }
    }

    /// Merge a peer's exported dictionary into this registry.
    ///
    /// First writer wins: names already present stay untouched, except that
    /// a service soft-disabled with the empty-owner sentinel is re-attached
    /// when its own host comes back. Returns the names actually merged, for
    /// change propagation.
    pub fn merge_remote_dictionary(
        &self,
        host: &str,
        dict: BTreeMap<String, ServiceDescriptor>,
        static_paths: Vec<StaticPath>,
    ) -> Vec<String> {
        let mut merged = Vec::new();
        let mut inner = self.inner.write().expect("registry lock");
        for (full_name, mut descriptor) in dict {
            // Entries may carry their own owner (peers of the peer);
            // otherwise the exporting host owns them.
            let owner = descriptor
                .server
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| host.to_string());
            if owner == self.host_name {
                continue;
            }
            if let Some(existing) = inner.services.get(&full_name) {
                let soft_disabled = existing.descriptor.server.as_deref() == Some("");
                if !soft_disabled {
                    continue;
                }
                // Re-attach: same routes, owner restored.
                let mut revived = existing.descriptor.clone();
                revived.server = Some(owner.clone());
                inner.services.insert(
                    full_name.clone(),
                    Arc::new(RegisteredService {
                        descriptor: revived,
                        handler: None,
                        policies: Vec::new(),
                        request_transform: None,
                        transform: None,
                        renderer: None,
                        module: String::new(),
                    }),
                );
                debug!(service = %full_name, host = %owner, "service re-attached");
                merged.push(full_name);
                continue;
            }

            descriptor.server = Some(owner.clone());
            // Remote render output cannot be produced here; serve the route
            // by reverse proxy to the owner instead.
            if descriptor.service_type == Some(ServiceType::Render) {
                descriptor.service_type = Some(ServiceType::Proxy);
                descriptor.proxy = Some(ProxyOptions {
                    target: owner.clone(),
                    path_rewrite: false,
                    change_origin: true,
                });
            }
            inner.routes.retain(|r| r.service != full_name);
            attach_routes(&mut inner.routes, &full_name, &descriptor);
            debug!(service = %full_name, host = %owner, "remote service merged");
            inner.services.insert(
                full_name.clone(),
                Arc::new(RegisteredService {
                    descriptor,
                    handler: None,
                    policies: Vec::new(),
                    request_transform: None,
                    transform: None,
                    renderer: None,
                    module: String::new(),
                }),
            );
            merged.push(full_name);
        }

        // Static assets served by the peer become proxied routes here.
        for static_path in static_paths {
            let proxy_name = format!("proxy:{host}:{}", static_path.path);
            if inner.services.contains_key(&proxy_name) {
                continue;
            }
            let descriptor = ServiceDescriptor {
                name: Some(proxy_name.clone()),
                service_type: Some(ServiceType::Proxy),
                public: Some(true),
                r#use: Some(format!("^{}", static_path.path)),
                server: Some(host.to_string()),
                proxy: Some(ProxyOptions {
                    target: host.to_string(),
                    path_rewrite: false,
                    change_origin: true,
                }),
                ..Default::default()
            };
            attach_routes(&mut inner.routes, &proxy_name, &descriptor);
            inner.services.insert(
                proxy_name.clone(),
                Arc::new(RegisteredService {
                    descriptor,
                    handler: None,
                    policies: Vec::new(),
                    request_transform: None,
                    transform: None,
                    renderer: None,
                    module: String::new(),
                }),
            );
            merged.push(proxy_name);
        }
        merged
    }

    /// Soft-disable every service owned by `host`: the empty-owner sentinel
    /// keeps routes and metadata but makes calls fail fast until the host
    /// re-attaches.
    pub fn mark_host_unreachable(&self, host: &str) {
        let mut inner = self.inner.write().expect("registry lock");
        let names: Vec<String> = inner
            .services
            .iter()
            .filter(|(_, s)| s.descriptor.server.as_deref() == Some(host))
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            if let Some(existing) = inner.services.get(&name) {
                let mut descriptor = existing.descriptor.clone();
                descriptor.server = Some(String::new());
                warn!(service = %name, host = %host, "owner unreachable, service soft-disabled");
                inner.services.insert(
                    name,
                    Arc::new(RegisteredService {
                        descriptor,
                        handler: None,
                        policies: Vec::new(),
                        request_transform: None,
                        transform: None,
                        renderer: None,
                        module: String::new(),
                    }),
                );
            }
        }
    }

    /// Export the dictionary.
    ///
    /// Peers (`for_server`) see everything except entries excluded from
    /// replicas, plus static paths and known peers. Browsers see only public
    /// services, with `all`/`use` routes folded into `get` and internal
    /// metadata stripped.
    pub fn snapshot(&self, for_server: bool) -> DictionarySnapshot {
        let inner = self.inner.read().expect("registry lock");
        let mut dict = BTreeMap::new();
        for (full_name, service) in &inner.services {
            let descriptor = &service.descriptor;
            if for_server {
                if descriptor.exclude_from_replicas == Some(true) {
                    continue;
                }
                // Local services travel without an owner; the merging side
                // attributes them to this host.
                dict.insert(full_name.clone(), export_descriptor(descriptor.clone()));
                continue;
            }
            if descriptor.public != Some(true) {
                continue;
            }
            let mut exported = ServiceDescriptor {
                name: descriptor.name.clone(),
                service_type: descriptor.service_type,
                public: Some(true),
                get: descriptor
                    .get
                    .clone()
                    .or_else(|| descriptor.all.clone())
                    .or_else(|| descriptor.r#use.clone()),
                post: descriptor.post.clone(),
                put: descriptor.put.clone(),
                delete: descriptor.delete.clone(),
                parameters: descriptor.parameters.clone(),
                ..Default::default()
            };
            exported.get = exported.get.map(|p| p.trim_start_matches('^').to_string());
            dict.insert(full_name.clone(), exported);
        }
        DictionarySnapshot {
            dict,
            static_paths: for_server.then(|| inner.static_paths.clone()),
            remote_servers: for_server.then(|| inner.remote_servers.clone()),
            pid: self.pid,
        }
    }
}

// The sentinel is local state, not exportable ownership.
fn export_descriptor(mut descriptor: ServiceDescriptor) -> ServiceDescriptor {
    if descriptor.server.as_deref() == Some("") {
        descriptor.server = None;
    }
    descriptor
}

fn attach_routes(routes: &mut Vec<Route>, full_name: &str, descriptor: &ServiceDescriptor) {
    let declared = [
        ("get", &descriptor.get),
        ("post", &descriptor.post),
        ("put", &descriptor.put),
        ("delete", &descriptor.delete),
        ("all", &descriptor.all),
        ("use", &descriptor.r#use),
    ];
    for (method, path) in declared {
        let Some(path) = path else { continue };
        let (path, rewrite) = match path.strip_prefix('^') {
            Some(stripped) => (stripped, false),
            None => (path.as_str(), true),
        };
        routes.push(Route {
            method: method.to_string(),
            pattern: parse_pattern(path),
            rewrite,
            service: full_name.to_string(),
        });
    }
}

fn match_segments(
    pattern: &[Segment],
    segments: &[&str],
    prefix_only: bool,
) -> Option<Map<String, Value>> {
    if prefix_only {
        if segments.len() < pattern.len() {
            return None;
        }
    } else if segments.len() != pattern.len() {
        return None;
    }
    let mut params = Map::new();
    for (expected, actual) in pattern.iter().zip(segments) {
        match expected {
            Segment::Literal(lit) => {
                if lit != actual {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), Value::String((*actual).to_string()));
            }
        }
    }
    Some(params)
}
