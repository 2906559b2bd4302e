//! The dictionary: the exported map of service name to routing/visibility
//! metadata exchanged between nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a service's payload is produced and rendered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Json,
    Form,
    Render,
    Static,
    Proxy,
}

/// Whether a call participates in session/cookie handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stateful,
    Stateless,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Stateful
    }
}

/// Reverse-proxy options for `proxy`-type services. `target` is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyOptions {
    pub target: String,
    /// When true (the default), strip the matched route prefix before
    /// forwarding.
    #[serde(default = "default_true")]
    pub path_rewrite: bool,
    #[serde(default = "default_true")]
    pub change_origin: bool,
}

fn default_true() -> bool {
    true
}

/// One service's exportable metadata, as carried inside a dictionary
/// snapshot. Route fields are sparse: only declared routes travel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_state: Option<ServiceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#use: Option<String>,
    /// Parameter schema specification, validated by the pluggable schema
    /// validator before invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    /// Demand a TLS client certificate (renegotiation) before invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cert: Option<bool>,
    /// Owning host. Absent = local; `""` = previously-owned host is
    /// currently unreachable (soft-disabled, routes preserved).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_from_replicas: Option<bool>,
}

/// A static route exported so peers can reverse-proxy it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticPath {
    pub method: String,
    pub path: String,
}

/// A peer a gateway knows about, exported for peer-of-peer discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerEntry {
    pub host_name: String,
    pub passkey: String,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub replica: bool,
}

/// The `/api` response: the exportable subset of this node's registry.
///
/// The server-to-server variant carries private services, ownership and
/// replication metadata, static paths, and known peers; the browser variant
/// carries only public descriptors with `all`/`use` folded into `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionarySnapshot {
    pub dict: BTreeMap<String, ServiceDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_paths: Option<Vec<StaticPath>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_servers: Option<Vec<RemoteServerEntry>>,
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sparse_routes() {
        let descriptor = ServiceDescriptor {
            name: Some("echo".into()),
            service_type: Some(ServiceType::Json),
            get: Some("/api/echo".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("get"));
        assert!(!obj.contains_key("post"));
        assert!(!obj.contains_key("server"));
    }

    #[test]
    fn empty_server_sentinel_survives_round_trip() {
        let descriptor = ServiceDescriptor {
            name: Some("down".into()),
            server: Some(String::new()),
            ..Default::default()
        };
        let decoded: ServiceDescriptor =
            serde_json::from_str(&serde_json::to_string(&descriptor).unwrap()).unwrap();
        assert_eq!(decoded.server.as_deref(), Some(""));
    }

    #[test]
    fn proxy_options_default_rewrite() {
        let options: ProxyOptions =
            serde_json::from_str(r#"{"target":"http://127.0.0.1:4000"}"#).unwrap();
        assert!(options.path_rewrite);
        assert!(options.change_origin);
    }
}
