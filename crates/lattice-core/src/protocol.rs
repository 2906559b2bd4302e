//! WebSocket event protocol and HTTP server-protocol bodies.
//!
//! Both namespaces speak JSON text frames shaped as `{"event": ..., fields}`.
//! The default namespace carries client traffic; `/servers` carries
//! inter-node traffic between a gateway and its remote servers.

use crate::envelope::{RemoteOutcome, WireRequest};
use crate::error::{ErrorPayload, LatticeError, LatticeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker header tagging server-to-server HTTP calls.
pub const SERVER_REQUEST_HEADER: &str = "server-request";

/// WebSocket path for the client-facing namespace.
pub const CLIENT_WS_PATH: &str = "/socket";
/// WebSocket path for the inter-node namespace.
pub const SERVERS_WS_PATH: &str = "/servers";

/// Fixed server-protocol HTTP paths.
pub const API_PATH: &str = "/api";
pub const REMOTE_REQUEST_PATH: &str = "/api/server/remoteRequest";
pub const REMOTE_SERVER_PATH: &str = "/api/server/remoteServer";
pub const PING_PATH: &str = "/api/server/ping";
pub const SERVICE_QUERY_PATH: &str = "/api/server/service";

/// Where a request envelope was constructed from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestOrigin {
    Http,
    Ws,
    Remote,
}

/// Events exchanged with end clients on the default namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Client → node: invoke a service.
    Request {
        service: String,
        params: Value,
        tid: String,
    },
    /// Node → client: final successful payload for `tid`.
    Response { tid: String, body: Value },
    /// Node → client: final error payload for `tid`.
    Error { tid: String, body: ErrorPayload },
    /// Node → client: progress notification before final resolution.
    Will { tid: String, body: Value },
    /// Node → client: set a cookie on the browser side.
    Cookie {
        name: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_age: Option<u64>,
    },
    /// Node → client: navigate.
    Redirect {
        tid: String,
        url: String,
        status: u16,
    },
    /// Node → client: a server-initiated named event.
    Emit {
        #[serde(rename = "name")]
        name: String,
        args: Vec<Value>,
    },
}

/// Events exchanged between nodes on the `/servers` namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PeerEvent {
    /// Gateway → remote, first frame on a live connection: mutual auth.
    Handshake {
        /// The dialing node's own identity.
        host: String,
        /// Who the dialer believes it is talking to; the accepting side
        /// drops handshakes addressed to anyone else.
        remote_host: String,
        passkey: String,
        replica: bool,
        /// Channel name the remote should listen on for dictionary deltas.
        change_channel: String,
    },
    /// Gateway → remote: invoke a service on the remote on behalf of a client.
    ServerRequest {
        service: String,
        request: WireRequest,
        tid: String,
    },
    /// Remote → gateway: correlated reply to a `ServerRequest`.
    ServerResponse { tid: String, outcome: RemoteOutcome },
    /// The reverse direction: the accepting side of a link invokes a service
    /// on the side that dialed it.
    Request {
        service: String,
        request: WireRequest,
        tid: String,
    },
    /// Correlated reply on an already-connected channel (remote-initiated
    /// calls back through the same socket).
    Response { tid: String, outcome: RemoteOutcome },
    /// Correlated rejection.
    Error { tid: String, body: ErrorPayload },
    /// Progress notification for a pending call; never resolves it.
    Will { tid: String, body: Value },
    /// Relay a server-initiated emit to the end-client socket by id.
    ClientMsg {
        socket_id: String,
        name: String,
        args: Vec<Value>,
    },
    /// Relay a progress notification to the end-client socket by id.
    ClientWill {
        socket_id: String,
        tid: String,
        body: Value,
    },
    /// Gateway → replica: dictionary delta to merge.
    DictChanged {
        channel: String,
        dict: std::collections::BTreeMap<String, crate::dictionary::ServiceDescriptor>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        static_paths: Vec<crate::dictionary::StaticPath>,
    },
}

/// Encode an event as a JSON text frame.
pub fn encode_event<T: Serialize>(event: &T) -> LatticeResult<String> {
    serde_json::to_string(event).map_err(|e| LatticeError::Codec(e.to_string()))
}

/// Decode a JSON text frame into an event.
pub fn decode_event<'a, T: Deserialize<'a>>(frame: &'a str) -> LatticeResult<T> {
    serde_json::from_str(frame).map_err(|e| LatticeError::Codec(e.to_string()))
}

// ── HTTP server-protocol bodies ─────────────────────────────────────────

/// Body of `POST /api/server/remoteRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequestBody {
    pub method_name: String,
    pub client_request: WireRequest,
}

/// Handshake payload carried inside a `remoteServer` registration when a
/// gateway announces itself to a remote over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub host_name: String,
    pub passkey: String,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub replica: bool,
    pub change_channel: String,
}

/// Body of `POST /api/server/remoteServer` — peer registration, both
/// directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteServerBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_attach_passkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
}

/// Body of `POST /api/server/service` — ask the gateway for one service's
/// routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceQueryBody {
    pub local_host: String,
    pub passkey: String,
    pub full_service_name: String,
}

/// Response of `GET /api/server/ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    /// Sender's clock at response time, epoch milliseconds.
    pub pong: u64,
}
