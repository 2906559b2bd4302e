//! The wire shape of a client request as it crosses node boundaries.
//!
//! A handler on the owning node receives a request rehydrated from this
//! serialization; side effects it produces (cookies, a redirect) are captured
//! into a [`RemoteOutcome`] and replayed on the node actually talking to the
//! end client.

use crate::dictionary::ServiceType;
use crate::protocol::RequestOrigin;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A session resolved to a plain key/value snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
}

/// The transport-neutral request envelope, serialized.
///
/// Fields are present only when truthy on the originating side (sparse
/// encoding); `params` always travels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub session: SessionSnapshot,
    pub origin: RequestOrigin,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lang: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    /// Socket id of the end client, when the call originated on a WebSocket.
    /// Lets the owning node push events back through the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

/// One buffered `setCookie` instruction captured on a remote node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CookieInstruction {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
}

/// One buffered `redirect` instruction captured on a remote node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectInstruction {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// The structured payload a forwarded call returns: the handler result plus
/// any side effects buffered while it ran on the owning node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_set_cookie: Vec<CookieInstruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_redirect: Option<RedirectInstruction>,
}
