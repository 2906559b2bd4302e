//! lattice-core: Shared protocol library for the lattice service mesh.
//!
//! Provides the transport-neutral request envelope, the dictionary snapshot
//! schema exchanged between nodes, the WebSocket event protocol (client-facing
//! and inter-node), structured error payloads, and id generation.

pub mod dictionary;
pub mod envelope;
pub mod error;
pub mod id;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use dictionary::{
    DictionarySnapshot, ProxyOptions, RemoteServerEntry, ServiceDescriptor, ServiceState,
    ServiceType, StaticPath,
};
pub use envelope::{CookieInstruction, RedirectInstruction, RemoteOutcome, SessionSnapshot, WireRequest};
pub use error::{ErrorPayload, LatticeError, LatticeResult};
pub use id::make_id;
pub use protocol::{ClientEvent, PeerEvent, PingResponse, RequestOrigin, SERVER_REQUEST_HEADER};

/// Cookie name carrying the session id.
pub const SESSION_COOKIE: &str = "sid";
/// Cookie name carrying the device id.
pub const DEVICE_COOKIE: &str = "did";
/// Max-age for the device cookie, in seconds (effectively permanent).
pub const DEVICE_COOKIE_MAX_AGE: u64 = 9_999_999_999;

/// Length of generated session and device ids.
pub const SESSION_ID_LEN: usize = 20;
/// Length of generated correlation ids (tids).
pub const TID_LEN: usize = 10;
