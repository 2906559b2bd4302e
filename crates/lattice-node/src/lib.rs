//! lattice-node: the runtime for one node of a lattice mesh.
//!
//! A node serves HTTP and WebSocket clients, keeps a registry of local and
//! remote services, attaches to peers, and routes every call through one
//! dispatch pipeline regardless of transport.

pub mod cert;
pub mod config;
pub mod dispatch;
pub mod node;
pub mod peers;
pub mod registry;
pub mod request;
pub mod schema;
pub mod session;
pub mod transport;

pub use cert::{AttachedCertificate, CertificateProvider};
pub use config::NodeConfig;
pub use node::{Node, NodeCtx, ObserverFn};
pub use registry::{RegisteredService, ServiceDefinition, ServiceRegistry};
pub use request::{ClientRequest, HandlerResult, PolicyFn, RendererFn, ServiceHandler, TransformFn};
pub use schema::{AcceptAllValidator, SchemaValidator};
pub use session::{MemoryStore, NullStore, Session, SessionManager, SessionStore};
