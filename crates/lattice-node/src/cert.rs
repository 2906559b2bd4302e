//! Client certificates for services that ask for one.
//!
//! The node itself runs plain HTTP behind whatever terminates TLS, so it
//! never sees a raw certificate. A [`CertificateProvider`] bridges that
//! gap: given the request, produce the certificate value to attach, or
//! `None` to refuse the call. The default provider passes through whatever
//! the transport already attached.

use crate::request::ClientRequest;
use serde_json::Value;

/// Produces the client certificate for a call to a certificate-requiring
/// service. Runs after policies and parameter shaping, right before the
/// handler.
pub trait CertificateProvider: Send + Sync {
    /// Return the certificate to attach to `request`, or `None` when the
    /// caller cannot be identified. `None` rejects the call with 401.
    fn acquire(&self, request: &ClientRequest) -> Option<Value>;
}

/// Pass-through provider: accept a certificate the transport or a forwarding
/// node already attached, refuse otherwise.
#[derive(Debug, Default)]
pub struct AttachedCertificate;

impl CertificateProvider for AttachedCertificate {
    fn acquire(&self, request: &ClientRequest) -> Option<Value> {
        request.certificate.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCtx;
    use crate::request::{HttpReply, ReplyChannel};
    use crate::session::Session;
    use lattice_core::{RequestOrigin, ServiceType};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn bare_request() -> ClientRequest {
        ClientRequest {
            ctx: NodeCtx::for_tests(),
            session: Session::ephemeral(),
            origin: RequestOrigin::Http,
            service_type: ServiceType::Json,
            service_name: String::new(),
            lang: Vec::new(),
            cookies: BTreeMap::new(),
            headers: BTreeMap::new(),
            original_url: None,
            base_url: None,
            params: json!({}),
            certificate: None,
            remote_address: None,
            socket_id: None,
            tid: None,
            reply: ReplyChannel::Http(Arc::new(Mutex::new(HttpReply::default()))),
        }
    }

    #[test]
    fn attached_provider_mirrors_the_request() {
        let provider = AttachedCertificate;
        let mut request = bare_request();
        assert_eq!(provider.acquire(&request), None);
        request.certificate = Some(json!({"cn": "ada"}));
        assert_eq!(provider.acquire(&request), Some(json!({"cn": "ada"})));
    }
}
