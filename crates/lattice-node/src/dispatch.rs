//! The dispatch pipeline: every service call, whatever its transport, goes
//! through here exactly once on the node that resolves it.
//!
//! Order: lookup, ownership routing, stateless fork, policy chain, schema
//! validation, request transform, certificate gate, handler, response
//! transform. A failure at any step short-circuits the rest.

use crate::node::NodeCtx;
use crate::request::{ClientRequest, HandlerResult, ReplyChannel};
use crate::session::Session;
use lattice_core::envelope::{RemoteOutcome, WireRequest};
use lattice_core::{ErrorPayload, PeerEvent, RequestOrigin};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Resolve one call against the local registry.
pub async fn invoke_service(name: &str, mut request: ClientRequest) -> HandlerResult {
    let ctx = request.ctx.clone();
    let mut service = ctx.registry.lookup(name);
    if service.is_none() && ctx.peers.discover_service(&ctx, name).await {
        // An attached peer turned out to serve it.
        service = ctx.registry.lookup(name);
    }
    let Some(service) = service else {
        ctx.observers
            .notify("invoke_service_error", &json!({ "service": name, "status": 404 }));
        return Err(ErrorPayload::status(404).with_message(format!("Service {name} not found")));
    };
    request.service_name = name.to_string();
    request.service_type = service.service_type();

    match service.owner() {
        // Owner known but gone: fail fast, no transport attempt.
        Some("") => {
            ctx.observers
                .notify("invoke_service_error", &json!({ "service": name, "status": 504 }));
            return Err(ErrorPayload::status(504).with_message(format!(
                "Remote server for service {name} is disconnected"
            )));
        }
        Some(host) => {
            let host = host.to_string();
            return forward(&ctx, name, &host, request).await;
        }
        None => {}
    }

    // Stateless services never see the caller's session.
    if service.service_state() == lattice_core::ServiceState::Stateless {
        request.session = Session::ephemeral();
    }

    for policy in ctx.registry.policy_chain(&service) {
        if let Err(thrown) = policy(request.clone()).await {
            debug!(service = %name, "policy rejected call");
            ctx.observers
                .notify("invoke_service_error", &json!({ "service": name, "status": 401 }));
            return Err(ErrorPayload::merge_over(401, thrown));
        }
    }

    if let Some(schema) = &service.descriptor.parameters {
        if let Err(payload) = ctx.validator.validate(schema, &request.params) {
            return Err(payload);
        }
    }

    if let Some(shape) = &service.request_transform {
        let params = request.params.clone();
        request.params = shape(&request, params);
    }

    if service.descriptor.request_cert == Some(true) {
        let provider = ctx.certificates.read().expect("certificates lock").clone();
        match provider.acquire(&request) {
            Some(certificate) => request.certificate = Some(certificate),
            None => {
                ctx.observers
                    .notify("invoke_service_error", &json!({ "service": name, "status": 401 }));
                return Err(ErrorPayload::status(401).with_message("Client certificate required"));
            }
        }
    }

    let Some(handler) = &service.handler else {
        return Err(ErrorPayload::status(500)
            .with_message(format!("Service {name} has no implementation")));
    };
    let result = handler(request.clone()).await;

    match result {
        Ok(value) => {
            let value = match &service.transform {
                Some(transform) => transform(&request, value),
                None => value,
            };
            ctx.observers
                .notify("invoke_service_success", &json!({ "service": name }));
            Ok(value)
        }
        Err(payload) => {
            ctx.observers.notify(
                "invoke_service_error",
                &json!({ "service": name, "status": payload.status }),
            );
            Err(payload)
        }
    }
}

/// Forward to the owning node and replay captured side effects locally.
async fn forward(
    ctx: &Arc<NodeCtx>,
    name: &str,
    host: &str,
    request: ClientRequest,
) -> HandlerResult {
    let wire = request.to_wire();
    let progress_target = request.clone();
    let progress = Some(Arc::new(move |body: Value| {
        progress_target.will_resolve(body);
    }) as crate::peers::ProgressFn);

    match ctx.peers.forward_call(ctx, name, host, wire, progress).await {
        Ok(outcome) => {
            for cookie in outcome.remote_set_cookie {
                request.set_cookie(cookie.name, cookie.value, cookie.max_age);
            }
            if let Some(redirect) = outcome.remote_redirect {
                request.redirect(redirect.url, redirect.status);
            }
            ctx.observers
                .notify("invoke_service_success", &json!({ "service": name, "remote": host }));
            Ok(outcome.remote_response.unwrap_or(Value::Null))
        }
        Err(payload) => {
            ctx.observers.notify(
                "invoke_service_error",
                &json!({ "service": name, "status": payload.status, "remote": host }),
            );
            Err(payload)
        }
    }
}

/// Resolve a call forwarded from a peer: rebuild the request from its wire
/// form, run the pipeline, and capture side effects for replay.
pub async fn dispatch_remote(
    ctx: &Arc<NodeCtx>,
    service: &str,
    wire: WireRequest,
    peer: Option<mpsc::UnboundedSender<PeerEvent>>,
    tid: &str,
) -> Result<RemoteOutcome, ErrorPayload> {
    let outcome = Arc::new(Mutex::new(RemoteOutcome::default()));
    let request = ClientRequest {
        ctx: ctx.clone(),
        session: ctx.sessions.from_snapshot(wire.session),
        origin: RequestOrigin::Remote,
        service_type: wire.service_type,
        service_name: service.to_string(),
        lang: wire.lang,
        cookies: wire.cookies,
        headers: wire.headers,
        original_url: wire.original_url,
        base_url: wire.base_url,
        params: wire.params,
        certificate: wire.certificate,
        remote_address: wire.remote_address,
        socket_id: wire.socket_id,
        tid: Some(tid.to_string()),
        reply: ReplyChannel::Remote {
            outcome: outcome.clone(),
            peer,
        },
    };

    let value = invoke_service(service, request).await?;
    let mut captured = std::mem::take(&mut *outcome.lock().expect("outcome lock"));
    captured.remote_response = Some(value);
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceDefinition;
    use crate::request::HttpReply;
    use lattice_core::dictionary::ServiceDescriptor;
    use lattice_core::ServiceType;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_request(ctx: Arc<NodeCtx>) -> ClientRequest {
        ClientRequest {
            ctx,
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

    #[tokio::test]
    async fn unknown_service_is_404() {
        let ctx = NodeCtx::for_tests();
        let err = invoke_service("nope", test_request(ctx)).await.unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[tokio::test]
    async fn soft_disabled_owner_fails_fast_with_504() {
        let ctx = NodeCtx::for_tests();
        ctx.registry.merge_remote_dictionary(
            "http://gone",
            BTreeMap::from([(
                "report".to_string(),
                ServiceDescriptor {
                    name: Some("report".into()),
                    get: Some("/report".into()),
                    ..Default::default()
                },
            )]),
            Vec::new(),
        );
        ctx.registry.mark_host_unreachable("http://gone");

        let err = invoke_service("report", test_request(ctx)).await.unwrap_err();
        assert_eq!(err.status, 504);
        assert!(err.message.contains("report"));
    }

    #[tokio::test]
    async fn policy_rejection_short_circuits_handler() {
        let ctx = NodeCtx::for_tests();
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let counted = handler_calls.clone();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("guarded".into()),
                    policies: vec![Arc::new(|_req| {
                        Box::pin(async { Err(json!({"message": "no entry", "status": 403})) })
                    })],
                    handler: Some(Arc::new(move |_req| {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Box::pin(async { Ok(json!("ran")) })
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = invoke_service("guarded", test_request(ctx)).await.unwrap_err();
        assert_eq!(err.status, 403);
        assert_eq!(err.message, "no entry");
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn policy_runs_before_the_certificate_gate() {
        let ctx = NodeCtx::for_tests();
        let policy_calls = Arc::new(AtomicUsize::new(0));
        let counted = policy_calls.clone();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("sealed".into()),
                    request_cert: true,
                    policies: vec![Arc::new(move |_req| {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Box::pin(async { Err(json!({"message": "no entry", "status": 403})) })
                    })],
                    handler: Some(Arc::new(|_req| Box::pin(async { Ok(json!("ran")) }))),
                    ..Default::default()
                },
            )
            .unwrap();

        // The policy's verdict wins; the certificate gate never runs.
        let err = invoke_service("sealed", test_request(ctx)).await.unwrap_err();
        assert_eq!(err.status, 403);
        assert_eq!(err.message, "no entry");
        assert_eq!(policy_calls.load(Ordering::SeqCst), 1);
    }

    struct FingerprintProvider;

    impl crate::cert::CertificateProvider for FingerprintProvider {
        fn acquire(&self, _request: &ClientRequest) -> Option<Value> {
            Some(json!({"fingerprint": "ab:cd"}))
        }
    }

    #[tokio::test]
    async fn certificate_gate_asks_the_provider() {
        let ctx = NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("vault".into()),
                    request_cert: true,
                    handler: Some(Arc::new(|req| {
                        Box::pin(async move { Ok(req.certificate.clone().unwrap_or(Value::Null)) })
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        // Default provider: nothing attached, nothing produced.
        let err = invoke_service("vault", test_request(ctx.clone())).await.unwrap_err();
        assert_eq!(err.status, 401);

        *ctx.certificates.write().unwrap() = Arc::new(FingerprintProvider);
        let value = invoke_service("vault", test_request(ctx)).await.unwrap();
        assert_eq!(value, json!({"fingerprint": "ab:cd"}));
    }

    #[tokio::test]
    async fn transform_shapes_successful_payload() {
        let ctx = NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("sum".into()),
                    handler: Some(Arc::new(|req| {
                        Box::pin(async move {
                            let a = req.param("a").and_then(Value::as_i64).unwrap_or(0);
                            let b = req.param("b").and_then(Value::as_i64).unwrap_or(0);
                            Ok(json!(a + b))
                        })
                    })),
                    transform: Some(Arc::new(|_req, value| json!({ "total": value }))),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut request = test_request(ctx);
        request.params = json!({"a": 2, "b": 3});
        let value = invoke_service("sum", request).await.unwrap();
        assert_eq!(value, json!({"total": 5}));
    }

    #[tokio::test]
    async fn request_transform_shapes_params_before_handler() {
        let ctx = NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("shout".into()),
                    request_transform: Some(Arc::new(|_req, params| {
                        match params.get("word").and_then(Value::as_str) {
                            Some(word) => json!({ "word": word.to_uppercase() }),
                            None => params,
                        }
                    })),
                    handler: Some(Arc::new(|req| {
                        Box::pin(async move { Ok(req.params["word"].clone()) })
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut request = test_request(ctx);
        request.params = json!({"word": "hey"});
        let value = invoke_service("shout", request).await.unwrap();
        assert_eq!(value, json!("HEY"));
    }

    #[tokio::test]
    async fn stateless_service_gets_a_blank_session() {
        let ctx = NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("anon".into()),
                    service_state: Some(lattice_core::ServiceState::Stateless),
                    handler: Some(Arc::new(|req| {
                        Box::pin(async move { Ok(json!(req.session.get("user"))) })
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut request = test_request(ctx.clone());
        let session = ctx.sessions.session("s1");
        session.set("user", json!("ada"));
        request.session = session;
        let value = invoke_service("anon", request).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn dispatch_remote_captures_side_effects() {
        let ctx = NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("login".into()),
                    handler: Some(Arc::new(|req| {
                        Box::pin(async move {
                            req.set_cookie("sid", "fresh", None);
                            req.redirect("/home", Some(303));
                            Ok(json!({"ok": true}))
                        })
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        let wire = test_request(ctx.clone()).to_wire();
        let outcome = dispatch_remote(&ctx, "login", wire, None, "t1").await.unwrap();
        assert_eq!(outcome.remote_response, Some(json!({"ok": true})));
        assert_eq!(outcome.remote_set_cookie[0].value, "fresh");
        assert_eq!(outcome.remote_redirect.unwrap().status, Some(303));
    }
}
