//! The HTTP surface: one axum router with the WebSocket upgrades and a
//! fallback that resolves everything else against the dynamic route table.
//!
//! Routes cannot live in the axum router itself: peers inject services (and
//! therefore routes) while the node runs, so matching happens per request.

use crate::node::NodeCtx;
use crate::request::{ClientRequest, HttpReply, ReplyChannel};
use crate::transport::ws;
use lattice_core::envelope::{CookieInstruction, RedirectInstruction};
use lattice_core::protocol::{CLIENT_WS_PATH, SERVERS_WS_PATH};
use lattice_core::{
    make_id, ErrorPayload, LatticeError, LatticeResult, RequestOrigin, ServiceType,
    DEVICE_COOKIE, DEVICE_COOKIE_MAX_AGE, SESSION_COOKIE, SESSION_ID_LEN, SERVER_REQUEST_HEADER,
};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Bind and serve until the listener fails.
pub async fn serve(ctx: Arc<NodeCtx>) -> LatticeResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.port));
    let app = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| LatticeError::Transport(e.to_string()))
}

pub fn build_router(ctx: Arc<NodeCtx>) -> Router {
    Router::new()
        .route(CLIENT_WS_PATH, get(ws::client_upgrade))
        .route(SERVERS_WS_PATH, get(ws::peer_upgrade))
        .fallback(dispatch_http)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Resolve one HTTP request through the route table and the dispatch
/// pipeline.
async fn dispatch_http(State(ctx): State<Arc<NodeCtx>>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let path = uri.path().to_string();

    let Some(route) = ctx.registry.match_route(method.as_str(), &path) else {
        return error_response(&ErrorPayload::status(404), Vec::new());
    };
    let Some(service) = ctx.registry.lookup(&route.service) else {
        return error_response(&ErrorPayload::status(404), Vec::new());
    };

    let body_bytes = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                &ErrorPayload::status(400).with_message(format!("unreadable body: {e}")),
                Vec::new(),
            )
        }
    };

    if service.service_type() == ServiceType::Proxy {
        return reverse_proxy(&ctx, &service, &route, &method, &uri, &headers, body_bytes).await;
    }

    let cookies = parse_cookies(&headers);
    let is_server_call = headers.contains_key(SERVER_REQUEST_HEADER);
    // Stateless services carry no session, so issuing one would be noise.
    let skip_issuance =
        is_server_call || service.service_state() == lattice_core::ServiceState::Stateless;

    // Identify the caller; server-to-server calls carry no browser cookies.
    let mut issued_cookies = Vec::new();
    let sid = match cookies.get(SESSION_COOKIE) {
        Some(sid) => sid.clone(),
        None if skip_issuance => String::new(),
        None => {
            let sid = make_id(SESSION_ID_LEN);
            issued_cookies.push(CookieInstruction {
                name: SESSION_COOKIE.to_string(),
                value: sid.clone(),
                max_age: None,
            });
            sid
        }
    };
    let did = match cookies.get(DEVICE_COOKIE) {
        Some(did) => did.clone(),
        None if skip_issuance => String::new(),
        None => {
            let did = make_id(SESSION_ID_LEN);
            issued_cookies.push(CookieInstruction {
                name: DEVICE_COOKIE.to_string(),
                value: did.clone(),
                max_age: Some(DEVICE_COOKIE_MAX_AGE),
            });
            did
        }
    };

    let session = ctx.sessions.session(&sid);
    // The device id rides in the session, generated or returning.
    if !did.is_empty() {
        session.set(DEVICE_COOKIE, Value::String(did));
    }

    let params = merge_params(route.params, &headers, &body_bytes, uri.query());
    let reply = Arc::new(Mutex::new(HttpReply::default()));
    let client_request = ClientRequest {
        ctx: ctx.clone(),
        session,
        origin: RequestOrigin::Http,
        service_type: service.service_type(),
        service_name: route.service.clone(),
        lang: parse_lang(&headers),
        cookies,
        headers: header_map(&headers),
        original_url: Some(uri.to_string()),
        base_url: Some(path),
        params: Value::Object(params),
        certificate: None,
        remote_address: None,
        socket_id: None,
        tid: None,
        reply: ReplyChannel::Http(reply.clone()),
    };

    ctx.observers.notify(
        "client_request",
        &serde_json::json!({ "service": route.service, "origin": "http" }),
    );

    let result = crate::dispatch::invoke_service(&route.service, client_request.clone()).await;

    let buffered = {
        let mut reply = reply.lock().expect("reply lock");
        HttpReply {
            cookies: std::mem::take(&mut reply.cookies),
            redirect: reply.redirect.take(),
        }
    };
    issued_cookies.extend(buffered.cookies);
    let cookie_headers = render_cookies(&ctx, issued_cookies);

    match result {
        Err(payload) => error_response(&payload, cookie_headers),
        Ok(value) => {
            if let Some(redirect) = buffered.redirect {
                return redirect_response(&redirect, cookie_headers);
            }
            success_response(&ctx, &client_request, &service, value, cookie_headers)
        }
    }
}

fn success_response(
    ctx: &Arc<NodeCtx>,
    request: &ClientRequest,
    service: &crate::registry::RegisteredService,
    value: Value,
    cookies: Vec<String>,
) -> Response {
    let mut response = match service.service_type() {
        ServiceType::Render => {
            let renderer = ctx
                .registry
                .renderer_for(service)
                .or_else(|| ctx.renderer.read().expect("renderer lock").clone());
            match renderer {
                Some(renderer) => {
                    let html = renderer(request, &value);
                    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
                }
                // Nothing to render with: an empty page, not an error.
                None => StatusCode::OK.into_response(),
            }
        }
        ServiceType::Static => match value {
            Value::String(content) => {
                ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], content).into_response()
            }
            other => Json(other).into_response(),
        },
        _ => Json(value).into_response(),
    };
    append_cookies(&mut response, cookies);
    response
}

fn error_response(payload: &ErrorPayload, cookies: Vec<String>) -> Response {
    let status =
        StatusCode::from_u16(payload.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(payload.clone())).into_response();
    append_cookies(&mut response, cookies);
    response
}

fn redirect_response(redirect: &RedirectInstruction, cookies: Vec<String>) -> Response {
    let status = StatusCode::from_u16(redirect.status.unwrap_or(302))
        .unwrap_or(StatusCode::FOUND);
    let mut response = (status, [(header::LOCATION, redirect.url.clone())]).into_response();
    append_cookies(&mut response, cookies);
    response
}

fn append_cookies(response: &mut Response, cookies: Vec<String>) {
    for cookie in cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

fn render_cookies(ctx: &Arc<NodeCtx>, instructions: Vec<CookieInstruction>) -> Vec<String> {
    instructions
        .into_iter()
        .map(|c| {
            let mut rendered = format!("{}={}; Path=/; SameSite=Strict", c.name, c.value);
            if let Some(max_age) = c.max_age {
                rendered.push_str(&format!("; Max-Age={max_age}"));
            }
            if ctx.config.secure {
                rendered.push_str("; Secure");
            }
            rendered
        })
        .collect()
}

/// Merge param sources, later ones winning: route captures, then body, then
/// query string.
fn merge_params(
    route_params: Map<String, Value>,
    headers: &HeaderMap,
    body: &[u8],
    query: Option<&str>,
) -> Map<String, Value> {
    let mut params = route_params;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => params.extend(map),
            Ok(_) | Err(_) if body.is_empty() => {}
            Ok(other) => debug!(kind = %value_kind(&other), "non-object json body ignored"),
            Err(e) => debug!(error = %e, "unparseable json body ignored"),
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            for (key, value) in pairs {
                params.insert(key, Value::String(value));
            }
        }
    }

    if let Some(query) = query {
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
            for (key, value) in pairs {
                params.insert(key, Value::String(value));
            }
        }
    }
    params
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
    cookies
}

pub(crate) fn parse_lang(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(|part| part.split(';').next().unwrap_or("").trim().to_string())
                .filter(|lang| !lang.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Forward a matched proxy route to its target, body and headers included.
async fn reverse_proxy(
    ctx: &Arc<NodeCtx>,
    service: &crate::registry::RegisteredService,
    route: &crate::registry::RouteMatch,
    method: &axum::http::Method,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(proxy) = &service.descriptor.proxy else {
        return error_response(
            &ErrorPayload::status(500).with_message("Proxy service without target"),
            Vec::new(),
        );
    };

    let path = if route.rewrite && proxy.path_rewrite {
        let kept: Vec<&str> = uri
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(route.prefix_segments)
            .collect();
        format!("/{}", kept.join("/"))
    } else {
        uri.path().to_string()
    };
    let url = match uri.query() {
        Some(query) => format!("{}{}?{}", proxy.target, path, query),
        None => format!("{}{}", proxy.target, path),
    };

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(&ErrorPayload::status(400), Vec::new()),
    };
    let mut upstream = ctx
        .peers
        .http_client()
        .request(reqwest_method, &url)
        .body(body.to_vec());
    for (name, value) in headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        if let Ok(value) = value.to_str() {
            upstream = upstream.header(name.as_str(), value);
        }
    }

    let upstream_response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "proxy upstream unreachable");
            return error_response(&ErrorPayload::gateway_timeout(e.to_string()), Vec::new());
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    match upstream_response.bytes().await {
        Ok(bytes) => builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
        Err(e) => error_response(&ErrorPayload::gateway_timeout(e.to_string()), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceDefinition;
    use crate::session::Session;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn bare_request(ctx: Arc<NodeCtx>) -> ClientRequest {
        ClientRequest {
            ctx,
            session: Session::ephemeral(),
            origin: RequestOrigin::Http,
            service_type: ServiceType::Render,
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

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn render_prefers_service_renderer_over_module() {
        let ctx = crate::node::NodeCtx::for_tests();
        ctx.registry.add_module_renderer(
            "site",
            Arc::new(|_req, value| format!("module:{}", value.as_str().unwrap_or_default())),
        );
        ctx.registry
            .register(
                "site",
                ServiceDefinition {
                    name: Some("page".into()),
                    service_type: Some(ServiceType::Render),
                    handler: Some(Arc::new(|_req| Box::pin(async { Ok(json!("hi")) }))),
                    ..Default::default()
                },
            )
            .unwrap();
        ctx.registry
            .register(
                "site",
                ServiceDefinition {
                    name: Some("banner".into()),
                    service_type: Some(ServiceType::Render),
                    renderer: Some(Arc::new(|_req, value| {
                        format!("service:{}", value.as_str().unwrap_or_default())
                    })),
                    handler: Some(Arc::new(|_req| Box::pin(async { Ok(json!("hi")) }))),
                    ..Default::default()
                },
            )
            .unwrap();

        let request = bare_request(ctx.clone());
        let page = ctx.registry.lookup("site.page").unwrap();
        let body =
            body_string(success_response(&ctx, &request, &page, json!("hi"), Vec::new())).await;
        assert_eq!(body, "module:hi");

        let banner = ctx.registry.lookup("site.banner").unwrap();
        let body =
            body_string(success_response(&ctx, &request, &banner, json!("hi"), Vec::new())).await;
        assert_eq!(body, "service:hi");
    }

    #[tokio::test]
    async fn render_without_any_renderer_writes_nothing() {
        let ctx = crate::node::NodeCtx::for_tests();
        ctx.registry
            .register(
                "",
                ServiceDefinition {
                    name: Some("bare".into()),
                    service_type: Some(ServiceType::Render),
                    handler: Some(Arc::new(|_req| Box::pin(async { Ok(json!("hi")) }))),
                    ..Default::default()
                },
            )
            .unwrap();
        let request = bare_request(ctx.clone());
        let bare = ctx.registry.lookup("bare").unwrap();
        let response = success_response(&ctx, &request, &bare, json!("hi"), Vec::new());
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
    }

    #[test]
    fn param_precedence_route_then_body_then_query() {
        let mut route_params = Map::new();
        route_params.insert("a".into(), json!("1"));
        route_params.insert("b".into(), json!("1"));
        route_params.insert("c".into(), json!("1"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = br#"{"a": 2, "b": 2}"#;
        let params = merge_params(route_params, &headers, body, Some("b=4&c=5"));

        assert_eq!(params["a"], json!(2));
        assert_eq!(params["b"], json!("4"));
        assert_eq!(params["c"], json!("5"));
    }

    #[test]
    fn form_bodies_merge_as_strings() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let params = merge_params(Map::new(), &headers, b"name=ada&role=op", None);
        assert_eq!(params["name"], json!("ada"));
        assert_eq!(params["role"], json!("op"));
    }

    #[test]
    fn cookie_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("sid=abc123; did=device9"),
        );
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies["sid"], "abc123");
        assert_eq!(cookies["did"], "device9");
    }

    #[test]
    fn lang_parsing_strips_quality() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-GB,en;q=0.9,fr;q=0.8"),
        );
        assert_eq!(parse_lang(&headers), vec!["en-GB", "en", "fr"]);
    }

    #[test]
    fn issued_cookie_format() {
        let ctx = crate::node::NodeCtx::for_tests();
        let rendered = render_cookies(
            &ctx,
            vec![CookieInstruction {
                name: DEVICE_COOKIE.to_string(),
                value: "d1".to_string(),
                max_age: Some(DEVICE_COOKIE_MAX_AGE),
            }],
        );
        assert_eq!(
            rendered[0],
            "did=d1; Path=/; SameSite=Strict; Max-Age=9999999999"
        );
    }
}
