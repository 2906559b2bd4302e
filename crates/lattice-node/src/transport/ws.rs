//! WebSocket endpoints: the client namespace and the inter-node namespace.

use crate::node::NodeCtx;
use crate::peers::handle_peer_event;
use crate::request::{ClientRequest, ReplyChannel};
use lattice_core::protocol::{decode_event, encode_event, PeerEvent};
use lattice_core::{make_id, ClientEvent, RequestOrigin, ServiceType, SESSION_COOKIE, SESSION_ID_LEN};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, Uri};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the upgrade request told us about the client; every call made over
/// the socket inherits it.
#[derive(Clone)]
struct SocketEnv {
    sid: String,
    cookies: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    lang: Vec<String>,
    original_url: Option<String>,
}

/// `GET /socket` — end clients.
pub async fn client_upgrade(
    State(ctx): State<Arc<NodeCtx>>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookies = crate::transport::http::parse_cookies(&headers);
    let origin = headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let env = SocketEnv {
        sid: cookies.get(SESSION_COOKIE).cloned().unwrap_or_default(),
        lang: crate::transport::http::parse_lang(&headers),
        headers: crate::transport::http::header_map(&headers),
        original_url: Some(format!("{origin}{uri}")),
        cookies,
    };
    ws.on_upgrade(move |socket| client_socket(ctx, socket, env))
}

async fn client_socket(ctx: Arc<NodeCtx>, socket: WebSocket, env: SocketEnv) {
    let socket_id = make_id(SESSION_ID_LEN);
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
    ctx.sockets.register(&socket_id, tx.clone());
    ctx.observers.notify(
        "connection",
        &json!({ "socket_id": socket_id, "state": "open" }),
    );
    info!(socket = %socket_id, "client socket open");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let frame = match encode_event(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "client frame encode failed");
                        continue;
                    }
                };
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match decode_event::<ClientEvent>(&text) {
                        Ok(ClientEvent::Request { service, params, tid }) => {
                            tokio::spawn(handle_socket_request(
                                ctx.clone(),
                                tx.clone(),
                                env.clone(),
                                socket_id.clone(),
                                service,
                                params,
                                tid,
                            ));
                        }
                        Ok(other) => debug!(socket = %socket_id, event = ?other, "unexpected client event"),
                        Err(e) => warn!(socket = %socket_id, error = %e, "bad client frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket = %socket_id, error = %e, "client socket read error");
                        break;
                    }
                }
            }
        }
    }

    ctx.sockets.remove(&socket_id);
    ctx.observers.notify(
        "connection",
        &json!({ "socket_id": socket_id, "state": "closed" }),
    );
    info!(socket = %socket_id, "client socket closed");
}

/// One socket-born call: exactly one terminal event per tid, whatever
/// happens inside the pipeline.
async fn handle_socket_request(
    ctx: Arc<NodeCtx>,
    tx: mpsc::UnboundedSender<ClientEvent>,
    env: SocketEnv,
    socket_id: String,
    service: String,
    params: Value,
    tid: String,
) {
    ctx.observers.notify(
        "client_request",
        &json!({ "service": service, "origin": "ws" }),
    );
    let request = ClientRequest {
        ctx: ctx.clone(),
        session: ctx.sessions.session(&env.sid),
        origin: RequestOrigin::Ws,
        service_type: ServiceType::Json,
        service_name: service.clone(),
        lang: env.lang,
        cookies: env.cookies,
        headers: env.headers,
        original_url: env.original_url,
        base_url: None,
        params,
        certificate: None,
        remote_address: None,
        socket_id: Some(socket_id),
        tid: Some(tid.clone()),
        reply: ReplyChannel::Ws(tx.clone()),
    };

    let event = match crate::dispatch::invoke_service(&service, request).await {
        Ok(body) => ClientEvent::Response { tid, body },
        Err(body) => ClientEvent::Error { tid, body },
    };
    let _ = tx.send(event);
}

/// `GET /servers` — peers dialing in for a live link.
pub async fn peer_upgrade(State(ctx): State<Arc<NodeCtx>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| peer_socket(ctx, socket))
}

async fn peer_socket(ctx: Arc<NodeCtx>, socket: WebSocket) {
    let (mut write, mut read) = socket.split();

    // The first frame must be a valid handshake; anything else gets a
    // silent close, no diagnostics for the dialer.
    let (host, replica) = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match decode_event::<PeerEvent>(&text) {
                Ok(PeerEvent::Handshake { host, remote_host, passkey, replica, .. }) => {
                    // The dialer must know both who it is talking to and
                    // the shared secret.
                    let passkey_ok = matches!(
                        &ctx.config.gateway_passkey,
                        Some(expected) if *expected == passkey
                    );
                    if !passkey_ok || remote_host != ctx.config.host_name {
                        warn!(host = %host, "peer handshake refused");
                        return;
                    }
                    break (host, replica);
                }
                _ => {
                    debug!("non-handshake first frame, dropping peer socket");
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) => continue,
            _ => return,
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<PeerEvent>();
    ctx.peers.register_inbound(&host, tx.clone(), replica);
    ctx.observers
        .notify("server_connection", &json!({ "host": host }));

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let frame = match encode_event(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "peer frame encode failed");
                        continue;
                    }
                };
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match decode_event::<PeerEvent>(&text) {
                        Ok(event) => handle_peer_event(&ctx, &host, event, tx.clone()),
                        Err(e) => warn!(host = %host, error = %e, "bad peer frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(host = %host, error = %e, "peer socket read error");
                        break;
                    }
                }
            }
        }
    }

    // Pending calls against this link are left to their deadlines rather
    // than rejected here; a reconnect may still carry late progress.
    ctx.peers.remove_inbound(&host);
}
