//! The outbound live link: a WebSocket this node dials to a peer's
//! `/servers` endpoint and keeps open, reconnecting forever.

use crate::node::NodeCtx;
use crate::peers::{handle_peer_event, PeerRemote};
use futures_util::{SinkExt, StreamExt};
use lattice_core::protocol::{decode_event, encode_event, PeerEvent, SERVERS_WS_PATH};
use lattice_core::make_id;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

fn ws_url(host: &str) -> String {
    let base = host
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}{SERVERS_WS_PATH}")
}

/// Dial, handshake, pump frames both ways, reconnect on loss. Never returns.
pub async fn run_outbound_link(ctx: Arc<NodeCtx>, remote: Arc<PeerRemote>) {
    let url = ws_url(&remote.host);
    loop {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                debug!(url = %url, error = %e, "live link dial failed");
                tokio::time::sleep(ctx.config.keep_alive_retry).await;
                continue;
            }
        };
        let (mut write, mut read) = stream.split();

        // Handshake is always the first frame; the peer drops us silently
        // on a bad passkey or a misaddressed host.
        let handshake = PeerEvent::Handshake {
            host: ctx.config.host_name.clone(),
            remote_host: remote.host.clone(),
            passkey: remote.passkey.clone(),
            replica: remote.replica,
            change_channel: format!("dictChanged{}", make_id(8)),
        };
        let frame = match encode_event(&handshake) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "handshake encode failed");
                return;
            }
        };
        if write.send(Message::Text(frame)).await.is_err() {
            tokio::time::sleep(ctx.config.keep_alive_retry).await;
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PeerEvent>();
        remote.set_link(tx.clone());
        info!(host = %remote.host, "live link established");

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(event) = outbound else { break };
                    let frame = match encode_event(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "outbound frame encode failed");
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
                            Ok(event) => handle_peer_event(&ctx, &remote.host, event, tx.clone()),
                            Err(e) => warn!(host = %remote.host, error = %e, "bad peer frame"),
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(host = %remote.host, error = %e, "live link read error");
                            break;
                        }
                    }
                }
            }
        }

        remote.clear_link();
        warn!(host = %remote.host, "live link lost, reconnecting");
        tokio::time::sleep(ctx.config.keep_alive_retry).await;
    }
}
