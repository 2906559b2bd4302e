//! End-to-end mesh behavior over real sockets: two nodes, dictionary
//! replication, forwarding, liveness, and the client protocol.

use futures_util::{SinkExt, StreamExt};
use lattice_client::{CallReply, ConnectConfig, LatticeClient};
use lattice_core::{ServiceState, SERVER_REQUEST_HEADER};
use lattice_node::config::ServerEntrySection;
use lattice_node::{Node, NodeConfig, ServiceDefinition};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind probe")
        .local_addr()
        .expect("local addr")
        .port()
}

fn base_config(port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.port = port;
    config.host_name = format!("http://127.0.0.1:{port}");
    config
}

fn add_service() -> ServiceDefinition {
    ServiceDefinition {
        name: Some("add".into()),
        public: true,
        get: Some("/math/add".into()),
        handler: Some(Arc::new(|req| {
            Box::pin(async move {
                let a = req
                    .param("a")
                    .and_then(|v| v.as_str().map(str::to_string).or(v.as_i64().map(|n| n.to_string())))
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                let b = req
                    .param("b")
                    .and_then(|v| v.as_str().map(str::to_string).or(v.as_i64().map(|n| n.to_string())))
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                Ok(json!({ "sum": a + b }))
            })
        })),
        ..Default::default()
    }
}

fn start_node(node: Node) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _ = node.run().await;
    })
}

async fn wait_ready(port: u16) {
    let url = format!("http://127.0.0.1:{port}/api/server/ping");
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(response) = client
            .get(&url)
            .header(SERVER_REQUEST_HEADER, "true")
            .send()
            .await
        {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node on port {port} never became ready");
}

async fn wait_for_service(port: u16, name: &str) {
    let url = format!("http://127.0.0.1:{port}/api");
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(response) = client
            .get(&url)
            .header(SERVER_REQUEST_HEADER, "true")
            .send()
            .await
        {
            if let Ok(body) = response.json::<Value>().await {
                if body["dict"].get(name).is_some() {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("service {name} never appeared on port {port}");
}

#[tokio::test]
async fn http_call_resolves_locally_with_cookies() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service("math", add_service()).unwrap();
    start_node(node);
    wait_ready(port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/math/add?a=2&b=3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let cookies: Vec<String> = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("sid=") && c.contains("SameSite=Strict")));
    assert!(cookies.iter().any(|c| c.starts_with("did=") && c.contains("Max-Age=9999999999")));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["sum"], 5);
}

#[tokio::test]
async fn replica_forwards_to_owner_over_http() {
    let owner_port = free_port();
    let mut owner_config = base_config(owner_port);
    owner_config.gateway_passkey = Some("S".into());
    let owner = Node::new(owner_config).unwrap();
    owner.register_service("math", add_service()).unwrap();
    start_node(owner);
    wait_ready(owner_port).await;

    let replica_port = free_port();
    let mut replica_config = base_config(replica_port);
    replica_config.servers = vec![ServerEntrySection {
        host: format!("http://127.0.0.1:{owner_port}"),
        passkey: "S".into(),
        live: false,
        replica: true,
        config_name: None,
    }];
    start_node(Node::new(replica_config).unwrap());
    wait_ready(replica_port).await;
    wait_for_service(replica_port, "math.add").await;

    // The replica serves the owner's route by forwarding the call.
    let body: Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{replica_port}/math/add?a=4&b=6"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["sum"], 10);
}

#[tokio::test]
async fn replica_forwards_over_live_link() {
    let owner_port = free_port();
    let mut owner_config = base_config(owner_port);
    owner_config.gateway_passkey = Some("S".into());
    let owner = Node::new(owner_config).unwrap();
    owner.register_service("math", add_service()).unwrap();
    start_node(owner);
    wait_ready(owner_port).await;

    let replica_port = free_port();
    let mut replica_config = base_config(replica_port);
    replica_config.servers = vec![ServerEntrySection {
        host: format!("http://127.0.0.1:{owner_port}"),
        passkey: "S".into(),
        live: true,
        replica: true,
        config_name: None,
    }];
    start_node(Node::new(replica_config).unwrap());
    wait_ready(replica_port).await;
    wait_for_service(replica_port, "math.add").await;

    let body: Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{replica_port}/math/add?a=1&b=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["sum"], 3);
}

#[tokio::test]
async fn unreachable_owner_soft_disables_and_fails_fast() {
    let owner_port = free_port();
    let mut owner_config = base_config(owner_port);
    owner_config.gateway_passkey = Some("S".into());
    let owner = Node::new(owner_config).unwrap();
    owner.register_service("math", add_service()).unwrap();
    let owner_handle = start_node(owner);
    wait_ready(owner_port).await;

    let replica_port = free_port();
    let mut replica_config = base_config(replica_port);
    replica_config.keep_alive_interval = Duration::from_millis(100);
    replica_config.keep_alive_retry = Duration::from_millis(50);
    replica_config.keep_alive_max_retries = 1;
    replica_config.servers = vec![ServerEntrySection {
        host: format!("http://127.0.0.1:{owner_port}"),
        passkey: "S".into(),
        live: false,
        replica: true,
        config_name: None,
    }];
    start_node(Node::new(replica_config).unwrap());
    wait_ready(replica_port).await;
    wait_for_service(replica_port, "math.add").await;

    // Give the probe loop a chance to see the owner alive, then kill it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    owner_handle.abort();

    // Early calls may still hit the dead transport (plain 504); once the
    // probe retries are exhausted the service is soft-disabled and the call
    // fails fast with the disconnect message instead.
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{replica_port}/math/add?a=1&b=1");
    let mut last_body = Value::Null;
    for _ in 0..100 {
        let response = client.get(&url).send().await.unwrap();
        if response.status().as_u16() == 504 {
            last_body = response.json().await.unwrap();
            if last_body["message"]
                .as_str()
                .unwrap_or("")
                .contains("disconnected")
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("expected a fast 504 with the disconnect message, last body: {last_body}");
}

#[tokio::test]
async fn keep_alive_stops_probing_after_retries_are_exhausted() {
    // A peer that accepts connections and hangs up immediately: every ping
    // fails, and we can count exactly how many arrive.
    let dead_port = free_port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", dead_port))
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let port = free_port();
    let mut config = base_config(port);
    config.keep_alive_interval = Duration::from_millis(100);
    config.keep_alive_retry = Duration::from_millis(50);
    config.keep_alive_max_retries = 2;
    config.servers = vec![ServerEntrySection {
        host: format!("http://127.0.0.1:{dead_port}"),
        passkey: "S".into(),
        live: false,
        replica: false,
        config_name: None,
    }];
    start_node(Node::new(config).unwrap());
    wait_ready(port).await;

    // One announce plus at most two ping attempts, then nothing: the
    // keep-alive loop exits once its retries are spent.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let settled = hits.load(Ordering::SeqCst);
    assert!(settled <= 3, "too many connection attempts: {settled}");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hits.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn stateless_service_issues_no_cookies() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("metrics".into()),
            public: true,
            service_state: Some(ServiceState::Stateless),
            get: Some("/metrics".into()),
            handler: Some(Arc::new(|_req| Box::pin(async { Ok(json!({"up": true})) }))),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .next()
        .is_none());
}

#[tokio::test]
async fn device_id_lands_in_the_session() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("whoami".into()),
            public: true,
            get: Some("/whoami".into()),
            handler: Some(Arc::new(|req| {
                Box::pin(async move { Ok(json!({ "did": req.session.get("did") })) })
            })),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;
    let url = format!("http://127.0.0.1:{port}/whoami");

    // A returning device: the cookie value is visible to handlers.
    let body: Value = reqwest::Client::new()
        .get(&url)
        .header(reqwest::header::COOKIE, "sid=s-1; did=dev-42")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["did"], "dev-42");

    // A fresh browser: the generated id is issued and stored in one step.
    let response = reqwest::Client::new().get(&url).send().await.unwrap();
    let issued = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|c| c.strip_prefix("did=").and_then(|rest| rest.split(';').next()))
        .map(str::to_string)
        .expect("did cookie issued");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["did"], issued.as_str());
}

#[tokio::test]
async fn peer_handshake_rejects_misaddressed_host() {
    let port = free_port();
    let mut config = base_config(port);
    config.gateway_passkey = Some("S".into());
    start_node(Node::new(config).unwrap());
    wait_ready(port).await;

    let url = format!("ws://127.0.0.1:{port}/servers");
    let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let handshake = json!({
        "event": "handshake",
        "host": "http://127.0.0.1:1",
        "remote_host": "http://somewhere.else",
        "passkey": "S",
        "replica": false,
        "change_channel": "dictChangedTest",
    });
    stream
        .send(Message::Text(handshake.to_string()))
        .await
        .unwrap();

    // Right passkey, wrong addressee: the socket drops without a reply.
    match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => {}
        other => panic!("expected the peer socket to drop, got {other:?}"),
    }
}

#[tokio::test]
async fn socket_calls_carry_the_upgrade_environment() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("env".into()),
            public: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    Ok(json!({
                        "lang": req.lang,
                        "url": req.original_url,
                        "agent": req.headers.get("user-agent"),
                    }))
                })
            })),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;

    let mut upgrade = format!("ws://127.0.0.1:{port}/socket")
        .into_client_request()
        .unwrap();
    upgrade
        .headers_mut()
        .insert("accept-language", "fr,en;q=0.8".parse().unwrap());
    upgrade
        .headers_mut()
        .insert("user-agent", "mesh-test".parse().unwrap());
    let (mut stream, _) = tokio_tungstenite::connect_async(upgrade).await.unwrap();
    stream
        .send(Message::Text(
            json!({"event": "request", "service": "env", "params": {}, "tid": "t-env"})
                .to_string(),
        ))
        .await
        .unwrap();

    let reply = loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
        {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["event"] == "response" {
                    break value;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("socket closed early: {other:?}"),
        }
    };
    assert_eq!(reply["tid"], "t-env");
    assert_eq!(reply["body"]["lang"][0], "fr");
    assert_eq!(reply["body"]["agent"], "mesh-test");
    assert!(reply["body"]["url"].as_str().unwrap().ends_with("/socket"));
}

#[tokio::test]
async fn socket_request_gets_exactly_one_terminal_event() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("echo".into()),
            public: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move { Ok(req.params.clone()) })
            })),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;

    let client = LatticeClient::connect(
        &format!("http://127.0.0.1:{port}"),
        ConnectConfig::default(),
    )
    .await
    .unwrap();

    let reply = client.request("echo", json!({"msg": "hi"})).await.unwrap();
    assert_eq!(reply, CallReply::Resolved(json!({"msg": "hi"})));

    // An unknown service rejects, it never hangs.
    match client.request("nope", json!({})).await.unwrap() {
        CallReply::Rejected(payload) => assert_eq!(payload.status, 404),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn progress_events_arrive_before_resolution() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("steps".into()),
            public: true,
            handler: Some(Arc::new(|req| {
                Box::pin(async move {
                    req.will_resolve(json!({"step": 1}));
                    req.will_resolve(json!({"step": 2}));
                    Ok(json!("done"))
                })
            })),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;

    let client = LatticeClient::connect(
        &format!("http://127.0.0.1:{port}"),
        ConnectConfig::default(),
    )
    .await
    .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let reply = client
        .request_with_progress(
            "steps",
            json!({}),
            Some(Arc::new(move |body| {
                sink.lock().unwrap().push(body);
            })),
        )
        .await
        .unwrap();
    assert_eq!(reply, CallReply::Resolved(json!("done")));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["step"], 1);
}

#[tokio::test]
async fn browser_dictionary_hides_private_services() {
    let port = free_port();
    let node = Node::new(base_config(port)).unwrap();
    node.register_service("math", add_service()).unwrap();
    node.register_service(
        "",
        ServiceDefinition {
            name: Some("internal".into()),
            public: false,
            handler: Some(Arc::new(|_req| Box::pin(async { Ok(Value::Null) }))),
            ..Default::default()
        },
    )
    .unwrap();
    start_node(node);
    wait_ready(port).await;

    // Browser view: public services only, no peer metadata.
    let browser: Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/api"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(browser["dict"].get("math.add").is_some());
    assert!(browser["dict"].get("internal").is_none());
    assert!(browser["dict"].get("server.remoteRequest").is_none());
    assert!(browser.get("remote_servers").map(Value::is_null).unwrap_or(true));

    // Server view: private services included.
    let server: Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/api"))
        .header(SERVER_REQUEST_HEADER, "true")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(server["dict"].get("internal").is_some());
    assert!(server["pid"].is_number());
}
