//! End-to-end tests for the relay server over real sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use zlayer_relay::{
    BodyEncoding, KeyStrategy, OriginBinding, PublicKey, RelayAgent, RelayClientConfig, RelayServer,
    RelayServerConfig, RequestEnvelope, SessionRegistry,
};

type Origin = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    async fn start(config: RelayServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(config);
        let registry = server.registry();
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            registry,
            shutdown: Some(tx),
        }
    }

    async fn start_default() -> Self {
        Self::start(RelayServerConfig {
            key_strategy: KeyStrategy::Sequential,
            ..Default::default()
        })
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn bind_relay(&self, key: &str) {
        self.registry
            .insert_binding(PublicKey::parse(key).unwrap(), OriginBinding::Relay);
    }

    /// Open a tunnel for `key` and wait until the registry serves it
    async fn connect_origin(&self, key: &str) -> Origin {
        let previous = self.registry.session(key).map(|s| s.id());
        let (mut ws, _) = connect_async(format!("ws://{}/ws/{key}", self.addr))
            .await
            .unwrap();
        ws.send(Message::Text(key.to_string().into())).await.unwrap();

        self.wait_for(|| {
            self.registry
                .session(key)
                .is_some_and(|s| Some(s.id()) != previous)
        })
        .await;
        ws
    }

    async fn wait_for(&self, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

/// Next request envelope sent to the origin, skipping control frames
async fn next_request(origin: &mut Origin) -> RequestEnvelope {
    loop {
        match origin.next().await.unwrap().unwrap() {
            Message::Text(text) => return RequestEnvelope::decode(text.as_str().as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait for the relay to close the tunnel
async fn expect_close(origin: &mut Origin) {
    loop {
        match origin.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn test_relay_round_trip() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("42");
    let mut origin = relay.connect_origin("42").await;

    let origin_task = tokio::spawn(async move {
        let request = next_request(&mut origin).await;
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/");
        assert_eq!(request.body, "");
        assert_eq!(request.body_encoding, BodyEncoding::Utf8);
        assert!(!request.headers.contains_key("host"));
        assert_eq!(request.headers["accept"], vec!["application/json".to_string()]);
        origin
            .send(Message::Text(
                format!(r#"{{"id":"{}","status":200,"body":{{"ok":true}}}}"#, request.id).into(),
            ))
            .await
            .unwrap();
        origin
    });

    let response = reqwest::Client::new()
        .get(relay.url("/api/42"))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"ok": true}));

    origin_task.await.unwrap();
}

#[tokio::test]
async fn test_relay_forwards_method_path_and_body() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("orders");
    let mut origin = relay.connect_origin("orders").await;

    let origin_task = tokio::spawn(async move {
        let request = next_request(&mut origin).await;
        origin
            .send(Message::Text(
                format!(
                    r#"{{"id":"{}","status":201,"headers":{{"x-origin":["tunnel"]}},"body":"created"}}"#,
                    request.id
                )
                .into(),
            ))
            .await
            .unwrap();
        (request, origin)
    });

    let client = reqwest::Client::new();
    let response = client
        .put(relay.url("/api/orders/items/3?force=1"))
        .header("x-custom", "yes")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["x-origin"], "tunnel");
    assert_eq!(response.text().await.unwrap(), "created");

    let (request, _origin) = origin_task.await.unwrap();
    assert_eq!(request.method, "PUT");
    assert_eq!(request.url, "/items/3?force=1");
    assert_eq!(request.body, "payload");
    assert_eq!(request.headers["x-custom"], vec!["yes".to_string()]);
}

#[tokio::test]
async fn test_origin_disconnect_mid_request_is_bad_gateway() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("7");
    let mut origin = relay.connect_origin("7").await;

    tokio::spawn(async move {
        let _ = next_request(&mut origin).await;
        let _ = origin.close(None).await;
    });

    let response = reqwest::get(relay.url("/api/7")).await.unwrap();
    assert_eq!(response.status(), 502);

    relay.wait_for(|| relay.registry.session("7").is_none()).await;
    let response = reqwest::get(relay.url("/api/7")).await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_new_connection_replaces_old() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("k");
    let mut first = relay.connect_origin("k").await;

    // Park a request on the first connection
    let url = relay.url("/api/k");
    let in_flight = tokio::spawn(async move { reqwest::get(url).await.unwrap().status() });
    let _ = next_request(&mut first).await;

    let mut second = relay.connect_origin("k").await;

    // The in-flight request fails fast and the old tunnel is closed
    assert_eq!(in_flight.await.unwrap(), 502);
    expect_close(&mut first).await;

    // The replaced connection's cleanup leaves the new session in place
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(relay.registry.session("k").is_some());

    let origin_task = tokio::spawn(async move {
        let request = next_request(&mut second).await;
        second
            .send(Message::Text(
                format!(r#"{{"id":"{}","status":200,"body":"second"}}"#, request.id).into(),
            ))
            .await
            .unwrap();
        second
    });

    let response = reqwest::get(relay.url("/api/k")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "second");
    origin_task.await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_gateway_timeout_and_drops_tunnel() {
    let relay = TestRelay::start(RelayServerConfig {
        request_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    relay.bind_relay("slow");
    let mut origin = relay.connect_origin("slow").await;

    let origin_task = tokio::spawn(async move {
        let _ = next_request(&mut origin).await;
        expect_close(&mut origin).await;
    });

    let response = reqwest::get(relay.url("/api/slow")).await.unwrap();
    assert_eq!(response.status(), 504);

    origin_task.await.unwrap();
    relay
        .wait_for(|| relay.registry.session("slow").is_none())
        .await;
    let response = reqwest::get(relay.url("/api/slow")).await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_handshake_mismatch_is_rejected() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("5");

    let (mut ws, _) = connect_async(format!("ws://{}/ws/5", relay.addr))
        .await
        .unwrap();
    ws.send(Message::Text("6".into())).await.unwrap();

    expect_close(&mut ws).await;
    assert!(relay.registry.session("5").is_none());
    assert!(relay.registry.session("6").is_none());
}

#[tokio::test]
async fn test_register_then_direct_fetch() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .mount(&origin)
        .await;

    let relay = TestRelay::start_default().await;
    let client = reqwest::Client::new();

    let registration: serde_json::Value = client
        .post(relay.url("/register"))
        .json(&serde_json::json!({ "local_api": origin.uri() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(registration["public_api"], "/api/1");

    let response = client.get(relay.url("/api/1/status")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "up");

    let response = client.get(relay.url("/api/999")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_agent_serves_local_api() {
    let local = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"greeting":"hi"}"#),
        )
        .mount(&local)
        .await;

    let relay = TestRelay::start_default().await;
    let client = reqwest::Client::new();

    let registration: serde_json::Value = client
        .post(relay.url("/register"))
        .json(&serde_json::json!({ "mode": "relay" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let key = registration["key"].as_str().unwrap().to_string();
    assert_eq!(registration["ws_url"], format!("/ws/{key}"));

    let agent = RelayAgent::new(RelayClientConfig::new(
        format!("ws://{}/ws/{key}", relay.addr),
        key.clone(),
        local.uri(),
    ))
    .unwrap();
    let agent_task = tokio::spawn(async move { agent.run().await });

    relay
        .wait_for(|| relay.registry.session(&key).is_some())
        .await;

    let response = client
        .get(relay.url(&format!("/api/{key}/hello")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"greeting": "hi"}));

    agent_task.abort();
}

#[tokio::test]
async fn test_shutdown_closes_tunnels() {
    let mut relay = TestRelay::start_default().await;
    relay.bind_relay("bye");
    let mut origin = relay.connect_origin("bye").await;

    relay.shutdown.take().unwrap().send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), expect_close(&mut origin))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_health_endpoints() {
    let relay = TestRelay::start_default().await;
    relay.bind_relay("h");
    let _origin = relay.connect_origin("h").await;

    let live: serde_json::Value = reqwest::get(relay.url("/health/live"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["status"], "ok");

    let ready: serde_json::Value = reqwest::get(relay.url("/health/ready"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["bindings"], 1);
    assert_eq!(ready["sessions"], 1);
    assert_eq!(ready["tunnels"][0]["key"], "h");
}
