//! End-to-end tests against a running gateway.

#![allow(clippy::panic, missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use stargate_ws::app_state::AppState;
use stargate_ws::pubsub::PubSub;
use stargate_ws::service::{build_schema, token_authenticator};
use stargate_ws::ws::SubscriptionServer;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PATH: &str = "/graphql";

struct Gateway {
    addr: SocketAddr,
    pubsub: PubSub,
}

async fn spawn_gateway(auth_token: Option<&str>) -> Gateway {
    let pubsub = PubSub::new();
    let mut server = SubscriptionServer::new(Arc::new(build_schema(&pubsub)));
    if let Some(token) = auth_token {
        server = server.with_authenticate(token_authenticator(token.to_string()));
    }
    let state = AppState {
        pubsub: pubsub.clone(),
        server: Arc::new(server),
    };

    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("cannot bind test listener");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("listener has no address");
    };
    let app = stargate_ws::router(state, PATH);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Gateway { addr, pubsub }
}

async fn connect(gateway: &Gateway) -> Socket {
    let Ok(mut request) = format!("ws://{}{PATH}", gateway.addr).into_client_request() else {
        panic!("bad websocket url");
    };
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));
    let Ok((socket, response)) = tokio_tungstenite::connect_async(request).await else {
        panic!("websocket handshake failed");
    };
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some("graphql-ws")
    );
    socket
}

async fn send(socket: &mut Socket, message: Value) {
    if socket.send(Message::text(message.to_string())).await.is_err() {
        panic!("websocket send failed");
    }
}

enum Received {
    Json(Value),
    Closed(Option<u16>),
}

async fn receive(socket: &mut Socket) -> Received {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), socket.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                let Ok(value) = serde_json::from_str(text.as_str()) else {
                    panic!("server sent invalid JSON: {text}");
                };
                return Received::Json(value);
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                return Received::Closed(frame.map(|f| u16::from(f.code)));
            }
            Ok(Some(Ok(_))) => {}
            Ok(None | Some(Err(_))) => return Received::Closed(None),
            Err(_) => panic!("no message from server within timeout"),
        }
    }
}

async fn expect_json(socket: &mut Socket) -> Value {
    match receive(socket).await {
        Received::Json(value) => value,
        Received::Closed(code) => panic!("socket closed unexpectedly ({code:?})"),
    }
}

async fn init(socket: &mut Socket, payload: Option<Value>) -> Value {
    let mut message = json!({"type": "connection_init"});
    if let (Some(payload), Some(object)) = (payload, message.as_object_mut()) {
        object.insert("payload".to_string(), payload);
    }
    send(socket, message).await;
    expect_json(socket).await
}

async fn wait_for_subscribers(pubsub: &PubSub, expected: usize) {
    for _ in 0..200 {
        if pubsub.subscriber_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} subscribers, found {}",
        pubsub.subscriber_count()
    );
}

#[tokio::test]
async fn health_endpoint_responds() {
    let gateway = spawn_gateway(None).await;
    let Ok(response) = reqwest::get(format!("http://{}/health", gateway.addr)).await else {
        panic!("health request failed");
    };
    assert!(response.status().is_success());
    let Ok(body) = response.json::<Value>().await else {
        panic!("health body is not JSON");
    };
    assert_eq!(body.get("status"), Some(&json!("healthy")));
}

#[tokio::test]
async fn http_publish_flows_to_subscription_until_stop() {
    let gateway = spawn_gateway(None).await;
    let mut socket = connect(&gateway).await;
    assert_eq!(init(&mut socket, None).await, json!({"type": "connection_ack"}));

    send(
        &mut socket,
        json!({
            "type": "start",
            "id": "a",
            "payload": {"query": "subscription { postAdded { author } }"}
        }),
    )
    .await;
    wait_for_subscribers(&gateway.pubsub, 1).await;

    let client = reqwest::Client::new();
    let Ok(response) = client
        .post(format!("http://{}/api/v1/topics/POST_ADDED", gateway.addr))
        .json(&json!({"postAdded": {"author": "Jack", "comment": "first"}}))
        .send()
        .await
    else {
        panic!("publish request failed");
    };
    assert_eq!(response.status().as_u16(), 202);

    assert_eq!(
        expect_json(&mut socket).await,
        json!({"type": "data", "id": "a", "payload": {"data": {"postAdded": {"author": "Jack"}}}})
    );

    send(&mut socket, json!({"type": "stop", "id": "a"})).await;
    assert_eq!(
        expect_json(&mut socket).await,
        json!({"type": "complete", "id": "a"})
    );
    wait_for_subscribers(&gateway.pubsub, 0).await;
}

#[tokio::test]
async fn server_side_ticker_completes_on_its_own() {
    let gateway = spawn_gateway(None).await;
    let mut socket = connect(&gateway).await;
    init(&mut socket, None).await;

    send(
        &mut socket,
        json!({
            "type": "start",
            "id": "t",
            "payload": {
                "query": "subscription Ticks($n: Int) { tick(intervalMs: 10, count: $n) { count } }",
                "variables": {"n": 2}
            }
        }),
    )
    .await;

    for expected in 1..=2 {
        assert_eq!(
            expect_json(&mut socket).await,
            json!({"type": "data", "id": "t", "payload": {"data": {"tick": {"count": expected}}}})
        );
    }
    assert_eq!(
        expect_json(&mut socket).await,
        json!({"type": "complete", "id": "t"})
    );
}

#[tokio::test]
async fn terminate_releases_subscriptions_and_closes() {
    let gateway = spawn_gateway(None).await;
    let mut socket = connect(&gateway).await;
    init(&mut socket, None).await;

    for id in ["a", "b"] {
        send(
            &mut socket,
            json!({
                "type": "start",
                "id": id,
                "payload": {"query": "subscription { postAdded { author } }"}
            }),
        )
        .await;
    }
    wait_for_subscribers(&gateway.pubsub, 2).await;

    send(&mut socket, json!({"type": "connection_terminate"})).await;
    let Received::Closed(code) = receive(&mut socket).await else {
        panic!("expected the server to close the socket");
    };
    assert_eq!(code, Some(1000));
    assert_eq!(gateway.pubsub.subscriber_count(), 0);
}

#[tokio::test]
async fn client_disconnect_releases_subscriptions() {
    let gateway = spawn_gateway(None).await;
    let mut socket = connect(&gateway).await;
    init(&mut socket, None).await;
    send(
        &mut socket,
        json!({
            "type": "start",
            "id": "a",
            "payload": {"query": "subscription { postAdded { author } }"}
        }),
    )
    .await;
    wait_for_subscribers(&gateway.pubsub, 1).await;

    drop(socket);
    wait_for_subscribers(&gateway.pubsub, 0).await;
}

#[tokio::test]
async fn rejected_credentials_close_the_connection() {
    let gateway = spawn_gateway(Some("secret")).await;

    let mut socket = connect(&gateway).await;
    let reply = init(&mut socket, Some(json!({"authToken": "wrong"}))).await;
    assert_eq!(
        reply,
        json!({"type": "connection_error", "payload": {"message": "Invalid auth credentials."}})
    );
    let Received::Closed(code) = receive(&mut socket).await else {
        panic!("expected the server to close the socket");
    };
    assert_eq!(code, Some(1003));

    let mut socket = connect(&gateway).await;
    let reply = init(&mut socket, Some(json!({"authToken": "secret"}))).await;
    assert_eq!(reply, json!({"type": "connection_ack"}));
}

#[tokio::test]
async fn malformed_frame_is_a_protocol_violation() {
    let gateway = spawn_gateway(None).await;
    let mut socket = connect(&gateway).await;
    init(&mut socket, None).await;

    if socket.send(Message::text("{not json")).await.is_err() {
        panic!("websocket send failed");
    }
    let reply = expect_json(&mut socket).await;
    assert_eq!(reply.get("type"), Some(&json!("connection_error")));
    let Received::Closed(code) = receive(&mut socket).await else {
        panic!("expected the server to close the socket");
    };
    assert_eq!(code, Some(1003));
}
