//! End-to-end tests driving the client against an in-process service that
//! speaks the wire framing over a real WebSocket.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use ortc::{ChannelMessage, ClientOptions, OrtcClient, OrtcError};

type ServiceSocket = WebSocketStream<TcpStream>;

const APP: &str = "APP";
const TOK: &str = "TOK";

async fn service_endpoint() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServiceSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_text(socket: &mut ServiceSocket) -> String {
    loop {
        match within(socket.next()).await.expect("socket open").expect("readable frame") {
            Message::Text(text) => return text,
            _ => continue,
        }
    }
}

async fn send_text(socket: &mut ServiceSocket, text: &str) {
    socket.send(Message::Text(text.to_string())).await.unwrap();
}

/// Accepts one connection and walks it through open + validate, granting
/// `permissions` (wire-escaped JSON, e.g. `{\"c\":\"r\"}`). Returns the
/// socket and the validate command observed.
async fn handshake(listener: &TcpListener, permissions: &str) -> (ServiceSocket, String) {
    let mut socket = accept(listener).await;
    send_text(&mut socket, "o").await;
    let validate = next_text(&mut socket).await;
    send_text(&mut socket, &validated_frame(permissions)).await;
    (socket, validate)
}

fn validated_frame(permissions: &str) -> String {
    format!(r#"a["{{\"op\":\"ortc-validated\",\"up\":{permissions},\"set\":\"x\"}}"]"#)
}

fn subscribed_frame(channel: &str) -> String {
    format!(r#"a["{{\"op\":\"ortc-subscribed\",\"ch\":\"{channel}\"}}"]"#)
}

fn unsubscribed_frame(channel: &str) -> String {
    format!(r#"a["{{\"op\":\"ortc-unsubscribed\",\"ch\":\"{channel}\"}}"]"#)
}

fn received_frame(channel: &str, payload: &str) -> String {
    format!(r#"a["{{\"ch\":\"{channel}\",\"m\":\"{payload}\"}}"]"#)
}

fn error_frame(operation: &str, channel: &str, message: &str) -> String {
    format!(
        r#"a["{{\"op\":\"ortc-error\",\"ex\":{{\"operation\":\"{operation}\",\"channel\":\"{channel}\",\"message\":\"{message}\"}}}}"]"#
    )
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut).await.expect("test step timed out")
}

fn fast_options() -> ClientOptions {
    ClientOptions {
        reconnect_interval: Duration::from_millis(50),
        ..ClientOptions::default()
    }
}

#[tokio::test]
async fn validates_on_open_and_reports_connected() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "meta", &url, false, false);

    let (_socket, validate) = handshake(&listener, r#"{\"c\":\"r\"}"#).await;
    assert_eq!(validate, "\"validate;APP;TOK;;;meta\"");
    within(events.connected.next()).await.unwrap();

    assert_eq!(client.url().await.as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (_socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    client.connect(APP, TOK, "", &url, false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::AlreadyConnected));
}

#[tokio::test]
async fn subscribes_publishes_and_receives() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, r#"{\"c\":\"w\"}"#).await;
    within(events.connected.next()).await.unwrap();

    let mut channel_stream = client.subscribe("c", true);
    assert_eq!(next_text(&mut socket).await, "\"subscribe;APP;TOK;c;w\"");
    send_text(&mut socket, &subscribed_frame("c")).await;
    assert_eq!(within(events.subscribed.next()).await.unwrap(), "c");

    client.send("c", "hi");
    let frame = next_text(&mut socket).await;
    let body = frame.trim_matches('"');
    let fields: Vec<&str> = body.splitn(6, ';').collect();
    assert_eq!(&fields[..5], &["send", APP, TOK, "c", "w"]);
    let (identifier, chunk) = fields[5].split_at(fields[5].find('_').unwrap() + 1);
    assert_eq!(identifier.len(), 9); // 8-char id plus separator
    assert_eq!(chunk, "1-1_hi");

    // single-part push
    send_text(&mut socket, &received_frame("c", "plain")).await;
    let message = within(events.messages.next()).await.unwrap();
    assert_eq!(message, ChannelMessage { channel: "c".to_string(), payload: "plain".to_string() });
    assert_eq!(within(channel_stream.next()).await.unwrap().payload, "plain");

    // multi-part push, reassembled in part order
    send_text(&mut socket, &received_frame("c", "id1_1-2_hello ")).await;
    send_text(&mut socket, &received_frame("c", "id1_2-2_world")).await;
    let message = within(events.messages.next()).await.unwrap();
    assert_eq!(message.payload, "hello world");
    assert_eq!(within(channel_stream.next()).await.unwrap().payload, "hello world");
}

#[tokio::test]
async fn fragments_large_payloads() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, r#"{\"c\":\"w\"}"#).await;
    within(events.connected.next()).await.unwrap();

    // exactly at the boundary: one part
    client.send("c", &"X".repeat(800));
    let frame = next_text(&mut socket).await;
    let payload = frame.trim_matches('"').splitn(6, ';').nth(5).unwrap().to_string();
    let mut pieces = payload.splitn(3, '_');
    let first_id = pieces.next().unwrap().to_string();
    assert_eq!(first_id.len(), 8);
    assert_eq!(pieces.next().unwrap(), "1-1");
    assert_eq!(pieces.next().unwrap(), "X".repeat(800));

    // double the boundary: two parts sharing one id
    client.send("c", &"X".repeat(1600));
    let mut ids = Vec::new();
    for part in 1..=2 {
        let frame = next_text(&mut socket).await;
        let payload = frame.trim_matches('"').splitn(6, ';').nth(5).unwrap().to_string();
        let mut pieces = payload.splitn(3, '_');
        ids.push(pieces.next().unwrap().to_string());
        assert_eq!(pieces.next().unwrap(), format!("{part}-2"));
        assert_eq!(pieces.next().unwrap(), "X".repeat(800));
    }
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[0], first_id);
}

#[tokio::test]
async fn wildcard_permissions_gate_sends() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, r#"{\"yellow:*\":\"w\"}"#).await;
    within(events.connected.next()).await.unwrap();

    client.send("yellow:1", "hi");
    let frame = next_text(&mut socket).await;
    assert!(frame.starts_with("\"send;APP;TOK;yellow:1;w;"));

    client.send("blue:1", "hi");
    let err = within(events.exceptions.next()).await.unwrap();
    match err {
        OrtcError::DoesNotHavePermission(message) => {
            assert_eq!(message, "No permission found to send to the channel blue:1")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unsubscribe_clears_the_channel() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    let _stream = client.subscribe("c", false);
    assert_eq!(next_text(&mut socket).await, "\"subscribe;APP;TOK;c;\"");
    send_text(&mut socket, &subscribed_frame("c")).await;
    within(events.subscribed.next()).await.unwrap();

    client.unsubscribe("c");
    assert_eq!(next_text(&mut socket).await, "\"unsubscribe;APP;c\"");
    send_text(&mut socket, &unsubscribed_frame("c")).await;
    assert_eq!(within(events.unsubscribed.next()).await.unwrap(), "c");

    // the entry is gone now
    client.unsubscribe("c");
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::NotSubscribed(channel) if channel == "c"));
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_a_drop() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::with_options(fast_options());
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, r#"{\"c\":\"r\"}"#).await;
    within(events.connected.next()).await.unwrap();

    let _stream = client.subscribe("c", true);
    assert_eq!(next_text(&mut socket).await, "\"subscribe;APP;TOK;c;r\"");
    send_text(&mut socket, &subscribed_frame("c")).await;
    within(events.subscribed.next()).await.unwrap();

    // kill the service side; the client must come back on its own
    drop(socket);
    within(events.disconnected.next()).await.unwrap();
    within(events.reconnecting.next()).await.unwrap();

    let (mut socket, validate) = handshake(&listener, r#"{\"c\":\"r\"}"#).await;
    assert_eq!(validate, "\"validate;APP;TOK;;;\"");
    within(events.reconnected.next()).await.unwrap();

    // the subscription is re-issued without a user call
    assert_eq!(next_text(&mut socket).await, "\"subscribe;APP;TOK;c;r\"");
    send_text(&mut socket, &subscribed_frame("c")).await;
    assert_eq!(within(events.subscribed.next()).await.unwrap(), "c");
}

#[tokio::test]
async fn heartbeats_keep_the_connection_alive() {
    let (listener, url) = service_endpoint().await;
    let options = ClientOptions {
        heartbeat_timeout: Duration::from_millis(300),
        reconnect_interval: Duration::from_millis(50),
        ..ClientOptions::default()
    };
    let (client, mut events) = OrtcClient::with_options(options);
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    // regular heartbeats: no drop for well over the threshold
    for _ in 0..8 {
        send_text(&mut socket, "h").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(10), events.disconnected.next())
            .await
            .is_err(),
        "connection dropped despite heartbeats",
    );
}

#[tokio::test]
async fn heartbeat_silence_triggers_the_watchdog() {
    let (listener, url) = service_endpoint().await;
    let options = ClientOptions {
        heartbeat_timeout: Duration::from_millis(150),
        reconnect_interval: Duration::from_millis(100),
        // nobody serves the reconnect attempts; keep the dials short so the
        // disconnect below is handled promptly
        connection_timeout: Duration::from_millis(200),
        ..ClientOptions::default()
    };
    let (client, mut events) = OrtcClient::with_options(options);
    client.connect(APP, TOK, "", &url, false, false);
    let (_socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    // no frames at all: the watchdog closes the socket and the reconnect
    // loop takes over
    within(events.disconnected.next()).await.unwrap();
    within(events.reconnecting.next()).await.unwrap();

    client.disconnect();
    within(events.disconnected.next()).await.unwrap();
}

#[tokio::test]
async fn subscribe_maxsize_errors_force_a_disconnect() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (mut socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    let _stream = client.subscribe("c", true);
    assert_eq!(next_text(&mut socket).await, "\"subscribe;APP;TOK;c;\"");

    send_text(&mut socket, &error_frame("subscribe_maxsize", "c", "Channel is too big")).await;
    within(events.disconnected.next()).await.unwrap();
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::Server(message) if message == "Channel is too big"));

    // no reconnect follows a forced disconnect; a new send is simply
    // rejected as not connected
    client.send("c", "hi");
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::NotConnected(_)));
}

#[tokio::test]
async fn user_disconnect_returns_to_idle() {
    let (listener, url) = service_endpoint().await;
    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &url, false, false);
    let (_socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();

    client.disconnect();
    within(events.disconnected.next()).await.unwrap();

    client.send("c", "hi");
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::NotConnected(message) if message == "Not connected"));
}

#[tokio::test]
async fn connect_validation_is_reported_on_the_exception_stream() {
    let (client, mut events) = OrtcClient::new();

    client.connect(APP, TOK, "", "", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::EmptyField("URL")));
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::EmptyField("Cluster URL")));

    client.connect("", TOK, "", "http://x", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::EmptyField("Application key")));

    client.connect(APP, "", "", "http://x", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::EmptyField("Authentication key")));

    client.connect(APP, TOK, "", "not a url", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::InvalidCharacters("URL")));

    client.connect(APP, TOK, "", "not a url", true, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::InvalidCharacters("Cluster URL")));

    client.connect("bad key!", TOK, "", "http://x", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::InvalidCharacters("Application key")));

    client.connect(APP, "bad token!", "", "http://x", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::InvalidCharacters("Authentication token")));

    client.connect(APP, TOK, &"m".repeat(257), "http://x", false, false);
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::MaxLength("Connection metadata", 256)));

    client.send("c", "hi");
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::NotConnected(_)));

    client.disconnect();
    let err = within(events.exceptions.next()).await.unwrap();
    assert!(matches!(err, OrtcError::NotConnected(_)));
}

#[tokio::test]
async fn resolves_the_service_node_through_the_balancer() {
    let (listener, service_url) = service_endpoint().await;
    let mut balancer = mockito::Server::new_async().await;
    let mock = balancer
        .mock("GET", "/server/2.1")
        .match_query(mockito::Matcher::UrlEncoded("appkey".into(), APP.into()))
        .with_body(format!("var SOCKET_SERVER = \"{service_url}\";"))
        .create_async()
        .await;
    let cluster_url = format!("{}/server/2.1", balancer.url());

    let (client, mut events) = OrtcClient::new();
    client.connect(APP, TOK, "", &cluster_url, true, false);
    let (_socket, _) = handshake(&listener, "null").await;
    within(events.connected.next()).await.unwrap();
    mock.assert_async().await;

    // for clustered clients the reported URL stays the cluster entry point
    assert_eq!(client.url().await.as_deref(), Some(cluster_url.as_str()));
}
