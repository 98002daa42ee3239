//! Relay behavior between a local stdio peer and an in-memory remote.

use gateway_client::relay::{BOOTSTRAP_REQUEST_ID, RelayConfig, run_relay};
use gateway_client::transport::{MemoryPeer, RemoteConfig, RemoteKind, memory_connection};
use gateway_client::{ClientError, Result};
use gateway_common::{ErrorObject, Message, RequestId, Response};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use url::Url;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    local_in: DuplexStream,
    local_out: Lines<BufReader<DuplexStream>>,
    peer: MemoryPeer,
    relay: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(bootstrap: bool, request_timeout: Duration) -> Self {
        let remote = RemoteConfig::new(
            Url::parse("http://127.0.0.1:1/sse").unwrap(),
            RemoteKind::Sse,
        );
        let config = RelayConfig {
            remote,
            request_timeout,
            bootstrap,
        };
        let (connection, peer) = memory_connection(64);
        let (local_in, relay_in) = tokio::io::duplex(64 * 1024);
        let (relay_out, local_out) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move { run_relay(&config, connection, relay_in, relay_out).await });
        Harness {
            local_in,
            local_out: BufReader::new(local_out).lines(),
            peer,
            relay,
        }
    }

    async fn send_local(&mut self, line: &str) {
        self.local_in.write_all(line.as_bytes()).await.unwrap();
        self.local_in.write_all(b"\n").await.unwrap();
    }

    async fn read_local(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.local_out.next_line())
            .await
            .expect("timed out waiting for local output")
            .unwrap()
            .expect("local output closed")
    }

    async fn read_local_json(&mut self) -> Value {
        serde_json::from_str(&self.read_local().await).unwrap()
    }

    async fn next_upstream(&mut self) -> Message {
        tokio::time::timeout(STEP_TIMEOUT, self.peer.from_relay.recv())
            .await
            .expect("timed out waiting for upstream message")
            .expect("relay dropped its transport")
    }

    async fn reply(&self, message: Message) {
        self.peer.to_relay.send(message).await.unwrap();
    }

    /// Close local input and return how the relay ended.
    async fn finish(self) -> Result<()> {
        drop(self.local_in);
        tokio::time::timeout(STEP_TIMEOUT, self.relay)
            .await
            .expect("relay did not stop")
            .expect("relay panicked")
    }
}

#[tokio::test]
async fn test_response_reaches_local_peer_verbatim() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).await;
    let forwarded = h.next_upstream().await;
    assert_eq!(forwarded, Message::request(7, "tools/list", None));

    h.reply(Response::success(RequestId::from(7), json!({"ok": true})).into())
        .await;
    assert_eq!(
        h.read_local().await,
        r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#
    );

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    for id in ["x", "y", "z"] {
        h.send_local(&format!(r#"{{"jsonrpc":"2.0","id":"{}","method":"work"}}"#, id))
            .await;
    }
    for _ in 0..3 {
        h.next_upstream().await;
    }

    // Remote answers in reverse order
    for id in ["z", "y", "x"] {
        h.reply(Response::success(RequestId::from(id), json!({ "for": id })).into())
            .await;
    }
    for id in ["z", "y", "x"] {
        let response = h.read_local_json().await;
        assert_eq!(response["id"], id);
        assert_eq!(response["result"]["for"], id);
    }

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_remote_order_is_preserved_for_local_peer() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#).await;
    h.next_upstream().await;

    h.reply(Response::success(RequestId::from(1), json!("done")).into())
        .await;
    h.reply(Message::notification("notifications/tools/list_changed", None))
        .await;

    let first = h.read_local_json().await;
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"], "done");
    let second = h.read_local_json().await;
    assert_eq!(second["method"], "notifications/tools/list_changed");

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_duplicate_id_gets_invalid_request_error() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local(r#"{"jsonrpc":"2.0","id":1,"method":"first"}"#).await;
    h.next_upstream().await;
    h.send_local(r#"{"jsonrpc":"2.0","id":1,"method":"second"}"#).await;

    let rejection = h.read_local_json().await;
    assert_eq!(rejection["id"], 1);
    assert_eq!(rejection["error"]["code"], ErrorObject::INVALID_REQUEST);

    // The original request still completes normally
    h.reply(Response::success(RequestId::from(1), json!("done")).into())
        .await;
    let response = h.read_local_json().await;
    assert_eq!(response["result"], "done");

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let mut h = Harness::start(false, Duration::from_millis(200));

    h.send_local(r#"{"jsonrpc":"2.0","id":"slow","method":"work"}"#).await;
    h.next_upstream().await;

    let response = h.read_local_json().await;
    assert_eq!(response["id"], "slow");
    assert_eq!(response["error"]["code"], ErrorObject::REQUEST_TIMEOUT);

    // A late answer is dropped, and the id can be reused
    h.reply(Response::success(RequestId::from("slow"), json!("late")).into())
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.send_local(r#"{"jsonrpc":"2.0","id":"slow","method":"again"}"#).await;
    let again = h.next_upstream().await;
    assert_eq!(again.method(), Some("again"));
    h.reply(Response::success(RequestId::from("slow"), json!("fresh")).into())
        .await;
    let response = h.read_local_json().await;
    assert_eq!(response["result"], "fresh");

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_notifications_pass_through_both_ways() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":3}}"#)
        .await;
    let upstream = h.next_upstream().await;
    assert_eq!(upstream.method(), Some("notifications/cancelled"));
    assert!(upstream.id().is_none());

    h.reply(Message::notification(
        "notifications/progress",
        Some(json!({"progress": 50})),
    ))
    .await;
    let local = h.read_local_json().await;
    assert_eq!(local["method"], "notifications/progress");
    assert_eq!(local["params"]["progress"], 50);

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_undecodable_local_line_is_skipped() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local("this is not json").await;
    h.send_local(r#"{"jsonrpc":"2.0","id":2,"method":"after"}"#).await;
    assert_eq!(h.next_upstream().await.method(), Some("after"));

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_bootstrap_answers_local_initialize() {
    let mut h = Harness::start(true, Duration::from_secs(30));

    // The relay initializes the remote on its own
    let Message::Request(init) = h.next_upstream().await else {
        panic!("expected the bootstrap initialize request");
    };
    assert_eq!(init.method, "initialize");
    assert_eq!(init.id, RequestId::from(BOOTSTRAP_REQUEST_ID));
    let server_info = json!({"protocolVersion": "2024-11-05", "serverInfo": {"name": "remote"}});
    h.reply(Response::success(init.id, server_info.clone()).into())
        .await;
    assert_eq!(
        h.next_upstream().await.method(),
        Some("notifications/initialized")
    );

    // The local peer's handshake never reaches the remote
    h.send_local(r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{}}"#).await;
    let response = h.read_local_json().await;
    assert_eq!(response["id"], 0);
    assert_eq!(response["result"], server_info);

    h.send_local(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
    h.send_local(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await;
    assert_eq!(h.next_upstream().await.method(), Some("tools/list"));

    assert!(h.finish().await.is_ok());
}

#[tokio::test]
async fn test_rejected_bootstrap_is_an_error() {
    let mut h = Harness::start(true, Duration::from_secs(30));

    let Message::Request(init) = h.next_upstream().await else {
        panic!("expected the bootstrap initialize request");
    };
    h.reply(Response::failure(Some(init.id), ErrorObject::new(-32602, "unsupported version")).into())
        .await;

    let outcome = tokio::time::timeout(STEP_TIMEOUT, h.relay).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(ClientError::Handshake(_))));
}

#[tokio::test]
async fn test_upstream_close_fails_outstanding_and_errors() {
    let mut h = Harness::start(false, Duration::from_secs(30));

    h.send_local(r#"{"jsonrpc":"2.0","id":9,"method":"pending"}"#).await;
    h.next_upstream().await;

    // Remote goes away with the request still open
    let Harness {
        local_in,
        mut local_out,
        peer,
        relay,
    } = h;
    drop(peer);

    let outcome = tokio::time::timeout(STEP_TIMEOUT, relay).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(ClientError::UpstreamClosed)));

    let line = tokio::time::timeout(STEP_TIMEOUT, local_out.next_line())
        .await
        .unwrap()
        .unwrap()
        .expect("outstanding request should be answered");
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], ErrorObject::INTERNAL_ERROR);
    drop(local_in);
}
