//! Shared helpers for gateway integration tests.
//!
//! Each test runs its own in-process gateway on a dynamically assigned port,
//! backed by a small shell process (usually `cat`, which echoes every frame).

// Allow dead_code - these are test utilities, and rustc can't see usage across test crates
#![allow(dead_code)]

use futures::{StreamExt, TryStreamExt};
use gateway_bridge::{BridgeConfig, FanoutBridge, serve_bridge};
use gateway_client::sse::{SseEvent, SseEventParser};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A gateway serving on 127.0.0.1 with an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub bridge: Arc<FanoutBridge>,
    server: JoinHandle<gateway_bridge::Result<i32>>,
}

impl TestGateway {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Kill the process and return the code the server resolved with.
    pub async fn shutdown(self) -> i32 {
        self.bridge.shutdown();
        self.wait().await
    }

    /// Wait for the server to finish on its own.
    pub async fn wait(self) -> i32 {
        tokio::time::timeout(TEST_TIMEOUT, self.server)
            .await
            .expect("gateway did not stop in time")
            .expect("gateway task panicked")
            .expect("gateway returned an error")
    }
}

/// `cat` behind the default SSE transport.
pub fn cat_config() -> BridgeConfig {
    BridgeConfig {
        server_command: "cat".to_string(),
        health_endpoints: vec!["/healthz".to_string()],
        ..BridgeConfig::default()
    }
}

pub async fn spawn_gateway(config: BridgeConfig) -> TestGateway {
    gateway_bridge::logging::init_test_logging();
    let config = BridgeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    config.validate().expect("invalid test config");

    let bridge = FanoutBridge::start(&config).expect("failed to start bridge");
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    let served = bridge.clone();
    let server = tokio::spawn(async move { serve_bridge(listener, served, &config).await });

    TestGateway {
        addr,
        bridge,
        server,
    }
}

type LineStream = Pin<Box<dyn futures::Stream<Item = Result<String, tokio_util::codec::LinesCodecError>> + Send>>;

/// Reads events off one open SSE response.
pub struct SseStream {
    pub session_id: Option<String>,
    lines: LineStream,
    parser: SseEventParser,
}

impl SseStream {
    pub async fn open(client: &reqwest::Client, url: &str) -> SseStream {
        let response = client
            .get(url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .expect("SSE GET failed");
        assert!(
            response.status().is_success(),
            "SSE GET returned {}",
            response.status()
        );
        let session_id = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        SseStream {
            session_id,
            lines: Box::pin(FramedRead::new(body, LinesCodec::new())),
            parser: SseEventParser::new(),
        }
    }

    /// Next complete event, or `None` when the server closed the stream.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        let read = async {
            while let Some(line) = self.lines.next().await {
                let line = line.ok()?;
                if let Some(event) = self.parser.feed_line(&line) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(TEST_TIMEOUT, read)
            .await
            .expect("timed out waiting for SSE event")
    }

    /// Read the `endpoint` announcement that opens every session.
    pub async fn endpoint(&mut self) -> String {
        let event = self.next_event().await.expect("stream closed before endpoint");
        assert_eq!(event.event_type.as_deref(), Some("endpoint"));
        event.data
    }
}

/// Session id carried in an announced endpoint.
pub fn session_from_endpoint(endpoint: &str) -> String {
    endpoint
        .split_once("sessionId=")
        .map(|(_, id)| id.to_string())
        .expect("endpoint has no sessionId")
}

/// Poll `condition` until it holds or the test timeout elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
