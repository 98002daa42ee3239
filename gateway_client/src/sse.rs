//! SSE upstream transport.
//!
//! The remote announces where to POST with an `endpoint` event on its stream;
//! every later event carries one JSON-RPC message.

use crate::error::{ClientError, Result};
use crate::transport::{INBOUND_QUEUE_CAPACITY, RemoteConfig, RemoteConnection, RemoteTransport};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use gateway_common::Message;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseEventParser {
    current_event: Option<String>,
    data: String,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, raw_line: &str) -> Option<SseEvent> {
        let line = raw_line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if self.current_event.is_none() && self.data.is_empty() {
                return None;
            }

            let event = SseEvent {
                event_type: self.current_event.take(),
                data: std::mem::take(&mut self.data),
            };
            return Some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        if let Some(stripped) = line.strip_prefix("event:") {
            let value = stripped.trim_start();
            self.current_event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return None;
        }

        if let Some(stripped) = line.strip_prefix("data:") {
            let value = stripped.trim_start();
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value);
            return None;
        }

        None
    }
}

pub fn resolve_rpc_url(sse_url: &Url, endpoint: &str) -> Result<Url> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Custom(
            "Empty RPC endpoint announced".to_string(),
        ));
    }

    match Url::parse(trimmed) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            sse_url.join(trimmed).map_err(ClientError::from)
        }
        Err(err) => Err(ClientError::from(err)),
    }
}

pub(crate) fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Transport(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Transport(format!("invalid value for header {}: {}", name, e)))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Outbound half: POSTs each message to the announced endpoint.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    send_timeout: Duration,
}

impl SseTransport {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteTransport for SseTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.send_timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Transport(format!(
                        "POST to {} timed out after {:?}",
                        self.endpoint, self.send_timeout
                    ))
                } else {
                    ClientError::from(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "HTTP Error: {} - {}",
                status, text
            )));
        }
        Ok(())
    }
}

/// Open the event stream and wait for the endpoint announcement.
pub async fn connect(config: &RemoteConfig) -> Result<RemoteConnection> {
    let client = reqwest::Client::builder()
        .default_headers(header_map(&config.headers)?)
        .connect_timeout(config.connect_timeout)
        .build()?;

    info!(url = %config.url, "Connecting to remote SSE stream");
    let response = tokio::time::timeout(
        config.connect_timeout,
        client
            .get(config.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send(),
    )
    .await
    .map_err(|_| ClientError::Transport("timed out connecting to SSE stream".to_string()))??;

    if !response.status().is_success() {
        return Err(ClientError::Transport(format!(
            "SSE connection failed with status {}",
            response.status()
        )));
    }

    let (endpoint_tx, endpoint_rx) = oneshot::channel();
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    tokio::spawn(read_event_stream(response, config.url.clone(), endpoint_tx, inbound_tx));

    let endpoint = match tokio::time::timeout(config.connect_timeout, endpoint_rx).await {
        Ok(Ok(endpoint)) => endpoint,
        Ok(Err(_)) => {
            return Err(ClientError::Transport(
                "SSE stream closed before announcing an endpoint".to_string(),
            ));
        }
        Err(_) => {
            return Err(ClientError::Transport(
                "timed out waiting for SSE endpoint event".to_string(),
            ));
        }
    };
    info!(endpoint = %endpoint, "Remote SSE endpoint announced");

    Ok(RemoteConnection {
        transport: Arc::new(SseTransport {
            client,
            endpoint,
            send_timeout: config.send_timeout,
        }),
        inbound,
    })
}

async fn read_event_stream(
    response: reqwest::Response,
    base: Url,
    endpoint_tx: oneshot::Sender<Url>,
    inbound_tx: mpsc::Sender<Message>,
) {
    let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
    let mut lines = FramedRead::new(body, LinesCodec::new());
    let mut parser = SseEventParser::new();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Error in SSE stream: {}", e);
                break;
            }
        };
        let Some(event) = parser.feed_line(&line) else {
            continue;
        };

        match event.event_type.as_deref() {
            Some("endpoint") => match resolve_rpc_url(&base, &event.data) {
                Ok(url) => match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(url);
                    }
                    None => debug!(endpoint = %url, "Ignoring repeated endpoint event"),
                },
                Err(e) => warn!("Invalid endpoint event: {}", e),
            },
            None | Some("message") => match Message::decode(&event.data) {
                Ok(message) => {
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(frame = %e.frame, "Discarding undecodable SSE event: {}", e.reason),
            },
            Some(other) => debug!(event = other, "Ignoring SSE event"),
        }
    }
    info!("Remote SSE stream closed");
}
