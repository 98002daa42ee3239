//! WebSocket upstream transport: one text frame per JSON-RPC message.

use crate::error::{ClientError, Result};
use crate::transport::{INBOUND_QUEUE_CAPACITY, RemoteConfig, RemoteConnection, RemoteTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gateway_common::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Outbound half: frames are handed to a writer task that owns the socket sink.
pub struct WsTransport {
    outbound: mpsc::Sender<String>,
}

#[async_trait]
impl RemoteTransport for WsTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        self.outbound
            .send(message.encode())
            .await
            .map_err(|_| ClientError::UpstreamClosed)
    }
}

pub async fn connect(config: &RemoteConfig) -> Result<RemoteConnection> {
    let mut request = config.url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Transport(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Transport(format!("invalid value for header {}: {}", name, e)))?;
        request.headers_mut().append(name, value);
    }

    info!(url = %config.url, "Connecting to remote WebSocket");
    let (stream, response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| ClientError::Transport("timed out connecting to WebSocket".to_string()))??;
    debug!(status = %response.status(), "WebSocket handshake complete");

    let (mut write, mut read) = stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

    tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                error!("Failed to send WebSocket frame: {}", e);
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text.as_str().to_string(),
                Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket receive error: {}", e);
                    break;
                }
            };
            match Message::decode(&text) {
                Ok(message) => {
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(frame = %e.frame, "Discarding undecodable WebSocket frame: {}", e.reason),
            }
        }
        info!("Remote WebSocket closed");
    });

    Ok(RemoteConnection {
        transport: Arc::new(WsTransport { outbound }),
        inbound,
    })
}
