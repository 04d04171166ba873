//! Transport abstraction for the duplex model session.
//!
//! The session logic only needs ordered frame send/receive; the WebSocket
//! details live here. Tests drive the session with a scripted transport.

use super::wire::{ClientMessage, ServerMessage};
use super::ModelError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Sending half of a connected transport.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ModelError>;
    async fn close(&mut self);
}

/// Receiving half of a connected transport. `recv` returning `None` means
/// the peer closed the stream.
#[async_trait]
pub trait TransportStream: Send {
    async fn recv(&mut self) -> Option<Result<ServerMessage, ModelError>>;
}

/// Factory that opens a fresh duplex channel.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), ModelError>;
}

// ==================== WebSocket implementation ====================

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connects to the speech-model WebSocket endpoint, authenticating with an
/// API key query parameter.
pub struct WsConnector {
    endpoint: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}

#[async_trait]
impl ModelConnector for WsConnector {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), ModelError> {
        let (ws, _response) = connect_async(self.url())
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((
            Box::new(WsTransportSink { sink }),
            Box::new(WsTransportStream { stream }),
        ))
    }
}

struct WsTransportSink {
    sink: WsSink,
}

#[async_trait]
impl TransportSink for WsTransportSink {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ModelError> {
        let text = serde_json::to_string(&msg).map_err(|e| ModelError::Transport(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsTransportStream {
    stream: WsStream,
}

#[async_trait]
impl TransportStream for WsTransportStream {
    async fn recv(&mut self) -> Option<Result<ServerMessage, ModelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(
                        serde_json::from_str(&text).map_err(|e| ModelError::Transport(e.to_string())),
                    );
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        serde_json::from_slice(&bytes)
                            .map_err(|e| ModelError::Transport(e.to_string())),
                    );
                }
                Ok(Message::Close(_)) => return None,
                // Ping/pong handled by tungstenite; frames we don't care
                // about are skipped.
                Ok(_) => continue,
                Err(e) => return Some(Err(ModelError::Transport(e.to_string()))),
            }
        }
    }
}
