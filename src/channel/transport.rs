//! Transport abstraction for the reconnecting channel.
//!
//! A [`Connector`] opens one [`Connection`] per attempt; the channel driver
//! owns it until it closes. Frames are JSON values carried as text frames.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
  #[error("connection failed: {0}")]
  ConnectionFailed(String),

  #[error("send failed: {0}")]
  Send(String),

  #[error("receive failed: {0}")]
  Receive(String),

  #[error("serialization error: {0}")]
  Serialization(String),
}

/// Something read from an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
  Message(Value),
  /// The peer closed the connection. `None` when no close frame was sent.
  Closed { code: Option<u16> },
}

/// One open connection.
pub trait Connection: Send {
  fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<(), ChannelError>>;

  /// Wait for the next frame. Must be cancel-safe.
  fn recv(&mut self) -> BoxFuture<'_, Result<Incoming, ChannelError>>;

  fn close(&mut self, code: u16) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// Opens connections to an endpoint.
pub trait Connector: Send + Sync {
  fn connect<'a>(
    &'a self,
    endpoint: &'a str,
  ) -> BoxFuture<'a, Result<Box<dyn Connection>, ChannelError>>;
}

/// Connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
  fn connect<'a>(
    &'a self,
    endpoint: &'a str,
  ) -> BoxFuture<'a, Result<Box<dyn Connection>, ChannelError>> {
    Box::pin(async move {
      let (ws, _) = tokio_tungstenite::connect_async(endpoint)
        .await
        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
      debug!(endpoint, "WebSocket connected");
      Ok(Box::new(WebSocketConnection { ws }) as Box<dyn Connection>)
    })
  }
}

struct WebSocketConnection {
  ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WebSocketConnection {
  fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<(), ChannelError>> {
    Box::pin(async move {
      let text =
        serde_json::to_string(&frame).map_err(|e| ChannelError::Serialization(e.to_string()))?;
      self
        .ws
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ChannelError::Send(e.to_string()))
    })
  }

  fn recv(&mut self) -> BoxFuture<'_, Result<Incoming, ChannelError>> {
    Box::pin(async move {
      loop {
        match self.ws.next().await {
          Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => return Ok(Incoming::Message(value)),
            Err(e) => {
              warn!(error = %e, "Dropping non-JSON text frame");
            }
          },
          Some(Ok(Message::Close(frame))) => {
            return Ok(Incoming::Closed {
              code: frame.map(|f| u16::from(f.code)),
            });
          }
          // Protocol-level ping/pong is answered by tungstenite itself
          Some(Ok(_)) => continue,
          Some(Err(e)) => return Err(ChannelError::Receive(e.to_string())),
          None => return Ok(Incoming::Closed { code: None }),
        }
      }
    })
  }

  fn close(&mut self, code: u16) -> BoxFuture<'_, Result<(), ChannelError>> {
    Box::pin(async move {
      let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "client closing".into(),
      };
      self
        .ws
        .close(Some(frame))
        .await
        .map_err(|e| ChannelError::Send(e.to_string()))
    })
  }
}
