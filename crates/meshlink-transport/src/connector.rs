//! Socket abstraction used by the streaming transport
//!
//! A [`Connector`] opens one duplex connection and hands it back as a
//! frame sink plus a frame stream. [`WebSocketConnector`] is the production
//! implementation on top of tokio-tungstenite.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::transport::TransportError;

/// A single socket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open duplex connection
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Parameters of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub api_key: Option<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection. Returns once the handshake has completed.
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

/// Upgrade request with the bearer token attached
pub fn build_request(request: &ConnectRequest) -> Result<Request, TransportError> {
    let mut upgrade = request.url.as_str().into_client_request()?;
    if let Some(key) = &request.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
        upgrade.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(upgrade)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, TransportError> {
        let upgrade = build_request(request)?;
        let (ws_stream, response) = connect_async(upgrade).await?;
        debug!(url = %request.url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = read.map(|message| message.map(Frame::from).map_err(TransportError::from));

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(data) => Frame::Binary(data),
            Message::Text(text) => Frame::Text(text),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
            Message::Frame(raw) => Frame::Binary(raw.into_data()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_bearer_token() {
        let request = build_request(&ConnectRequest {
            url: "wss://mesh.example.com/stream?session=abc".into(),
            api_key: Some("secret".into()),
        })
        .unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer secret"
        );
        assert_eq!(request.uri().path(), "/stream");
        assert_eq!(request.uri().query(), Some("session=abc"));
    }

    #[test]
    fn test_request_without_key_has_no_auth() {
        let request = build_request(&ConnectRequest {
            url: "ws://localhost:8080/stream?session=abc".into(),
            api_key: None,
        })
        .unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_header_value() {
        let result = build_request(&ConnectRequest {
            url: "ws://localhost:8080/stream".into(),
            api_key: Some("bad\nkey".into()),
        });
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[test]
    fn test_frame_message_conversion() {
        assert_eq!(
            Message::from(Frame::Binary(vec![1, 2])),
            Message::Binary(vec![1, 2])
        );
        assert_eq!(Frame::from(Message::Close(None)), Frame::Close);
        assert_eq!(Frame::from(Message::Text("hi".into())), Frame::Text("hi".into()));
    }
}
