//! The duplex frame transport a session runs on.
//!
//! A [`Connector`] turns a join URL into a [`Connection`]: an outbound frame sink
//! and an inbound frame stream that can be driven from different tasks. The
//! production connector speaks WebSocket through `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError,
        protocol::{CloseFrame, Message, frame::coding::CloseCode},
    },
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    WebSocket(WsError),
    #[error("{0}")]
    Other(String),
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(other),
        }
    }
}

/// The status carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this close ends the connection without error.
    pub fn is_normal(&self) -> bool {
        matches!(self.code, Self::NORMAL | Self::GOING_AWAY)
    }
}

/// One unit of data on the connection. Control frames other than close are
/// handled by the transport and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseReason>),
}

impl Frame {
    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Close(frame) => Some(Frame::Close(frame.map(|frame| CloseReason {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            }))),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
                code: CloseCode::from(reason.code),
                reason: reason.reason.into(),
            })),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open connection, already split into its two halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to join URLs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, response) = connect_async(url).await?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = ws_rx.filter_map(|message| {
            future::ready(match message {
                Ok(message) => Frame::from_message(message).map(Ok),
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}
