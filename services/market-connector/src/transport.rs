//! Bidirectional frame transport
//!
//! The connection only needs to send and receive frames; the websocket
//! implementation lives behind these traits so reconnection logic can be
//! driven by an in-memory transport in tests.

use crate::error::{StreamError, StreamResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

/// Transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload
    Text(String),
    /// Binary payload
    Binary(Vec<u8>),
    /// Ping with payload
    Ping(Vec<u8>),
    /// Pong with payload
    Pong(Vec<u8>),
    /// Close handshake
    Close,
}

/// Write half of a session
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame
    async fn send(&mut self, frame: Frame) -> StreamResult<()>;

    /// Close the write half
    async fn close(&mut self) -> StreamResult<()>;
}

/// Read half of a session
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame; `None` once the peer is gone
    async fn next_frame(&mut self) -> Option<StreamResult<Frame>>;
}

/// Opens sessions to an endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and return the split session
    async fn connect(&self, url: &str) -> StreamResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

struct WsSink(SplitSink<WsStream, Message>);
struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> StreamResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let parsed = url::Url::parse(url).map_err(StreamError::transport)?;
        let (ws_stream, response) = connect_async(parsed.as_str())
            .await
            .map_err(StreamError::transport)?;
        debug!("Websocket handshake with {} returned {}", url, response.status());
        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink(write)), Box::new(WsSource(read))))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> StreamResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.0.send(message).await.map_err(StreamError::transport)
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.0.close().await.map_err(StreamError::transport)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<StreamResult<Frame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(data)) => Frame::Binary(data),
                Ok(Message::Ping(data)) => Frame::Ping(data),
                Ok(Message::Pong(data)) => Frame::Pong(data),
                Ok(Message::Close(_)) => Frame::Close,
                // Raw frames are never surfaced when reading
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(StreamError::transport(e))),
            };
            return Some(Ok(frame));
        }
    }
}
