//! Channel-backed transport and snapshot fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use market_connector::{
    DepthSnapshot, Frame, FrameSink, FrameSource, PriceLevel, SnapshotSource, StreamConfig, StreamError,
    StreamResult, Transport,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream settings with millisecond backoff and no heartbeat noise
pub fn fast_config() -> StreamConfig {
    StreamConfig {
        url: "ws://fake.local/stream".to_string(),
        heartbeat_interval_ms: 3_600_000,
        reconnect_delay_ms: 5,
        max_reconnect_attempts: 3,
        monitor_interval_ms: 3_600_000,
        ..StreamConfig::default()
    }
}

/// Exchange side of one fake session
pub struct ServerSide {
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    pub inbound: mpsc::UnboundedSender<StreamResult<Frame>>,
}

impl ServerSide {
    /// Next text frame sent by the client, skipping pings and pongs
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match tokio::time::timeout(TEST_TIMEOUT, self.outbound.recv()).await.ok()?? {
                Frame::Text(text) => return Some(text),
                _ => continue,
            }
        }
    }

    /// Next non-text frame sent by the client
    pub async fn next_control_frame(&mut self) -> Option<Frame> {
        loop {
            match tokio::time::timeout(TEST_TIMEOUT, self.outbound.recv()).await.ok()?? {
                Frame::Text(_) => continue,
                other => return Some(other),
            }
        }
    }

    /// Read `count` control requests and return (method, channel) pairs
    pub async fn requests(&mut self, count: usize) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let Some(text) = self.next_text().await else {
                break;
            };
            let value: serde_json::Value = serde_json::from_str(&text).expect("control frame is json");
            let method = value["method"].as_str().unwrap_or_default().to_string();
            for param in value["params"].as_array().into_iter().flatten() {
                out.push((method.clone(), param.as_str().unwrap_or_default().to_string()));
            }
        }
        out
    }

    /// Channels named in the next `count` SUBSCRIBE requests
    pub async fn subscribed_channels(&mut self, count: usize) -> BTreeSet<String> {
        self.requests(count)
            .await
            .into_iter()
            .filter(|(method, _)| method == "SUBSCRIBE")
            .map(|(_, channel)| channel)
            .collect()
    }

    /// Push a text frame to the client
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(Frame::Text(text.into())));
    }

    /// Push any frame to the client
    pub fn push_frame(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    /// Any text frame already queued without waiting
    pub fn pending_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let Frame::Text(text) = frame {
                texts.push(text);
            }
        }
        texts
    }
}

struct ChannelSink(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> StreamResult<()> {
        self.0.send(frame).map_err(|_| StreamError::ConnectionClosed)
    }

    async fn close(&mut self) -> StreamResult<()> {
        Ok(())
    }
}

struct ChannelSource(mpsc::UnboundedReceiver<StreamResult<Frame>>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<StreamResult<Frame>> {
        self.0.recv().await
    }
}

/// Transport handing every new session to the test
pub struct FakeTransport {
    sessions: mpsc::UnboundedSender<ServerSide>,
    refuse: AtomicBool,
    attempts: AtomicU32,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions,
                refuse: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
            }),
            rx,
        )
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _url: &str) -> StreamResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::transport("connection refused"));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.sessions
            .send(ServerSide {
                outbound: out_rx,
                inbound: in_tx,
            })
            .map_err(|_| StreamError::transport("test dropped the session receiver"))?;
        Ok((Box::new(ChannelSink(out_tx)), Box::new(ChannelSource(in_rx))))
    }
}

/// Snapshot source serving canned books
#[derive(Default)]
pub struct FakeSnapshots {
    books: Mutex<Vec<DepthSnapshot>>,
    fetches: AtomicU32,
}

impl FakeSnapshots {
    pub fn with(snapshot: DepthSnapshot) -> Arc<Self> {
        let fake = Self::default();
        fake.books.lock().push(snapshot);
        Arc::new(fake)
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for FakeSnapshots {
    async fn fetch_depth(&self, symbol: &str, _limit: u32) -> StreamResult<DepthSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.books
            .lock()
            .iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
            .ok_or_else(|| StreamError::Snapshot {
                symbol: symbol.to_string(),
                message: "no canned snapshot".to_string(),
            })
    }
}

/// Two-sided snapshot around 100
pub fn book_at(symbol: &str, update_id: u64) -> DepthSnapshot {
    DepthSnapshot {
        symbol: symbol.to_string(),
        last_update_id: update_id,
        bids: vec![PriceLevel::new(99.0, 1.0), PriceLevel::new(98.0, 2.0)],
        asks: vec![PriceLevel::new(101.0, 1.0), PriceLevel::new(102.0, 2.0)],
        event_time: 0,
    }
}
