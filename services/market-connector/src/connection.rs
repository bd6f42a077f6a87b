//! Resilient streaming connection
//!
//! [`StreamConnection::connect`] owns the session lifecycle. Each session
//! multiplexes three loops on one task: frame dispatch, heartbeat and the
//! health monitor. When a session ends on a transport failure or an exchange
//! error frame, the connection backs off exponentially, reconnects and
//! re-sends SUBSCRIBE for every channel still registered. Handlers are never
//! re-registered; the registry survives reconnection untouched. After the
//! configured number of consecutive failed attempts the connection reports
//! `Failed` and returns an error.
//!
//! States: `Disconnected -> Connecting -> Connected -> (Reconnecting -> Connected | Failed)`.

use crate::error::{StreamError, StreamResult};
use crate::messages::{self, ControlMethod, ControlRequest, Inbound, StreamName};
use crate::subscription::{HandlerId, StreamHandler, SubscriptionRegistry};
use crate::transport::{Frame, FrameSink, FrameSource, Transport};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not started or stopped on request
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Session established
    Connected,
    /// Waiting to retry after a failure
    Reconnecting,
    /// Gave up; terminal until `connect` is called again
    Failed,
}

/// Streaming connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Combined stream endpoint
    pub url: String,
    /// Interval between heartbeat pings
    pub heartbeat_interval_ms: u64,
    /// Delay before the first reconnect; doubled on each further attempt
    pub reconnect_delay_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Interval of the health monitor
    pub monitor_interval_ms: u64,
    /// Latency samples kept for the monitor
    pub latency_samples: usize,
    /// Error rate above which the monitor warns
    pub max_error_rate: f64,
    /// Average latency above which the monitor warns
    pub max_latency_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: services_common::ExchangeEndpoints::default().ws_url,
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            monitor_interval_ms: 60_000,
            latency_samples: 1000,
            max_error_rate: 0.1,
            max_latency_ms: 1000,
        }
    }
}

impl StreamConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.reconnect_delay_ms).saturating_mul(factor)
    }
}

struct ConnectionMetrics {
    messages: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl ConnectionMetrics {
    fn new(capacity: usize) -> Self {
        Self {
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("stream_errors_total").increment(1);
    }

    fn record_latency(&self, latency_ms: u64) {
        let mut samples = self.latencies_ms.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let messages = self.messages.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let samples = self.latencies_ms.lock();
        let avg_latency_ms = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
        };
        ConnectionMetricsSnapshot {
            messages_received: messages,
            errors,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            error_rate: if messages > 0 { errors as f64 / messages as f64 } else { 0.0 },
            avg_latency_ms,
            latency_samples: samples.len(),
        }
    }
}

/// Point-in-time connection statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionMetricsSnapshot {
    /// Text frames received
    pub messages_received: u64,
    /// Malformed frames, decode failures, exchange errors and receive failures
    pub errors: u64,
    /// Reconnect attempts scheduled
    pub reconnects: u64,
    /// errors / messages_received
    pub error_rate: f64,
    /// Mean of the retained latency samples
    pub avg_latency_ms: Option<f64>,
    /// Number of retained latency samples
    pub latency_samples: usize,
}

enum SessionEnd {
    Shutdown,
    Failed(StreamError),
}

/// One multiplexed streaming connection to the exchange
pub struct StreamConnection {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    registry: RwLock<SubscriptionRegistry>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    request_id: AtomicU64,
    metrics: ConnectionMetrics,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.config.url)
            .field("state", &*self.state_tx.borrow())
            .field("registry", &*self.registry.read())
            .finish()
    }
}

impl StreamConnection {
    /// Create a disconnected connection over `transport`
    #[must_use]
    pub fn new(config: StreamConfig, transport: Arc<dyn Transport>) -> Self {
        let metrics = ConnectionMetrics::new(config.latency_samples);
        Self {
            config,
            transport,
            registry: RwLock::new(SubscriptionRegistry::new()),
            sink: tokio::sync::Mutex::new(None),
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            shutdown_tx: watch::Sender::new(false),
            request_id: AtomicU64::new(0),
            metrics,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connection statistics
    #[must_use]
    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Channels with at least one handler
    #[must_use]
    pub fn subscriptions(&self) -> Vec<StreamName> {
        self.registry.read().channels()
    }

    /// Handlers registered on a channel
    #[must_use]
    pub fn handler_count(&self, channel: &StreamName) -> usize {
        self.registry.read().handler_count(channel)
    }

    /// Take a symbol-level reference; true for the first one
    pub fn acquire_symbol(&self, symbol: &str) -> bool {
        self.registry.write().acquire_symbol(symbol)
    }

    /// Release a symbol-level reference; true when it was the last one
    pub fn release_symbol(&self, symbol: &str) -> bool {
        self.registry.write().release_symbol(symbol)
    }

    /// Ask every loop to stop; `connect` returns once the socket is closed
    pub fn shutdown(&self) {
        info!("Stream connection shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Stream connection {:?} -> {:?}", previous, state);
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a handler, subscribing the channel when it is new
    ///
    /// While disconnected the registration is kept and the SUBSCRIBE is
    /// sent when the next session starts.
    pub async fn subscribe(&self, channel: StreamName, handler: Arc<dyn StreamHandler>) -> HandlerId {
        let mut sink = self.sink.lock().await;
        let registration = self.registry.write().add_handler(channel.clone(), handler);
        if registration.new_channel {
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = self.send_control(sink.as_mut(), ControlMethod::Subscribe, &channel).await {
                    warn!("SUBSCRIBE {} not delivered, will retry on reconnect: {}", channel, e);
                }
            }
        }
        registration.id
    }

    /// Drop a channel and all of its handlers
    pub async fn unsubscribe(&self, channel: &StreamName) -> bool {
        let mut sink = self.sink.lock().await;
        let removed = self.registry.write().remove_channel(channel);
        if removed {
            self.send_unsubscribe(sink.as_mut(), channel).await;
        }
        removed
    }

    /// Remove one handler; unsubscribes the channel when it was the last
    pub async fn remove_handler(&self, channel: &StreamName, id: HandlerId) -> bool {
        let mut sink = self.sink.lock().await;
        let outcome = self.registry.write().remove_handler(channel, id);
        match outcome {
            Some(true) => {
                self.send_unsubscribe(sink.as_mut(), channel).await;
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    async fn send_unsubscribe(&self, sink: Option<&mut Box<dyn FrameSink>>, channel: &StreamName) {
        if let Some(sink) = sink {
            if let Err(e) = self.send_control(sink.as_mut(), ControlMethod::Unsubscribe, channel).await {
                warn!("UNSUBSCRIBE {} not delivered: {}", channel, e);
            }
        }
    }

    async fn send_control(
        &self,
        sink: &mut dyn FrameSink,
        method: ControlMethod,
        channel: &StreamName,
    ) -> StreamResult<()> {
        let request = ControlRequest {
            method,
            params: vec![channel.to_string()],
            id: self.next_request_id(),
        };
        debug!("Sending {:?} {} (id {})", method, channel, request.id);
        sink.send(Frame::Text(request.to_text()?)).await
    }

    async fn send_frame(&self, frame: Frame) -> StreamResult<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(StreamError::NotConnected),
        }
    }

    async fn install_session(&self, mut new_sink: Box<dyn FrameSink>) -> StreamResult<()> {
        let mut sink = self.sink.lock().await;
        let channels = self.registry.read().channels();
        for channel in &channels {
            self.send_control(new_sink.as_mut(), ControlMethod::Subscribe, channel).await?;
        }
        if !channels.is_empty() {
            info!("Subscribed {} channels on new session", channels.len());
        }
        *sink = Some(new_sink);
        Ok(())
    }

    async fn close_session(&self) {
        let taken = self.sink.lock().await.take();
        if let Some(mut sink) = taken {
            if let Err(e) = sink.close().await {
                debug!("Error closing stream sink: {}", e);
            }
        }
    }

    /// Run the connection until shutdown or until reconnection gives up
    ///
    /// # Errors
    ///
    /// [`StreamError::RetriesExhausted`] once the connection is `Failed`.
    pub async fn connect(&self) -> StreamResult<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut attempts: u32 = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            info!("Connecting to {}", self.config.url);
            match self.transport.connect(&self.config.url).await {
                Ok((sink, source)) => match self.install_session(sink).await {
                    Ok(()) => {
                        attempts = 0;
                        self.set_state(ConnectionState::Connected);
                        let end = self.drive_session(source, &mut shutdown).await;
                        self.close_session().await;
                        match end {
                            SessionEnd::Shutdown => {
                                self.set_state(ConnectionState::Disconnected);
                                return Ok(());
                            }
                            SessionEnd::Failed(e) => warn!("Stream session ended: {}", e),
                        }
                    }
                    Err(e) => warn!("Failed to resubscribe on new session: {}", e),
                },
                Err(e) => {
                    self.metrics.record_error();
                    warn!("Connection attempt failed: {}", e);
                }
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                self.set_state(ConnectionState::Failed);
                error!(
                    "Giving up on {} after {} reconnect attempts",
                    self.config.url, self.config.max_reconnect_attempts
                );
                return Err(StreamError::RetriesExhausted {
                    attempts: self.config.max_reconnect_attempts,
                });
            }

            self.set_state(ConnectionState::Reconnecting);
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            counter!("stream_reconnects_total").increment(1);
            let delay = self.config.backoff(attempts);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempts, self.config.max_reconnect_attempts
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_requested(&mut shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    async fn drive_session(
        &self,
        mut source: Box<dyn FrameSource>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut heartbeat = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut monitor = tokio::time::interval(Duration::from_millis(self.config.monitor_interval_ms));
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        monitor.tick().await;

        loop {
            tokio::select! {
                () = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                frame = source.next_frame() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        if let Err(e) = self.dispatch(&text) {
                            return SessionEnd::Failed(e);
                        }
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        if let Err(e) = self.send_frame(Frame::Pong(payload)).await {
                            return SessionEnd::Failed(e);
                        }
                    }
                    Some(Ok(Frame::Pong(_) | Frame::Binary(_))) => {}
                    Some(Ok(Frame::Close)) | None => return SessionEnd::Failed(StreamError::ConnectionClosed),
                    Some(Err(e)) => {
                        self.metrics.record_error();
                        return SessionEnd::Failed(e);
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_frame(Frame::Ping(Vec::new())).await {
                        return SessionEnd::Failed(StreamError::Heartbeat { message: e.to_string() });
                    }
                }
                _ = monitor.tick() => self.check_health(),
            }
        }
    }

    /// Route one text frame; an error means the session must be restarted
    fn dispatch(&self, text: &str) -> StreamResult<()> {
        self.metrics.messages.fetch_add(1, Ordering::Relaxed);
        counter!("stream_messages_total").increment(1);

        match messages::classify(text) {
            Ok(Inbound::Data { stream, data }) => {
                let handlers = self.registry.read().handlers(&stream);
                if handlers.is_empty() {
                    debug!("No handlers for {}", stream);
                    return Ok(());
                }
                match messages::decode(&stream, data) {
                    Ok(event) => {
                        if let Some(event_time) = event.event_time() {
                            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
                            self.metrics.record_latency(now.saturating_sub(event_time));
                        }
                        for handler in handlers {
                            handler.on_event(&stream, &event);
                        }
                    }
                    Err(e) => {
                        self.metrics.record_error();
                        warn!("Dropping malformed payload on {}: {}", stream, e);
                    }
                }
                Ok(())
            }
            Ok(Inbound::Ack { id }) => {
                debug!("Control request {} acknowledged", id);
                Ok(())
            }
            Ok(Inbound::Error { code, message }) => {
                self.metrics.record_error();
                error!("Exchange stream error {}: {}", code, message);
                Err(StreamError::Exchange { code, message })
            }
            Err(e) => {
                self.metrics.record_error();
                warn!("Dropping malformed frame: {}", e);
                Ok(())
            }
        }
    }

    fn check_health(&self) {
        let snapshot = self.metrics.snapshot();
        gauge!("stream_error_rate").set(snapshot.error_rate);

        if snapshot.error_rate > self.config.max_error_rate {
            warn!(
                "High stream error rate: {:.2}% ({} of {})",
                snapshot.error_rate * 100.0,
                snapshot.errors,
                snapshot.messages_received
            );
        }
        if let Some(latency) = snapshot.avg_latency_ms {
            gauge!("stream_latency_ms").set(latency);
            if latency > self.config.max_latency_ms as f64 {
                warn!("High stream latency: {:.0}ms average", latency);
            }
        }
    }
}

/// Resolve once `shutdown` reads true
///
/// The borrowed value is released before returning so the waiting future
/// stays `Send` inside `select!`.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("Shutdown sender dropped");
    }
}
