//! WebSocket connection manager.
//!
//! Each stream gets its own worker task that owns the transport, the
//! reconnect timers and the [`ConnectionState`]. Callers talk to workers
//! through a bounded inbox; workers publish [`StreamEvent`]s on a shared
//! channel. Transport tasks and timers report back through the same inbox
//! tagged with a generation or timer id, so the state machine can drop
//! anything stale.

use crate::backoff::BackoffPolicy;
use crate::error::{WsError, WsResult};
use crate::heartbeat::Heartbeat;
use crate::message::{StreamEndpoint, StreamEvent};
use crate::state::{
    ConnectionEvent, ConnectionPhase, ConnectionState, Effect, ReconnectRules, TimerId,
};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const WORKER_INBOX_CAPACITY: usize = 1024;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration
// ============================================================================

/// Per-stream connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_enabled: bool,
    /// Maximum reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Jitter upper bound as a fraction of the exponential delay.
    pub jitter_fraction: f64,
    /// How often a ping probe is written while connected.
    pub probe_interval_ms: u64,
    /// Silence longer than this tears the transport down (0 = never).
    pub idle_timeout_ms: u64,
    /// Handshake deadline.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_enabled: true,
            max_reconnect_attempts: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            jitter_fraction: crate::backoff::DEFAULT_JITTER_FRACTION,
            probe_interval_ms: 15_000,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn backoff_policy(&self) -> WsResult<BackoffPolicy> {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.jitter_fraction,
        )
    }

    pub fn validate(&self) -> WsResult<()> {
        self.backoff_policy()?;
        if self.probe_interval_ms == 0 {
            return Err(WsError::InvalidConfig(
                "probe_interval_ms must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(WsError::InvalidConfig(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn rules(&self) -> ReconnectRules {
        ReconnectRules {
            enabled: self.reconnect_enabled,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

enum WorkerInput {
    Open {
        endpoint: StreamEndpoint,
        config: ConnectionConfig,
    },
    Close,
    Send(String),
    Opened {
        generation: u64,
        sink: WsSink,
    },
    Frame {
        generation: u64,
        message: Message,
    },
    Closed {
        generation: u64,
        reason: String,
    },
    TimerFired(TimerId),
}

struct StreamHandle {
    inbox: mpsc::Sender<WorkerInput>,
    state: Arc<RwLock<ConnectionState>>,
    task: JoinHandle<()>,
}

/// Owns one worker per stream id.
pub struct ConnectionManager {
    streams: DashMap<String, StreamHandle>,
    events_tx: mpsc::Sender<StreamEvent>,
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager publishing worker events on `events_tx`.
    pub fn new(events_tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            streams: DashMap::new(),
            events_tx,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Open (or re-open) a stream.
    ///
    /// Returns once the worker has accepted the request; the handshake runs
    /// in the background and its outcome arrives as a [`StreamEvent::Phase`].
    pub async fn open(
        &self,
        stream_id: &str,
        endpoint: StreamEndpoint,
        config: ConnectionConfig,
    ) -> WsResult<()> {
        config.validate()?;
        if self.shutdown_token.is_cancelled() {
            return Err(WsError::ChannelClosed(stream_id.to_string()));
        }
        let inbox = self.worker_inbox(stream_id, &config);
        inbox
            .send(WorkerInput::Open { endpoint, config })
            .await
            .map_err(|_| WsError::ChannelClosed(stream_id.to_string()))
    }

    /// Close a stream and cancel any pending reconnect.
    pub async fn close(&self, stream_id: &str) -> WsResult<()> {
        let inbox = self.existing_inbox(stream_id)?;
        inbox
            .send(WorkerInput::Close)
            .await
            .map_err(|_| WsError::ChannelClosed(stream_id.to_string()))
    }

    /// Queue a text frame on a connected stream.
    pub async fn send(&self, stream_id: &str, payload: impl Into<String>) -> WsResult<()> {
        let inbox = {
            let handle = self
                .streams
                .get(stream_id)
                .ok_or_else(|| WsError::NotConnected(stream_id.to_string()))?;
            if handle.state.read().phase != ConnectionPhase::Connected {
                return Err(WsError::NotConnected(stream_id.to_string()));
            }
            handle.inbox.clone()
        };
        inbox
            .send(WorkerInput::Send(payload.into()))
            .await
            .map_err(|_| WsError::ChannelClosed(stream_id.to_string()))
    }

    /// Snapshot of a stream's state.
    pub fn state(&self, stream_id: &str) -> Option<ConnectionState> {
        self.streams.get(stream_id).map(|h| h.state.read().clone())
    }

    pub fn phase(&self, stream_id: &str) -> Option<ConnectionPhase> {
        self.streams.get(stream_id).map(|h| h.state.read().phase)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every stream and wait for the workers to exit.
    pub async fn shutdown(&self) {
        info!("ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
        let ids = self.stream_ids();
        for id in ids {
            if let Some((_, handle)) = self.streams.remove(&id) {
                if let Err(e) = handle.task.await {
                    if !e.is_cancelled() {
                        error!(stream_id = %id, ?e, "Stream worker panicked");
                    }
                }
            }
        }
    }

    fn existing_inbox(&self, stream_id: &str) -> WsResult<mpsc::Sender<WorkerInput>> {
        self.streams
            .get(stream_id)
            .map(|h| h.inbox.clone())
            .ok_or_else(|| WsError::UnknownStream(stream_id.to_string()))
    }

    fn worker_inbox(&self, stream_id: &str, config: &ConnectionConfig) -> mpsc::Sender<WorkerInput> {
        if let Some(handle) = self.streams.get(stream_id) {
            return handle.inbox.clone();
        }
        self.streams
            .entry(stream_id.to_string())
            .or_insert_with(|| self.spawn_worker(stream_id, config))
            .inbox
            .clone()
    }

    fn spawn_worker(&self, stream_id: &str, config: &ConnectionConfig) -> StreamHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(WORKER_INBOX_CAPACITY);
        let state = ConnectionState::new(stream_id);
        let snapshot = Arc::new(RwLock::new(state.clone()));
        let worker = StreamWorker {
            state,
            snapshot: snapshot.clone(),
            endpoint: StreamEndpoint::new(String::new()),
            config: config.clone(),
            policy: config.backoff_policy().unwrap_or_default(),
            heartbeat: Heartbeat::new(config.probe_interval_ms, config.idle_timeout_ms),
            inbox: inbox_rx,
            inbox_tx: inbox_tx.clone(),
            events_tx: self.events_tx.clone(),
            sink: None,
            transport_task: None,
            timers: HashMap::new(),
            shutdown: self.shutdown_token.child_token(),
        };
        debug!(stream_id, "Spawning stream worker");
        StreamHandle {
            inbox: inbox_tx,
            state: snapshot,
            task: tokio::spawn(worker.run()),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct StreamWorker {
    state: ConnectionState,
    snapshot: Arc<RwLock<ConnectionState>>,
    endpoint: StreamEndpoint,
    config: ConnectionConfig,
    policy: BackoffPolicy,
    heartbeat: Heartbeat,
    inbox: mpsc::Receiver<WorkerInput>,
    inbox_tx: mpsc::Sender<WorkerInput>,
    events_tx: mpsc::Sender<StreamEvent>,
    sink: Option<WsSink>,
    transport_task: Option<JoinHandle<()>>,
    timers: HashMap<TimerId, CancellationToken>,
    shutdown: CancellationToken,
}

impl StreamWorker {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let mut probe = self.probe_ticker();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.dispatch(ConnectionEvent::Close).await;
                    break;
                }
                input = self.inbox.recv() => {
                    let Some(input) = input else { break };
                    let reset_probe = matches!(input, WorkerInput::Open { .. });
                    self.handle(input).await;
                    if reset_probe {
                        probe = self.probe_ticker();
                    }
                }
                _ = probe.tick() => {
                    self.on_probe_tick().await;
                }
            }
        }
        self.teardown_transport().await;
        info!(stream_id = %self.state.stream_id, "Stream worker stopped");
    }

    fn probe_ticker(&self) -> tokio::time::Interval {
        let period = self.heartbeat.probe_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn handle(&mut self, input: WorkerInput) {
        match input {
            WorkerInput::Open { endpoint, config } => {
                info!(stream_id = %self.state.stream_id, url = %endpoint.url, "Opening stream");
                self.endpoint = endpoint;
                self.policy = config.backoff_policy().unwrap_or_default();
                self.heartbeat = Heartbeat::new(config.probe_interval_ms, config.idle_timeout_ms);
                self.config = config;
                let rules = self.config.rules();
                self.dispatch(ConnectionEvent::Open { rules }).await;
            }
            WorkerInput::Close => {
                info!(stream_id = %self.state.stream_id, "Closing stream");
                self.dispatch(ConnectionEvent::Close).await;
            }
            WorkerInput::Send(payload) => {
                if !self.state.is_connected() {
                    warn!(stream_id = %self.state.stream_id, "Dropping send on disconnected stream");
                    return;
                }
                if let Err(e) = self.write(Message::Text(payload)).await {
                    self.fail_transport(e.to_string()).await;
                }
            }
            WorkerInput::Opened { generation, sink } => self.on_opened(generation, sink).await,
            WorkerInput::Frame {
                generation,
                message,
            } => self.on_frame(generation, message).await,
            WorkerInput::Closed { generation, reason } => {
                if self.state.is_current(generation) {
                    warn!(stream_id = %self.state.stream_id, %reason, "Transport closed");
                    self.teardown_transport().await;
                }
                self.dispatch(ConnectionEvent::TransportClosed { generation, reason })
                    .await;
            }
            WorkerInput::TimerFired(timer) => {
                self.timers.remove(&timer);
                self.dispatch(ConnectionEvent::ReconnectTimerFired { timer })
                    .await;
            }
        }
    }

    async fn on_opened(&mut self, generation: u64, sink: WsSink) {
        if generation != self.state.generation()
            || self.state.phase != ConnectionPhase::Connecting
        {
            debug!(stream_id = %self.state.stream_id, generation, "Discarding stale transport");
            return;
        }
        let now = Utc::now();
        self.sink = Some(sink);
        self.heartbeat.reset(now);
        self.dispatch(ConnectionEvent::TransportOpened { generation, at: now })
            .await;
        info!(stream_id = %self.state.stream_id, "WebSocket connected");

        for payload in self.endpoint.on_connect.clone() {
            if let Err(e) = self.write(Message::Text(payload)).await {
                self.fail_transport(format!("initial payload failed: {e}"))
                    .await;
                return;
            }
        }
    }

    async fn on_frame(&mut self, generation: u64, message: Message) {
        if !self.state.is_current(generation) {
            return;
        }
        let now = Utc::now();
        self.heartbeat.record_message(now);
        self.dispatch(ConnectionEvent::MessageReceived { generation, at: now })
            .await;

        match message {
            Message::Text(text) => {
                self.emit(StreamEvent::Message {
                    stream_id: self.state.stream_id.clone(),
                    text,
                    received_at: now,
                })
                .await;
            }
            Message::Ping(data) => {
                if let Err(e) = self.write(Message::Pong(data)).await {
                    self.fail_transport(e.to_string()).await;
                }
            }
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1000, "Normal close".to_string()));
                warn!(stream_id = %self.state.stream_id, code, %reason, "WebSocket closed by server");
            }
            _ => {}
        }
    }

    async fn on_probe_tick(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let now = Utc::now();
        if self.heartbeat.is_idle(now) {
            warn!(
                stream_id = %self.state.stream_id,
                silent_ms = self.heartbeat.time_since_last_message_ms(now),
                "Idle timeout"
            );
            self.fail_transport("idle timeout".to_string()).await;
            return;
        }
        match self.write(Message::Ping(Vec::new())).await {
            Ok(()) => {
                self.heartbeat.record_probe(now);
                self.dispatch(ConnectionEvent::ProbeSent { at: now }).await;
            }
            Err(e) => self.fail_transport(e.to_string()).await,
        }
    }

    /// Apply an event, publish the snapshot, then run the effects.
    async fn dispatch(&mut self, event: ConnectionEvent) {
        let effects = self.state.apply(event);
        *self.snapshot.write() = self.state.clone();
        for effect in effects {
            self.perform(effect).await;
        }
    }

    async fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::Connect { generation } => self.start_transport(generation).await,
            Effect::CloseTransport => self.teardown_transport().await,
            Effect::ScheduleReconnect { timer, attempt } => self.schedule_reconnect(timer, attempt),
            Effect::CancelReconnect { timer } => {
                if let Some(token) = self.timers.remove(&timer) {
                    token.cancel();
                }
            }
            Effect::PhaseChanged { from, to, attempts } => {
                if to == ConnectionPhase::Failed {
                    error!(stream_id = %self.state.stream_id, attempts, "Stream failed");
                } else {
                    info!(stream_id = %self.state.stream_id, %from, %to, attempts, "Phase changed");
                }
                self.emit(StreamEvent::Phase {
                    stream_id: self.state.stream_id.clone(),
                    from,
                    to,
                    attempts,
                })
                .await;
            }
            Effect::LatencyMeasured { latency_ms } => {
                debug!(stream_id = %self.state.stream_id, latency_ms, "Latency measured");
                self.emit(StreamEvent::Latency {
                    stream_id: self.state.stream_id.clone(),
                    latency_ms,
                })
                .await;
            }
        }
    }

    fn schedule_reconnect(&mut self, timer: TimerId, attempt: u32) {
        let delay = self.policy.next_delay(attempt);
        warn!(
            stream_id = %self.state.stream_id,
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting"
        );
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = inbox.send(WorkerInput::TimerFired(timer)).await;
                }
            }
        });
        self.timers.insert(timer, token);
    }

    async fn start_transport(&mut self, generation: u64) {
        self.teardown_transport().await;
        let url = self.endpoint.url.clone();
        let stream_id = self.state.stream_id.clone();
        let inbox = self.inbox_tx.clone();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        self.transport_task = Some(tokio::spawn(async move {
            info!(%stream_id, %url, generation, "Connecting to WebSocket");
            // TCP_NODELAY for lower latency
            let handshake = connect_async_tls_with_config(url.as_str(), None, true, None);
            let ws = match tokio::time::timeout(connect_timeout, handshake).await {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    let _ = inbox
                        .send(WorkerInput::Closed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                Err(_) => {
                    let _ = inbox
                        .send(WorkerInput::Closed {
                            generation,
                            reason: "connect timeout".to_string(),
                        })
                        .await;
                    return;
                }
            };

            let (sink, mut read) = ws.split();
            if inbox
                .send(WorkerInput::Opened { generation, sink })
                .await
                .is_err()
            {
                return;
            }

            let reason = loop {
                match read.next().await {
                    Some(Ok(message)) => {
                        if inbox
                            .send(WorkerInput::Frame {
                                generation,
                                message,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbox.send(WorkerInput::Closed { generation, reason }).await;
        }));
    }

    async fn teardown_transport(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(None))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(?e, "Failed to send Close frame"),
                Err(_) => debug!("Timed out sending Close frame"),
            }
        }
        if let Some(task) = self.transport_task.take() {
            task.abort();
        }
    }

    /// Tear down the current transport and report it as failed.
    async fn fail_transport(&mut self, reason: String) {
        let generation = self.state.generation();
        self.teardown_transport().await;
        self.dispatch(ConnectionEvent::TransportClosed { generation, reason })
            .await;
    }

    async fn write(&mut self, message: Message) -> WsResult<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| WsError::NotConnected(self.state.stream_id.clone()))?;
        sink.send(message).await?;
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(stream_id = %self.state.stream_id, "Event receiver dropped");
        }
    }
}
