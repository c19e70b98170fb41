//! Client provider: keeps one document connection alive.
//!
//! Provides:
//! - AUTH handshake on every (re)connect
//! - Reconnection with capped exponential backoff and jitter
//! - Offline queue for frames composed while disconnected, flushed in order
//! - Heartbeat over CUSTOM ping/pong, with latency measurement
//!
//! The provider only moves frames. Feeding SYNC payloads into a document
//! (for example a `plexus_core::SyncBridge`) is up to the caller, through
//! the [`ProviderEvent`] channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    unix_millis, AuthRequest, AwarenessUpdate, CustomMessage, ErrorCode, ErrorMessage, Frame, MessageKind,
    Notification, ProtocolError, SyncMessage, MAX_FRAME_SIZE,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub token: String,
    pub user_id: String,
    pub user_name: String,
    pub document_id: Uuid,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fraction of each delay randomised in both directions
    pub jitter: f64,
    /// Consecutive failed attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Reconnect when a ping goes unanswered this long
    pub pong_timeout: Duration,
    pub offline_queue_cap: usize,
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, document_id: Uuid, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            url: url.into(),
            token: String::new(),
            user_name: user_id.clone(),
            user_id,
            document_id,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(10),
            jitter: 0.2,
            max_attempts: 0,
            heartbeat_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(30),
            offline_queue_cap: 1000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Fast retries, for tests against a local server.
    pub fn for_testing(url: impl Into<String>, document_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_secs(2),
            ..Self::new(url, document_id, user_id)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Gave up: shut down, rejected by the server, or out of attempts
    Closed,
}

/// Events emitted by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    StatusChanged(ConnectionStatus),
    /// The server's state vector; answer with a `Step2` diff
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
    Custom(CustomMessage),
    Notification(Notification),
    Error(ErrorMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
    pub queued: u64,
    pub dropped: u64,
    pub last_latency_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct AtomicMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    /// Latency plus one; zero means not measured yet
    latency: AtomicU64,
}

impl AtomicMetrics {
    fn snapshot(&self) -> ProviderMetrics {
        let latency = self.latency.load(Ordering::Relaxed);
        ProviderMetrics {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_latency_ms: latency.checked_sub(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The provider was shut down or gave up
    Closed,
    Protocol(ProtocolError),
    Transport(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Closed => write!(f, "Provider is closed"),
            ClientError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ClientError::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Capped exponential backoff with symmetric jitter.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self::with_rng(base, cap, jitter, StdRng::from_entropy())
    }

    pub fn with_rng(base: Duration, cap: Duration, jitter: f64, rng: StdRng) -> Self {
        Self { base, cap, jitter: jitter.clamp(0.0, 1.0), attempt: 0, rng }
    }

    /// Delay before the next attempt, then count the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt.min(31)));
        let delay = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + self.rng.gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor).min(self.cap)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Offline queue for frames composed while disconnected.
///
/// Queued frames are replayed in order on reconnection. When full, new
/// frames are rejected and counted as dropped.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            dropped: 0,
        }
    }

    /// Queue an encoded frame for later replay.
    pub fn enqueue(&mut self, frame: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Put frames back at the front, keeping their order.
    pub fn requeue_front(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

enum Command {
    Send(Frame),
    Shutdown,
}

/// How one connection ended.
enum SessionEnd {
    /// Transport lost; reconnect
    Lost,
    /// The server refused us; do not retry
    Rejected,
    Shutdown,
}

/// Handle to a supervised document connection.
pub struct Provider {
    config: ClientConfig,
    status: Arc<RwLock<ConnectionStatus>>,
    metrics: Arc<AtomicMetrics>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    event_tx: mpsc::Sender<ProviderEvent>,
    event_rx: Option<mpsc::Receiver<ProviderEvent>>,
}

impl Provider {
    pub fn new(config: ClientConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.offline_queue_cap.max(16));
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            config,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            metrics: Arc::new(AtomicMetrics::default()),
            command_tx,
            command_rx: Some(command_rx),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. Later calls do nothing.
    pub fn start(&mut self) {
        let Some(commands) = self.command_rx.take() else { return };
        let supervisor = Supervisor {
            config: self.config.clone(),
            status: self.status.clone(),
            metrics: self.metrics.clone(),
            events: self.event_tx.clone(),
            queue: OfflineQueue::new(self.config.offline_queue_cap),
            backoff: Backoff::new(self.config.backoff_base, self.config.backoff_cap, self.config.jitter),
        };
        tokio::spawn(supervisor.run(commands));
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub fn metrics(&self) -> ProviderMetrics {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Queue a frame. Delivered now if connected, otherwise on reconnect.
    pub async fn send(&self, frame: Frame) -> Result<(), ClientError> {
        self.command_tx
            .send(Command::Send(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ClientError> {
        self.send(Frame::sync(&SyncMessage::Step1(state_vector))).await
    }

    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ClientError> {
        self.send(Frame::sync(&SyncMessage::Step2(diff))).await
    }

    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ClientError> {
        self.send(Frame::sync(&SyncMessage::Update(update))).await
    }

    pub async fn send_awareness(&self, update: &AwarenessUpdate) -> Result<(), ClientError> {
        self.send(Frame::awareness(update)?).await
    }

    pub async fn send_custom(&self, message: &CustomMessage) -> Result<(), ClientError> {
        self.send(Frame::custom(message)?).await
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

struct Supervisor {
    config: ClientConfig,
    status: Arc<RwLock<ConnectionStatus>>,
    metrics: Arc<AtomicMetrics>,
    events: mpsc::Sender<ProviderEvent>,
    queue: OfflineQueue,
    backoff: Backoff,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut connected_once = false;
        loop {
            let next = if connected_once { ConnectionStatus::Reconnecting } else { ConnectionStatus::Connecting };
            self.set_status(next).await;

            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    if connected_once {
                        self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    connected_once = true;
                    match self.connection(ws, &mut commands).await {
                        SessionEnd::Lost => {}
                        SessionEnd::Rejected | SessionEnd::Shutdown => break,
                    }
                }
                Err(e) => log::warn!("Connecting to {} failed: {e}", self.config.url),
            }

            if self.config.max_attempts > 0 && self.backoff.attempts() >= self.config.max_attempts {
                log::error!("Giving up on {} after {} attempts", self.config.url, self.backoff.attempts());
                break;
            }
            self.set_status(ConnectionStatus::Disconnected).await;
            let delay = self.backoff.next_delay();
            log::debug!("Reconnecting in {delay:?}");
            if !self.wait_offline(delay, &mut commands).await {
                break;
            }
        }
        self.set_status(ConnectionStatus::Closed).await;
    }

    /// Sleep out a backoff delay while queueing outgoing frames. Returns
    /// false on shutdown.
    async fn wait_offline(&mut self, delay: Duration, commands: &mut mpsc::Receiver<Command>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(Command::Send(frame)) => self.enqueue(frame),
                    Some(Command::Shutdown) | None => return false,
                },
            }
        }
    }

    fn enqueue(&mut self, frame: Frame) {
        // Presence is refreshed after reconnecting; stale entries are useless.
        if frame.kind == MessageKind::Awareness {
            return;
        }
        if self.queue.enqueue(frame.encode()) {
            self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("Offline queue full, dropping {:?} frame", frame.kind);
        }
    }

    async fn connection<S>(&mut self, ws: S, commands: &mut mpsc::Receiver<Command>) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        let auth = AuthRequest {
            token: self.config.token.clone(),
            user_id: self.config.user_id.clone(),
            user_name: self.config.user_name.clone(),
            document_id: self.config.document_id,
        };
        let hello = match Frame::auth(&auth) {
            Ok(frame) => frame.encode(),
            Err(e) => {
                log::error!("Cannot encode AUTH: {e}");
                return SessionEnd::Rejected;
            }
        };
        if self.write(&mut ws_sender, hello).await.is_err() {
            return SessionEnd::Lost;
        }

        let queued = self.queue.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued frames", queued.len());
        }
        let mut pending = queued.into_iter();
        while let Some(frame) = pending.next() {
            if self.write(&mut ws_sender, frame.clone()).await.is_err() {
                let mut rest = vec![frame];
                rest.extend(pending);
                self.queue.requeue_front(rest);
                return SessionEnd::Lost;
            }
        }

        self.backoff.reset();
        self.set_status(ConnectionStatus::Connected).await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_sender.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::Lost;
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("Connection to {} failed: {e}", self.config.url);
                            return SessionEnd::Lost;
                        }
                    };
                    let bytes: Vec<u8> = data.into();
                    self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.metrics.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                    let frame = match Frame::decode(&bytes, self.config.max_frame_size) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Dropping malformed frame: {e}");
                            continue;
                        }
                    };
                    match self.dispatch(frame, &mut awaiting_pong) {
                        Ok(Some(reply)) => {
                            if self.write(&mut ws_sender, reply).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Ok(None) => {}
                        Err(end) => {
                            let _ = ws_sender.close().await;
                            return end;
                        }
                    }
                }

                command = commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        let bytes = frame.encode();
                        if self.write(&mut ws_sender, bytes).await.is_err() {
                            self.enqueue(frame);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = ws_sender.close().await;
                        return SessionEnd::Shutdown;
                    }
                },

                _ = heartbeat.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() > self.config.pong_timeout {
                            log::warn!("No pong from {} in {:?}, reconnecting", self.config.url, self.config.pong_timeout);
                            return SessionEnd::Lost;
                        }
                        continue;
                    }
                    let ping = match Frame::custom(&CustomMessage::Ping { ts: unix_millis() }) {
                        Ok(frame) => frame.encode(),
                        Err(_) => continue,
                    };
                    if self.write(&mut ws_sender, ping).await.is_err() {
                        return SessionEnd::Lost;
                    }
                    awaiting_pong = Some(Instant::now());
                }
            }
        }
    }

    /// Route one inbound frame. Returns a frame to send back, if any.
    fn dispatch(&mut self, frame: Frame, awaiting_pong: &mut Option<Instant>) -> Result<Option<Vec<u8>>, SessionEnd> {
        let event = match frame.kind {
            MessageKind::Sync => match frame.as_sync() {
                Ok(SyncMessage::Step1(sv)) => ProviderEvent::SyncStep1(sv),
                Ok(SyncMessage::Step2(diff)) => ProviderEvent::SyncStep2(diff),
                Ok(SyncMessage::Update(update)) => ProviderEvent::Update(update),
                Err(e) => {
                    log::warn!("Bad SYNC payload: {e}");
                    return Ok(None);
                }
            },
            MessageKind::Awareness => match frame.as_awareness() {
                Ok(update) => ProviderEvent::Awareness(update),
                Err(e) => {
                    log::warn!("Bad AWARENESS payload: {e}");
                    return Ok(None);
                }
            },
            MessageKind::Custom => match frame.as_custom() {
                Ok(CustomMessage::Pong { ts }) => {
                    let latency = unix_millis().saturating_sub(ts);
                    self.metrics.latency.store(latency + 1, Ordering::Relaxed);
                    *awaiting_pong = None;
                    return Ok(None);
                }
                Ok(CustomMessage::Ping { ts }) => {
                    return Ok(Frame::custom(&CustomMessage::Pong { ts }).ok().map(|f| f.encode()));
                }
                Ok(message) => ProviderEvent::Custom(message),
                Err(e) => {
                    log::warn!("Bad CUSTOM payload: {e}");
                    return Ok(None);
                }
            },
            MessageKind::Notification => match frame.as_notification() {
                Ok(notification) => ProviderEvent::Notification(notification),
                Err(e) => {
                    log::warn!("Bad NOTIFICATION payload: {e}");
                    return Ok(None);
                }
            },
            MessageKind::Error => match frame.as_error() {
                Ok(error) => {
                    let fatal = matches!(error.code, ErrorCode::Unauthorized | ErrorCode::SessionFull);
                    if fatal {
                        log::error!("Server refused connection: {}", error.message);
                    }
                    self.emit(ProviderEvent::Error(error));
                    return if fatal { Err(SessionEnd::Rejected) } else { Ok(None) };
                }
                Err(e) => {
                    log::warn!("Bad ERROR payload: {e}");
                    return Ok(None);
                }
            },
            MessageKind::Auth => return Ok(None),
        };
        self.emit(event);
        Ok(None)
    }

    async fn write<W>(&self, sink: &mut W, bytes: Vec<u8>) -> Result<(), ClientError>
    where
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let len = bytes.len() as u64;
        sink.send(Message::Binary(bytes.into())).await?;
        self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn emit(&self, event: ProviderEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Provider event dropped: {e}");
        }
    }

    async fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.write().await;
        if *status != next {
            *status = next;
            drop(status);
            self.emit(ProviderEvent::StatusChanged(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::for_testing("ws://127.0.0.1:1", Uuid::new_v4(), "alice")
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("ws://localhost:9090", Uuid::new_v4(), "alice");
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.backoff_cap, Duration::from_secs(10));
        assert_eq!(config.offline_queue_cap, 1000);
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.user_name, "alice");
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000), 0.0);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempts(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let rng = StdRng::seed_from_u64(12345);
        let mut backoff = Backoff::with_rng(Duration::from_millis(1000), Duration::from_secs(60), 0.2, rng);
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} outside jitter band");
        }
    }

    #[test]
    fn test_offline_queue_order_and_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2, 2]));
        assert!(queue.enqueue(vec![3]));
        assert!(!queue.enqueue(vec![4])); // Full

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.total_bytes(), 4);
        assert_eq!(queue.dropped(), 1);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1], vec![2, 2], vec![3]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = OfflineQueue::new(10);
        queue.enqueue(vec![9]);
        queue.requeue_front(vec![vec![1], vec![2]]);
        assert_eq!(queue.drain(), vec![vec![1], vec![2], vec![9]]);
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut provider = Provider::new(config());
        assert_eq!(provider.status().await, ConnectionStatus::Disconnected);
        assert_eq!(provider.metrics(), ProviderMetrics::default());
        assert!(provider.take_event_rx().is_some());
        assert!(provider.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut cfg = config();
        cfg.max_attempts = 2;
        let mut provider = Provider::new(cfg);
        let mut events = provider.take_event_rx().unwrap();
        provider.start();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event == ProviderEvent::StatusChanged(ConnectionStatus::Closed) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(closed);
        assert_eq!(provider.status().await, ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_frames_queue_while_offline() {
        let mut provider = Provider::new(config());
        provider.start();
        provider.send_update(vec![1, 2, 3]).await.unwrap();
        provider
            .send_awareness(&AwarenessUpdate::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let metrics = provider.metrics();
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.frames_sent, 0);
        provider.shutdown().await;
    }
}
