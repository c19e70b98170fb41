//! WebSocket sync server.
//!
//! ```text
//! TcpListener ──accept──▶ handle_connection (one task per socket)
//!                              │  AUTH gate, heartbeat, outbox pump
//!                              ▼
//!                         RoomRegistry ──▶ Room actor per document
//!                              │
//!                              ▼
//!             PersistenceEngine (RocksDB)   SessionService
//!                              ▲
//!                   maintenance task: compaction, backups, idle sweep
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{AllowAll, Authenticator};
use crate::broadcast::{AtomicBroadcastStats, Outbound};
use crate::protocol::{ErrorCode, Frame, MessageKind, Notification, ProtocolError, MAX_FRAME_SIZE};
use crate::room::{JoinRequest, RoomConfig, RoomDeps, RoomError, RoomHandle, RoomRegistry};
use crate::session::{SessionConfig, SessionError, SessionService};
use crate::storage::{DocumentStore, PersistenceConfig, PersistenceEngine, StoreConfig, StoreError};

/// Holder name used for maintenance locks.
const MAINTENANCE_HOLDER: &str = "maintenance";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames larger than this are rejected
    pub max_frame_size: usize,
    /// Outbound queue depth per connection
    pub member_queue: usize,
    pub heartbeat_interval: Duration,
    /// Close the connection after this long without inbound traffic
    pub heartbeat_timeout: Duration,
    pub compaction_interval: Duration,
    pub backup_interval: Duration,
    pub sweep_interval: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub room: RoomConfig,
    pub persistence: PersistenceConfig,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            member_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            compaction_interval: Duration::from_secs(60),
            backup_interval: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            storage_path: None,
            room: RoomConfig::default(),
            persistence: PersistenceConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Short timers on a loopback address.
    pub fn for_testing(port: u16) -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{port}"),
            max_frame_size: 64 * 1024,
            member_queue: 64,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            compaction_interval: Duration::from_millis(200),
            backup_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(200),
            storage_path: None,
            room: RoomConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
            session: SessionConfig::default(),
        }
    }

    /// Defaults overridden by `PLEXUS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!("Ignoring {key}={raw}: not a valid value");
                    None
                }
            }
        }

        let mut config = Self::default();
        if let Some(bind) = lookup("PLEXUS_BIND") {
            config.bind_addr = bind;
        }
        if let Some(path) = lookup("PLEXUS_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(size) = parsed(&lookup, "PLEXUS_MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "PLEXUS_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
            config.heartbeat_timeout = Duration::from_secs(secs * 3);
        }
        if let Some(max) = parsed(&lookup, "PLEXUS_MAX_PARTICIPANTS") {
            config.session.max_participants = max;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "PLEXUS_IDLE_TIMEOUT_SECS") {
            config.session.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = parsed(&lookup, "PLEXUS_COMPACTION_THRESHOLD") {
            config.persistence.compaction_threshold = threshold;
        }
        if let Some(cap) = parsed(&lookup, "PLEXUS_SNAPSHOT_CAP") {
            config.persistence.snapshot_cap = cap;
        }
        config
    }
}

/// Lock-free counters updated from every connection and room.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages: AtomicU64,
    pub bytes: AtomicU64,
    pub rooms_opened: AtomicU64,
    pub persisted_updates: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub compactions: AtomicU64,
    pub backups: AtomicU64,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rooms_opened: u64,
    pub active_sessions: usize,
    pub messages_dropped: u64,
    pub members_evicted: u64,
    pub persisted_updates: u64,
    pub persistence_failures: u64,
    pub compactions: u64,
    pub backups: u64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    counters: Arc<ServerCounters>,
    authenticator: Arc<dyn Authenticator>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionService>,
    engine: Option<Arc<PersistenceEngine>>,
    counters: Arc<ServerCounters>,
    broadcast_stats: Arc<AtomicBroadcastStats>,
    authenticator: Arc<dyn Authenticator>,
}

impl SyncServer {
    /// Create a server, opening the store if a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let engine = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig { path: path.clone(), ..StoreConfig::default() })?;
                Some(Arc::new(PersistenceEngine::new(store, config.persistence.clone())))
            }
            None => None,
        };
        Ok(Self::with_engine(config, engine))
    }

    /// Create a server around an already opened engine.
    pub fn with_engine(config: ServerConfig, engine: Option<Arc<PersistenceEngine>>) -> Self {
        let counters = Arc::new(ServerCounters::default());
        let broadcast_stats = Arc::new(AtomicBroadcastStats::new());
        let sessions = Arc::new(SessionService::new(config.session.clone(), engine.clone()));
        let registry = RoomRegistry::new(RoomDeps {
            config: config.room.clone(),
            engine: engine.clone(),
            sessions: sessions.clone(),
            counters: counters.clone(),
            broadcast_stats: broadcast_stats.clone(),
        });
        Self {
            config,
            registry,
            sessions,
            engine,
            counters,
            broadcast_stats,
            authenticator: Arc::new(AllowAll),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn engine(&self) -> Option<&Arc<PersistenceEngine>> {
        self.engine.as_ref()
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            total_connections: c.connections_total.load(Ordering::Relaxed),
            active_connections: c.connections_active.load(Ordering::Relaxed),
            total_messages: c.messages.load(Ordering::Relaxed),
            total_bytes: c.bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.len().await,
            rooms_opened: c.rooms_opened.load(Ordering::Relaxed),
            active_sessions: self.sessions.active_count().await,
            messages_dropped: self.broadcast_stats.dropped(),
            members_evicted: self.broadcast_stats.evicted(),
            persisted_updates: c.persisted_updates.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            backups: c.backups.load(Ordering::Relaxed),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.spawn_maintenance();

        let shared = Shared {
            config: self.config.clone(),
            registry: self.registry.clone(),
            counters: self.counters.clone(),
            authenticator: self.authenticator.clone(),
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stop every room. Each persists its final state before exiting.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let counters = shared.counters.clone();
        counters.connections_total.fetch_add(1, Ordering::Relaxed);
        counters.connections_active.fetch_add(1, Ordering::Relaxed);

        let conn_id = Uuid::new_v4();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(shared.config.member_queue.max(1));
        // Held until the connection joins a room; afterwards only the
        // room's broadcast group owns a sender.
        let mut outbox_tx = Some(outbox_tx);
        let mut room: Option<RoomHandle> = None;
        let mut last_inbound = Instant::now();
        let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let Some(msg) = msg else { break };
                        last_inbound = Instant::now();
                        match msg? {
                            Message::Binary(data) => {
                                let bytes: Vec<u8> = data.into();
                                counters.messages.fetch_add(1, Ordering::Relaxed);
                                counters.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);

                                let frame = match Frame::decode(&bytes, shared.config.max_frame_size) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        let code = match e {
                                            ProtocolError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
                                            _ => ErrorCode::InvalidFrame,
                                        };
                                        log::warn!("Rejected frame from {addr}: {e}");
                                        ws_sender.send(Message::Binary(Frame::error(code, e.to_string())?.encode().into())).await?;
                                        if room.is_none() {
                                            break;
                                        }
                                        continue;
                                    }
                                };

                                match &room {
                                    Some(handle) => {
                                        if handle.send_frame(conn_id, frame).await.is_err() {
                                            log::warn!("Room for {} went away under {addr}", handle.document_id());
                                            break;
                                        }
                                    }
                                    None => {
                                        let joined = Self::authenticate(&shared, conn_id, &frame, &mut outbox_tx).await;
                                        match joined {
                                            Ok(handle) => room = Some(handle),
                                            Err((code, message)) => {
                                                log::warn!("Refusing {addr}: {message}");
                                                let reply = Frame::error(code, message)?.encode();
                                                ws_sender.send(Message::Binary(reply.into())).await?;
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                            Message::Ping(payload) => {
                                ws_sender.send(Message::Pong(payload)).await?;
                            }
                            Message::Close(_) => break,
                            Message::Text(_) => {
                                let reply = Frame::error(ErrorCode::InvalidFrame, "text frames are not supported")?.encode();
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                            _ => {}
                        }
                    }

                    outbound = outbox_rx.recv() => {
                        match outbound {
                            Some(bytes) => {
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                            None => {
                                log::warn!("Connection {addr} evicted for falling behind");
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        if last_inbound.elapsed() > shared.config.heartbeat_timeout {
                            log::info!("Heartbeat timeout for {addr}");
                            break;
                        }
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(handle) = room {
            handle.leave(conn_id).await;
        }
        let _ = ws_sender.close().await;
        counters.connections_active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} closed");
        result
    }

    /// First frame of a connection: must be AUTH and must pass the
    /// authenticator and the session cap.
    async fn authenticate(
        shared: &Shared,
        conn_id: Uuid,
        frame: &Frame,
        outbox: &mut Option<mpsc::Sender<Outbound>>,
    ) -> Result<RoomHandle, (ErrorCode, String)> {
        if frame.kind != MessageKind::Auth {
            return Err((ErrorCode::NotAuthenticated, format!("expected AUTH, got {:?}", frame.kind)));
        }
        let request = frame
            .as_auth()
            .map_err(|e| (ErrorCode::InvalidFrame, e.to_string()))?;
        let grant = shared
            .authenticator
            .authenticate(&request)
            .map_err(|e| (ErrorCode::Unauthorized, e.to_string()))?;
        let Some(sender) = outbox.take() else {
            return Err((ErrorCode::AlreadyAuthenticated, "already authenticated".into()));
        };

        let join = JoinRequest {
            conn_id,
            user_id: grant.user_id,
            user_name: grant.user_name,
            role: grant.role,
            outbox: sender,
        };
        match shared.registry.join(request.document_id, join).await {
            Ok((handle, _ack)) => Ok(handle),
            Err(RoomError::Session(SessionError::Full { max })) => {
                Err((ErrorCode::SessionFull, format!("session is full ({max} participants)")))
            }
            Err(e) => Err((ErrorCode::RoomUnavailable, e.to_string())),
        }
    }

    fn spawn_maintenance(&self) {
        let maintenance = Maintenance {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            engine: self.engine.clone(),
            counters: self.counters.clone(),
            compacting: Arc::new(AtomicBool::new(false)),
            backing_up: Arc::new(AtomicBool::new(false)),
            sweeping: Arc::new(AtomicBool::new(false)),
            backed_up: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };
        let config = self.config.clone();
        tokio::spawn(async move { maintenance.run(config).await });
    }
}

/// Periodic background work, independent of request handling.
#[derive(Clone)]
struct Maintenance {
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionService>,
    engine: Option<Arc<PersistenceEngine>>,
    counters: Arc<ServerCounters>,
    compacting: Arc<AtomicBool>,
    backing_up: Arc<AtomicBool>,
    sweeping: Arc<AtomicBool>,
    /// Update count of each document at its last backup
    backed_up: Arc<tokio::sync::Mutex<HashMap<Uuid, u64>>>,
}

impl Maintenance {
    async fn run(self, config: ServerConfig) {
        let mut compaction = tokio::time::interval(config.compaction_interval);
        let mut backup = tokio::time::interval(config.backup_interval);
        let mut sweep = tokio::time::interval(config.sweep_interval);
        for timer in [&mut compaction, &mut backup, &mut sweep] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = compaction.tick() => self.spawn_guarded(&self.compacting, Self::compaction_pass),
                _ = backup.tick() => self.spawn_guarded(&self.backing_up, Self::backup_pass),
                _ = sweep.tick() => self.spawn_guarded(&self.sweeping, Self::sweep_pass),
            }
        }
    }

    /// Run `pass` in its own task unless the previous run is still going.
    fn spawn_guarded<F, Fut>(&self, flag: &Arc<AtomicBool>, pass: F)
    where
        F: FnOnce(Maintenance) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if flag.swap(true, Ordering::AcqRel) {
            log::debug!("Maintenance pass still running, skipping tick");
            return;
        }
        let flag = flag.clone();
        let run = pass(self.clone());
        tokio::spawn(async move {
            run.await;
            flag.store(false, Ordering::Release);
        });
    }

    async fn compaction_pass(self) {
        let Some(engine) = self.engine.clone() else { return };
        let counters = self.counters.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let mut compacted = 0;
            for doc_id in engine.document_ids()? {
                if !engine.needs_compaction(doc_id)? {
                    continue;
                }
                match engine.compact(doc_id, MAINTENANCE_HOLDER) {
                    Ok(report) => {
                        log::info!("Compacted {doc_id}: folded {}, retained {}", report.folded, report.retained);
                        compacted += 1;
                    }
                    Err(StoreError::Locked { holder }) => {
                        log::debug!("Skipping compaction of {doc_id}, locked by {holder}");
                    }
                    Err(e) => log::error!("Compaction of {doc_id} failed: {e}"),
                }
            }
            Ok(compacted)
        })
        .await;

        match result {
            Ok(Ok(compacted)) => {
                counters.compactions.fetch_add(compacted as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => log::error!("Compaction pass failed: {e}"),
            Err(e) => log::error!("Compaction task panicked: {e}"),
        }
    }

    async fn backup_pass(self) {
        let Some(engine) = self.engine.clone() else { return };
        let documents = self.registry.live_documents().await;
        let mut backed_up = self.backed_up.lock().await;
        for doc_id in documents {
            let total = match engine.metadata(doc_id) {
                Ok(Some(meta)) => meta.total_updates,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Backup of {doc_id} failed: {e}");
                    continue;
                }
            };
            if backed_up.get(&doc_id) == Some(&total) {
                continue;
            }
            match engine.create_snapshot(doc_id, MAINTENANCE_HOLDER, "automatic backup") {
                Ok(_) => {
                    backed_up.insert(doc_id, total);
                    self.counters.backups.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::error!("Backup of {doc_id} failed: {e}"),
            }
        }
    }

    async fn sweep_pass(self) {
        for session in self.sessions.sweep().await {
            log::info!("Session {} of {} ended by idle sweep", session.session_id, session.document_id);
            let reason = session.end_reason.map(|r| r.as_str()).unwrap_or("idle");
            self.registry
                .notify(
                    session.document_id,
                    Notification::SessionEnded { session_id: session.session_id, reason: reason.to_string() },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert!(config.heartbeat_timeout > config.heartbeat_interval);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_env() {
        let vars: HashMap<&str, &str> = [
            ("PLEXUS_BIND", "0.0.0.0:7000"),
            ("PLEXUS_STORAGE_PATH", "/var/lib/plexus"),
            ("PLEXUS_HEARTBEAT_SECS", "10"),
            ("PLEXUS_MAX_PARTICIPANTS", "5"),
            ("PLEXUS_COMPACTION_THRESHOLD", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/plexus")));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.session.max_participants, 5);
        // malformed values keep the default
        assert_eq!(config.persistence.compaction_threshold, PersistenceConfig::default().compaction_threshold);
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let server = SyncServer::new(ServerConfig::for_testing(0)).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_guarded_pass_skips_overlap() {
        let server = SyncServer::new(ServerConfig::for_testing(0)).unwrap();
        let maintenance = Maintenance {
            registry: server.registry.clone(),
            sessions: server.sessions.clone(),
            engine: None,
            counters: server.counters.clone(),
            compacting: Arc::new(AtomicBool::new(false)),
            backing_up: Arc::new(AtomicBool::new(false)),
            sweeping: Arc::new(AtomicBool::new(false)),
            backed_up: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };
        let runs = Arc::new(AtomicU64::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let flag = maintenance.compacting.clone();
        for _ in 0..3 {
            let runs = runs.clone();
            let release_rx = release_rx.clone();
            maintenance.spawn_guarded(&flag, move |_| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let _ = release_tx.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!flag.load(Ordering::SeqCst));
    }
}
