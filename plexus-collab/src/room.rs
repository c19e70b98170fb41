//! Room coordinator: one actor per live document.
//!
//! ```text
//! connection A ─┐                        ┌──▶ outbox A ──▶ connection A
//! connection B ─┼─▶ RoomCommand queue ──▶ Room actor ─┼──▶ outbox B ──▶ connection B
//! connection C ─┘   (strict FIFO)         │           └──▶ outbox C ──▶ connection C
//!                                         ├── yrs::Doc (authoritative)
//!                                         ├── PresenceState
//!                                         ├── UpdateBuffer ──(tick)──▶ PersistenceEngine
//!                                         └── SessionService (shared)
//! ```
//!
//! A room's document and presence are touched only by its own actor, so
//! messages for one room are applied in arrival order while different
//! rooms run in parallel. When the last member leaves, the room saves its
//! full state, drains its queue and retires itself from the registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{AtomicBroadcastStats, BroadcastGroup, Outbound};
use crate::presence::PresenceState;
use crate::protocol::{
    AwarenessUpdate, CustomMessage, ErrorCode, Frame, MessageKind, Notification, ProtocolError, Role,
    SyncMessage,
};
use crate::server::ServerCounters;
use crate::session::{EndReason, SessionError, SessionService};
use crate::storage::{PendingUpdate, PersistenceEngine, StoreError, UpdateBuffer};

/// v1 encoding of an update that carries nothing.
const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Attempts to join before giving up on a room that keeps closing.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Capacity of the per-room command queue
    pub command_queue: usize,
    /// Consecutive dropped sends before a member is evicted
    pub max_consecutive_drops: u32,
    pub autosave_interval: Duration,
    /// Presence entries not refreshed within this window are removed
    pub awareness_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            command_queue: 1024,
            max_consecutive_drops: 64,
            autosave_interval: Duration::from_secs(2),
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            command_queue: 64,
            max_consecutive_drops: 8,
            autosave_interval: Duration::from_millis(50),
            awareness_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomError {
    /// The room is shutting down; retry against a fresh one
    Closing,
    Session(SessionError),
    Store(StoreError),
    Protocol(ProtocolError),
    Unavailable(String),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Closing => write!(f, "Room is closing"),
            RoomError::Session(e) => write!(f, "Session error: {e}"),
            RoomError::Store(e) => write!(f, "Store error: {e}"),
            RoomError::Protocol(e) => write!(f, "Protocol error: {e}"),
            RoomError::Unavailable(e) => write!(f, "Room unavailable: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<SessionError> for RoomError {
    fn from(e: SessionError) -> Self {
        RoomError::Session(e)
    }
}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        RoomError::Store(e)
    }
}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        RoomError::Protocol(e)
    }
}

/// A connection asking to become a member.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub conn_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
    pub outbox: mpsc::Sender<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub session_id: Uuid,
    pub color: String,
}

/// Point-in-time view of a room, for stats and tests.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub document_id: Uuid,
    pub members: usize,
    pub presence: usize,
    pub pending_updates: usize,
    pub state_vector: Vec<u8>,
    pub state: Vec<u8>,
}

pub enum RoomCommand {
    Join { request: JoinRequest, reply: oneshot::Sender<Result<JoinAck, RoomError>> },
    Frame { conn_id: Uuid, frame: Frame },
    Leave { conn_id: Uuid },
    Notify { notification: Notification },
    Inspect { reply: oneshot::Sender<RoomSnapshot> },
    Shutdown,
}

/// Sending side of a room's queue.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    document_id: Uuid,
    generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn join(&self, request: JoinRequest) -> Result<JoinAck, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Join { request, reply })
            .await
            .map_err(|_| RoomError::Closing)?;
        rx.await.map_err(|_| RoomError::Closing)?
    }

    pub async fn send_frame(&self, conn_id: Uuid, frame: Frame) -> Result<(), RoomError> {
        self.tx
            .send(RoomCommand::Frame { conn_id, frame })
            .await
            .map_err(|_| RoomError::Closing)
    }

    pub async fn leave(&self, conn_id: Uuid) {
        let _ = self.tx.send(RoomCommand::Leave { conn_id }).await;
    }

    pub async fn notify(&self, notification: Notification) {
        let _ = self.tx.send(RoomCommand::Notify { notification }).await;
    }

    pub async fn inspect(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomCommand::Inspect { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RoomCommand::Shutdown).await;
    }
}

/// Shared services every room needs.
#[derive(Clone)]
pub struct RoomDeps {
    pub config: RoomConfig,
    pub engine: Option<Arc<PersistenceEngine>>,
    pub sessions: Arc<SessionService>,
    pub counters: Arc<ServerCounters>,
    pub broadcast_stats: Arc<AtomicBroadcastStats>,
}

struct Member {
    user_id: String,
    user_name: String,
    role: Role,
    /// Awareness client ids announced through this connection
    awareness_clients: HashSet<u64>,
}

struct Room {
    document_id: Uuid,
    generation: u64,
    doc: Doc,
    presence: PresenceState,
    group: BroadcastGroup,
    members: HashMap<Uuid, Member>,
    buffer: UpdateBuffer,
    /// Members evicted by a send, awaiting leave cleanup
    evicted: Vec<Uuid>,
    deps: RoomDeps,
    registry: Weak<RoomRegistry>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut tick = tokio::time::interval(self.deps.config.autosave_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        None | Some(RoomCommand::Shutdown) => break,
                        Some(command) => self.handle(command).await,
                    }
                    while let Some(conn_id) = self.evicted.pop() {
                        self.on_leave(conn_id).await;
                    }
                    if self.members.is_empty() {
                        break;
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.close(&mut rx).await;
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { request, reply } => {
                let result = self.on_join(request).await;
                let _ = reply.send(result);
            }
            RoomCommand::Frame { conn_id, frame } => self.on_frame(conn_id, frame).await,
            RoomCommand::Leave { conn_id } => self.on_leave(conn_id).await,
            RoomCommand::Notify { notification } => self.on_notify(notification).await,
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Shutdown => {}
        }
    }

    // ─── Membership ───────────────────────────────────────────────────

    async fn on_join(&mut self, request: JoinRequest) -> Result<JoinAck, RoomError> {
        let ticket = self
            .deps
            .sessions
            .join(self.document_id, &request.user_id, &request.user_name, request.role)
            .await?;

        let conn_id = request.conn_id;
        self.group.add_member(conn_id, request.outbox);
        self.members.insert(
            conn_id,
            Member {
                user_id: request.user_id.clone(),
                user_name: request.user_name.clone(),
                role: request.role,
                awareness_clients: HashSet::new(),
            },
        );

        // Bootstrap: identity, then our state vector, then presence.
        self.send_notification(
            Some(conn_id),
            &Notification::Authenticated {
                session_id: ticket.session_id,
                user_id: request.user_id.clone(),
                role: request.role,
                color: ticket.color.clone(),
            },
        );
        let sv = self.doc.transact().state_vector().encode_v1();
        self.send_frame(Some(conn_id), &Frame::sync(&SyncMessage::Step1(sv)));
        let presence = self.presence.snapshot();
        if !presence.is_empty() {
            self.send_awareness(Some(conn_id), &presence);
        }

        if !ticket.rejoined {
            self.broadcast_notification(
                Some(&conn_id),
                &Notification::UserJoined {
                    user_id: request.user_id.clone(),
                    name: request.user_name.clone(),
                    color: ticket.color.clone(),
                    role: request.role,
                },
            );
        }
        log::info!(
            "{} joined document {} ({} members)",
            request.user_id,
            self.document_id,
            self.members.len()
        );
        Ok(JoinAck { session_id: ticket.session_id, color: ticket.color })
    }

    async fn on_leave(&mut self, conn_id: Uuid) {
        self.group.remove_member(&conn_id);
        let Some(member) = self.members.remove(&conn_id) else { return };

        let clients: Vec<u64> = member.awareness_clients.into_iter().collect();
        let removal = self.presence.remove_clients(&clients);
        if !removal.is_empty() {
            self.send_awareness_except(None, &removal);
        }

        match self.deps.sessions.leave(self.document_id, &member.user_id).await {
            Ok(outcome) => {
                for element_id in outcome.released_locks {
                    self.broadcast_notification(None, &Notification::LockChanged { element_id, holder: None });
                }
                if outcome.went_offline {
                    self.broadcast_notification(
                        None,
                        &Notification::UserLeft { user_id: member.user_id.clone() },
                    );
                }
            }
            Err(e) => log::warn!("Session leave for {} failed: {e}", member.user_id),
        }
        log::info!("{} left document {}", member.user_id, self.document_id);
    }

    async fn on_notify(&mut self, notification: Notification) {
        let session_ended = matches!(notification, Notification::SessionEnded { .. });
        self.broadcast_notification(None, &notification);
        if !session_ended {
            return;
        }
        // Members still connected continue in a fresh session.
        let members: Vec<(String, String, Role)> = self
            .members
            .values()
            .map(|m| (m.user_id.clone(), m.user_name.clone(), m.role))
            .collect();
        for (user_id, name, role) in members {
            if let Err(e) = self.deps.sessions.join(self.document_id, &user_id, &name, role).await {
                log::warn!("Could not move {user_id} into a new session: {e}");
            }
        }
    }

    // ─── Frames ───────────────────────────────────────────────────────

    async fn on_frame(&mut self, conn_id: Uuid, frame: Frame) {
        let Some(member) = self.members.get(&conn_id) else {
            log::debug!("Dropping frame from non-member {conn_id}");
            return;
        };
        let (user_id, role) = (member.user_id.clone(), member.role);
        if let Err(e) = self
            .deps
            .sessions
            .with_session(self.document_id, |s, now| s.record_message(&user_id, now))
            .await
        {
            log::debug!("Message from {user_id} not counted: {e}");
        }

        match frame.kind {
            MessageKind::Sync => match frame.as_sync() {
                Ok(message) => self.on_sync(conn_id, &user_id, role, message).await,
                Err(e) => self.send_error(conn_id, ErrorCode::InvalidFrame, &e.to_string()),
            },
            MessageKind::Awareness => match frame.as_awareness() {
                Ok(update) => self.on_awareness(conn_id, update),
                Err(e) => self.send_error(conn_id, ErrorCode::InvalidFrame, &e.to_string()),
            },
            MessageKind::Custom => match frame.as_custom() {
                Ok(message) => self.on_custom(conn_id, &user_id, role, message).await,
                Err(e) => self.send_error(conn_id, ErrorCode::InvalidFrame, &e.to_string()),
            },
            MessageKind::Auth => {
                self.send_error(conn_id, ErrorCode::AlreadyAuthenticated, "already authenticated")
            }
            MessageKind::Error | MessageKind::Notification => {
                log::debug!("Ignoring {:?} frame from client {conn_id}", frame.kind);
            }
        }
    }

    async fn on_sync(&mut self, conn_id: Uuid, user_id: &str, role: Role, message: SyncMessage) {
        match message {
            SyncMessage::Step1(sv) => {
                let diff = match StateVector::decode_v1(&sv) {
                    Ok(sv) => self.doc.transact().encode_diff_v1(&sv),
                    Err(e) => {
                        self.send_error(conn_id, ErrorCode::InvalidFrame, &e.to_string());
                        return;
                    }
                };
                self.send_frame(Some(conn_id), &Frame::sync(&SyncMessage::Step2(diff)));
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                if !role.can_edit() {
                    self.send_error(conn_id, ErrorCode::ReadOnly, "viewers cannot modify the document");
                    return;
                }
                if update.as_slice() == EMPTY_UPDATE {
                    return;
                }
                if let Err(e) = self.apply(&update) {
                    log::warn!("Rejected update from {user_id} in {}: {e}", self.document_id);
                    self.send_error(conn_id, ErrorCode::InvalidUpdate, &e);
                    return;
                }
                self.send_frame_except(Some(&conn_id), &Frame::sync(&SyncMessage::Update(update.clone())));
                if self.deps.engine.is_some() {
                    self.buffer.push(PendingUpdate::new(update, Some(user_id.to_string()), "remote"));
                }
                if let Err(e) = self
                    .deps
                    .sessions
                    .with_session(self.document_id, |s, now| s.record_edit(user_id, now))
                    .await
                {
                    log::debug!("Edit by {user_id} not counted: {e}");
                }
            }
        }
    }

    fn apply(&mut self, update: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn on_awareness(&mut self, conn_id: Uuid, update: AwarenessUpdate) {
        let accepted = self.presence.apply(&update, Instant::now());
        if accepted.is_empty() {
            return;
        }
        if let Some(member) = self.members.get_mut(&conn_id) {
            for entry in &accepted.entries {
                if entry.state.is_some() {
                    member.awareness_clients.insert(entry.client_id);
                } else {
                    member.awareness_clients.remove(&entry.client_id);
                }
            }
        }
        self.send_awareness_except(Some(&conn_id), &accepted);
    }

    async fn on_custom(&mut self, conn_id: Uuid, user_id: &str, role: Role, message: CustomMessage) {
        let document_id = self.document_id;
        let sessions = self.deps.sessions.clone();
        match message {
            CustomMessage::Ping { ts } => {
                if let Ok(frame) = Frame::custom(&CustomMessage::Pong { ts }) {
                    self.send_frame(Some(conn_id), &frame);
                }
            }
            CustomMessage::Pong { .. } => {}
            CustomMessage::Cursor { x, y } => {
                if sessions.with_session(document_id, |s, now| s.set_cursor(user_id, x, y, now)).await.is_ok() {
                    self.broadcast_notification(
                        Some(&conn_id),
                        &Notification::CursorMoved { user_id: user_id.to_string(), x, y },
                    );
                }
            }
            CustomMessage::Comment { element_id, text } => {
                match sessions
                    .with_session(document_id, |s, now| s.add_comment(&element_id, user_id, &text, now))
                    .await
                {
                    Ok(comment) => self.broadcast_notification(None, &Notification::CommentAdded { comment }),
                    Err(e) => self.send_error(conn_id, ErrorCode::InvalidFrame, &e.to_string()),
                }
            }
            CustomMessage::Lock { element_id } => {
                if !role.can_edit() {
                    self.send_error(conn_id, ErrorCode::ReadOnly, "viewers cannot lock elements");
                    return;
                }
                match sessions
                    .with_session(document_id, |s, now| s.acquire_lock(&element_id, user_id, now))
                    .await
                {
                    Ok(changed) => {
                        let notification = Notification::LockChanged {
                            element_id,
                            holder: Some(user_id.to_string()),
                        };
                        if changed {
                            self.broadcast_notification(None, &notification);
                        } else {
                            self.send_notification(Some(conn_id), &notification);
                        }
                    }
                    Err(e) => self.send_error(conn_id, ErrorCode::LockHeld, &e.to_string()),
                }
            }
            CustomMessage::Unlock { element_id } => {
                match sessions
                    .with_session(document_id, |s, now| s.release_lock(&element_id, user_id, now))
                    .await
                {
                    Ok(true) => self.broadcast_notification(
                        None,
                        &Notification::LockChanged { element_id, holder: None },
                    ),
                    Ok(false) => {}
                    Err(e) => self.send_error(conn_id, ErrorCode::LockHeld, &e.to_string()),
                }
            }
            CustomMessage::ConflictResolved { element_id } => {
                log::debug!("{user_id} resolved a conflict on {element_id}");
                if let Err(e) = sessions
                    .with_session(document_id, |s, now| s.record_conflict_resolved(user_id, now))
                    .await
                {
                    log::debug!("Resolution by {user_id} not counted: {e}");
                }
            }
        }
    }

    // ─── Timers / persistence ─────────────────────────────────────────

    fn on_tick(&mut self) {
        let expired = self.presence.expire(Instant::now(), self.deps.config.awareness_timeout);
        if !expired.is_empty() {
            for member in self.members.values_mut() {
                for entry in &expired.entries {
                    member.awareness_clients.remove(&entry.client_id);
                }
            }
            self.send_awareness_except(None, &expired);
        }
        self.flush();
    }

    fn flush(&mut self) {
        let Some(engine) = self.deps.engine.clone() else { return };
        match self.buffer.flush(&engine, self.document_id) {
            Ok(0) => {}
            Ok(written) => {
                self.deps.counters.persisted_updates.fetch_add(written as u64, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Autosave of {} failed, will retry: {e}", self.document_id);
                self.deps.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Write the full state so the next room for this document starts
    /// from it. Falls back to flushing the log if the save fails.
    fn persist_final(&mut self) {
        let Some(engine) = self.deps.engine.clone() else { return };
        let state = self.doc.transact().encode_state_as_update_v1(&StateVector::default());
        match engine.save_full_state(self.document_id, &state) {
            Ok(()) => self.buffer.clear(),
            Err(e) => {
                log::error!("Final save of {} failed: {e}", self.document_id);
                self.deps.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                self.flush();
            }
        }
    }

    /// Persist, then refuse new work. The queue stays open until the final
    /// save lands, so a replacement room cannot load an older state.
    async fn close(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) {
        self.persist_final();
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(Err(RoomError::Closing));
                }
                RoomCommand::Inspect { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                _ => {}
            }
        }
        let remaining: Vec<Uuid> = self.members.keys().copied().collect();
        for conn_id in remaining {
            self.on_leave(conn_id).await;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.retire(self.document_id, self.generation).await;
        }
        log::info!("Room for {} closed", self.document_id);
    }

    fn snapshot(&self) -> RoomSnapshot {
        let txn = self.doc.transact();
        RoomSnapshot {
            document_id: self.document_id,
            members: self.members.len(),
            presence: self.presence.len(),
            pending_updates: self.buffer.len(),
            state_vector: txn.state_vector().encode_v1(),
            state: txn.encode_state_as_update_v1(&StateVector::default()),
        }
    }

    // ─── Outbound helpers ─────────────────────────────────────────────

    fn deliver(&mut self, target: Option<Uuid>, except: Option<&Uuid>, bytes: Outbound) {
        let evicted = match target {
            Some(conn_id) => self.group.send_to(&conn_id, bytes),
            None => self.group.broadcast_except(except, bytes),
        };
        self.evicted.extend(evicted);
    }

    fn send_frame(&mut self, target: Option<Uuid>, frame: &Frame) {
        self.deliver(target, None, Arc::new(frame.encode()));
    }

    fn send_frame_except(&mut self, except: Option<&Uuid>, frame: &Frame) {
        self.deliver(None, except, Arc::new(frame.encode()));
    }

    fn send_notification(&mut self, target: Option<Uuid>, notification: &Notification) {
        match Frame::notification(notification) {
            Ok(frame) => self.send_frame(target, &frame),
            Err(e) => log::error!("Failed to encode notification: {e}"),
        }
    }

    fn broadcast_notification(&mut self, except: Option<&Uuid>, notification: &Notification) {
        match Frame::notification(notification) {
            Ok(frame) => self.send_frame_except(except, &frame),
            Err(e) => log::error!("Failed to encode notification: {e}"),
        }
    }

    fn send_awareness(&mut self, target: Option<Uuid>, update: &AwarenessUpdate) {
        match Frame::awareness(update) {
            Ok(frame) => self.send_frame(target, &frame),
            Err(e) => log::error!("Failed to encode awareness: {e}"),
        }
    }

    fn send_awareness_except(&mut self, except: Option<&Uuid>, update: &AwarenessUpdate) {
        match Frame::awareness(update) {
            Ok(frame) => self.send_frame_except(except, &frame),
            Err(e) => log::error!("Failed to encode awareness: {e}"),
        }
    }

    fn send_error(&mut self, conn_id: Uuid, code: ErrorCode, message: &str) {
        match Frame::error(code, message) {
            Ok(frame) => self.send_frame(Some(conn_id), &frame),
            Err(e) => log::error!("Failed to encode error: {e}"),
        }
    }
}

/// Maps document ids to live rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    next_generation: AtomicU64,
    deps: RoomDeps,
    self_ref: Weak<RoomRegistry>,
}

impl RoomRegistry {
    pub fn new(deps: RoomDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            rooms: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            deps,
            self_ref: weak.clone(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.deps.sessions
    }

    /// Join the room for `document_id`, spawning it if needed. Retries when
    /// the room it reached was in the middle of closing.
    pub async fn join(&self, document_id: Uuid, request: JoinRequest) -> Result<(RoomHandle, JoinAck), RoomError> {
        let mut last_error = RoomError::Closing;
        for _ in 0..JOIN_ATTEMPTS {
            let handle = self.get_or_spawn(document_id).await?;
            match handle.join(request.clone()).await {
                Ok(ack) => return Ok((handle, ack)),
                Err(RoomError::Closing) => {
                    self.retire(document_id, handle.generation).await;
                    last_error = RoomError::Closing;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn get_or_spawn(&self, document_id: Uuid) -> Result<RoomHandle, RoomError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&document_id) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(handle) = rooms.get(&document_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let doc = Doc::new();
        if let Some(engine) = &self.deps.engine {
            let state = engine.load_state(document_id)?;
            let update = Update::decode_v1(&state).map_err(|e| RoomError::Unavailable(e.to_string()))?;
            doc.transact_mut()
                .apply_update(update)
                .map_err(|e| RoomError::Unavailable(e.to_string()))?;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.deps.config.command_queue.max(1));
        let room = Room {
            document_id,
            generation,
            doc,
            presence: PresenceState::new(),
            group: BroadcastGroup::with_stats(
                self.deps.config.max_consecutive_drops,
                self.deps.broadcast_stats.clone(),
            ),
            members: HashMap::new(),
            buffer: UpdateBuffer::new(),
            evicted: Vec::new(),
            deps: self.deps.clone(),
            registry: self.self_ref.clone(),
        };
        tokio::spawn(room.run(rx));

        let handle = RoomHandle { document_id, generation, tx };
        rooms.insert(document_id, handle.clone());
        self.deps.counters.rooms_opened.fetch_add(1, Ordering::Relaxed);
        log::info!("Opened room for {document_id}");
        Ok(handle)
    }

    /// Forget a room, unless it has already been replaced.
    pub async fn retire(&self, document_id: Uuid, generation: u64) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&document_id).map(|h| h.generation) == Some(generation) {
            rooms.remove(&document_id);
        }
    }

    pub async fn get(&self, document_id: Uuid) -> Option<RoomHandle> {
        self.rooms.read().await.get(&document_id).cloned()
    }

    pub async fn live_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    pub async fn notify(&self, document_id: Uuid, notification: Notification) {
        if let Some(handle) = self.get(document_id).await {
            handle.notify(notification).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// Helper for maintenance: end a session and tell its room, if any.
pub async fn end_session(registry: &RoomRegistry, document_id: Uuid, reason: EndReason) {
    if let Some(session) = registry.sessions().end(document_id, reason).await {
        registry
            .notify(
                document_id,
                Notification::SessionEnded {
                    session_id: session.session_id,
                    reason: reason.as_str().to_string(),
                },
            )
            .await;
    }
}
