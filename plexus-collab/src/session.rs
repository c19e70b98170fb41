//! Collaboration sessions: who is in a document, what they did, and the
//! session-level state (element locks, comments) layered on top of it.
//!
//! ```text
//!   created ──first join──▶ active ──last leave / idle sweep / end()──▶ ended
//! ```
//!
//! One active session exists per document. Ended sessions are written to
//! the store and kept in memory for `ended_retention` before being purged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{unix_millis, CommentInfo, Role};
use crate::storage::{PersistenceEngine, StoreError};

/// Participant colours, assigned first-free.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0",
    "#f032e6", "#bcf60c", "#008080", "#9a6324", "#800000", "#000075",
];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_participants: usize,
    pub idle_timeout: Duration,
    /// How long ended sessions stay in memory
    pub ended_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_participants: 50,
            idle_timeout: Duration::from_secs(30 * 60),
            ended_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            max_participants: 3,
            idle_timeout: Duration::from_millis(200),
            ended_retention: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    pub edits: u64,
    pub messages: u64,
    pub joined_at: u64,
    pub last_seen_at: u64,
    /// Accumulated online time
    pub active_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    pub status: ParticipantStatus,
    pub cursor: Option<(f64, f64)>,
    pub color: String,
    pub role: Role,
    pub metrics: ParticipantMetrics,
    /// Open connections of this user
    pub connections: u32,
    online_since: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_edits: u64,
    pub total_messages: u64,
    pub conflicts_resolved: u64,
    pub peak_participants: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub max_participants: usize,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Last participant left
    Timeout,
    /// No activity within the idle timeout
    Idle,
    Explicit,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Timeout => "timeout",
            EndReason::Idle => "idle",
            EndReason::Explicit => "explicit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Full { max: usize },
    Ended,
    UnknownParticipant(String),
    LockHeld { element_id: String, holder: String },
    NotLockHolder { element_id: String },
    EmptyComment,
    Store(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Full { max } => write!(f, "Session is full ({max} participants)"),
            SessionError::Ended => write!(f, "Session has ended"),
            SessionError::UnknownParticipant(id) => write!(f, "Unknown participant {id}"),
            SessionError::LockHeld { element_id, holder } => {
                write!(f, "Element {element_id} is locked by {holder}")
            }
            SessionError::NotLockHolder { element_id } => {
                write!(f, "Lock on {element_id} is held by someone else")
            }
            SessionError::EmptyComment => write!(f, "Comment text is empty"),
            SessionError::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e.to_string())
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTicket {
    pub session_id: Uuid,
    pub color: String,
    /// The user already had an entry in this session
    pub rejoined: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The user's last connection closed
    pub went_offline: bool,
    pub released_locks: Vec<String>,
    pub session_ended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub state: SessionState,
    pub participants: BTreeMap<String, Participant>,
    pub statistics: SessionStatistics,
    pub settings: SessionSettings,
    pub created_by: String,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub ended_at: Option<u64>,
    pub end_reason: Option<EndReason>,
    /// element id → user id
    pub locks: BTreeMap<String, String>,
    pub comments: Vec<CommentInfo>,
}

impl Session {
    pub fn new(document_id: Uuid, created_by: &str, settings: SessionSettings, now: u64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            document_id,
            state: SessionState::Created,
            participants: BTreeMap::new(),
            statistics: SessionStatistics::default(),
            settings,
            created_by: created_by.to_string(),
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            end_reason: None,
            locks: BTreeMap::new(),
            comments: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Ended
    }

    pub fn online_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Online)
            .count()
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    fn free_color(&self, exclude: &str) -> String {
        let taken: Vec<&str> = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Online && p.user_id != exclude)
            .map(|p| p.color.as_str())
            .collect();
        PALETTE
            .iter()
            .find(|c| !taken.contains(*c))
            .unwrap_or(&PALETTE[self.participants.len() % PALETTE.len()])
            .to_string()
    }

    /// Add a participant, or refresh one who is already known.
    pub fn join(&mut self, user_id: &str, name: &str, role: Role, now: u64) -> Result<JoinTicket, SessionError> {
        if self.state == SessionState::Ended {
            return Err(SessionError::Ended);
        }
        let rejoined = self.participants.contains_key(user_id);
        let already_online = self
            .participants
            .get(user_id)
            .map(|p| p.status == ParticipantStatus::Online)
            .unwrap_or(false);

        if !already_online && self.online_count() >= self.settings.max_participants {
            return Err(SessionError::Full { max: self.settings.max_participants });
        }

        let color = match self.participants.get(user_id) {
            Some(p) if already_online => p.color.clone(),
            Some(p) => {
                let clash = self.participants.values().any(|o| {
                    o.user_id != user_id && o.status == ParticipantStatus::Online && o.color == p.color
                });
                if clash { self.free_color(user_id) } else { p.color.clone() }
            }
            None => self.free_color(user_id),
        };

        let participant = self.participants.entry(user_id.to_string()).or_insert_with(|| Participant {
            user_id: user_id.to_string(),
            name: name.to_string(),
            status: ParticipantStatus::Offline,
            cursor: None,
            color: color.clone(),
            role,
            metrics: ParticipantMetrics { joined_at: now, ..Default::default() },
            connections: 0,
            online_since: None,
        });
        participant.name = name.to_string();
        participant.role = role;
        participant.color = color.clone();
        participant.connections += 1;
        participant.metrics.last_seen_at = now;
        if participant.status == ParticipantStatus::Offline {
            participant.status = ParticipantStatus::Online;
            participant.online_since = Some(now);
        }

        self.state = SessionState::Active;
        self.last_activity_at = now;
        self.statistics.peak_participants = self.statistics.peak_participants.max(self.online_count());
        Ok(JoinTicket { session_id: self.session_id, color, rejoined })
    }

    /// Close one connection of `user_id`. The session ends once nobody is
    /// online.
    pub fn leave(&mut self, user_id: &str, now: u64) -> Result<LeaveOutcome, SessionError> {
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| SessionError::UnknownParticipant(user_id.to_string()))?;
        let mut outcome = LeaveOutcome::default();

        participant.connections = participant.connections.saturating_sub(1);
        participant.metrics.last_seen_at = now;
        if participant.connections == 0 && participant.status == ParticipantStatus::Online {
            participant.status = ParticipantStatus::Offline;
            if let Some(since) = participant.online_since.take() {
                participant.metrics.active_ms += now.saturating_sub(since);
            }
            outcome.went_offline = true;
            outcome.released_locks = self.release_locks_of(user_id);
        }

        self.last_activity_at = now;
        if self.is_active() && self.online_count() == 0 {
            self.end(EndReason::Timeout, now);
            outcome.session_ended = true;
        }
        Ok(outcome)
    }

    pub fn end(&mut self, reason: EndReason, now: u64) {
        if self.state == SessionState::Ended {
            return;
        }
        for participant in self.participants.values_mut() {
            if let Some(since) = participant.online_since.take() {
                participant.metrics.active_ms += now.saturating_sub(since);
            }
            participant.status = ParticipantStatus::Offline;
            participant.connections = 0;
        }
        self.locks.clear();
        self.state = SessionState::Ended;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        log::info!("Session {} ended ({})", self.session_id, reason.as_str());
    }

    pub fn is_idle(&self, now: u64) -> bool {
        now.saturating_sub(self.last_activity_at) > self.settings.idle_timeout_ms
    }

    fn touch(&mut self, user_id: &str, now: u64) -> Result<&mut Participant, SessionError> {
        self.last_activity_at = now;
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| SessionError::UnknownParticipant(user_id.to_string()))?;
        participant.metrics.last_seen_at = now;
        Ok(participant)
    }

    pub fn record_edit(&mut self, user_id: &str, now: u64) -> Result<(), SessionError> {
        self.touch(user_id, now)?.metrics.edits += 1;
        self.statistics.total_edits += 1;
        Ok(())
    }

    pub fn record_message(&mut self, user_id: &str, now: u64) -> Result<(), SessionError> {
        self.touch(user_id, now)?.metrics.messages += 1;
        self.statistics.total_messages += 1;
        Ok(())
    }

    pub fn record_conflict_resolved(&mut self, user_id: &str, now: u64) -> Result<(), SessionError> {
        self.touch(user_id, now)?;
        self.statistics.conflicts_resolved += 1;
        Ok(())
    }

    pub fn set_cursor(&mut self, user_id: &str, x: f64, y: f64, now: u64) -> Result<(), SessionError> {
        self.touch(user_id, now)?.cursor = Some((x, y));
        Ok(())
    }

    /// Returns true when the lock changed hands.
    pub fn acquire_lock(&mut self, element_id: &str, user_id: &str, now: u64) -> Result<bool, SessionError> {
        self.touch(user_id, now)?;
        match self.locks.get(element_id) {
            Some(holder) if holder == user_id => Ok(false),
            Some(holder) => Err(SessionError::LockHeld {
                element_id: element_id.to_string(),
                holder: holder.clone(),
            }),
            None => {
                self.locks.insert(element_id.to_string(), user_id.to_string());
                Ok(true)
            }
        }
    }

    /// Returns true when a lock was released.
    pub fn release_lock(&mut self, element_id: &str, user_id: &str, now: u64) -> Result<bool, SessionError> {
        self.touch(user_id, now)?;
        match self.locks.get(element_id) {
            None => Ok(false),
            Some(holder) if holder == user_id => {
                self.locks.remove(element_id);
                Ok(true)
            }
            Some(_) => Err(SessionError::NotLockHolder { element_id: element_id.to_string() }),
        }
    }

    fn release_locks_of(&mut self, user_id: &str) -> Vec<String> {
        let released: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, holder)| holder.as_str() == user_id)
            .map(|(element, _)| element.clone())
            .collect();
        for element in &released {
            self.locks.remove(element);
        }
        released
    }

    pub fn lock_holder(&self, element_id: &str) -> Option<&str> {
        self.locks.get(element_id).map(String::as_str)
    }

    pub fn add_comment(
        &mut self,
        element_id: &str,
        user_id: &str,
        text: &str,
        now: u64,
    ) -> Result<CommentInfo, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyComment);
        }
        self.touch(user_id, now)?;
        let comment = CommentInfo {
            id: Uuid::new_v4(),
            element_id: element_id.to_string(),
            author_id: user_id.to_string(),
            text: text.to_string(),
            created_at: now,
        };
        self.comments.push(comment.clone());
        Ok(comment)
    }
}

/// Sessions of every live document, shared by the room actors.
pub struct SessionService {
    config: SessionConfig,
    active: RwLock<HashMap<Uuid, Session>>,
    ended: RwLock<Vec<Session>>,
    engine: Option<Arc<PersistenceEngine>>,
}

impl SessionService {
    pub fn new(config: SessionConfig, engine: Option<Arc<PersistenceEngine>>) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            ended: RwLock::new(Vec::new()),
            engine,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn settings(&self) -> SessionSettings {
        SessionSettings {
            max_participants: self.config.max_participants,
            idle_timeout_ms: self.config.idle_timeout.as_millis() as u64,
        }
    }

    pub async fn join(
        &self,
        document_id: Uuid,
        user_id: &str,
        name: &str,
        role: Role,
    ) -> Result<JoinTicket, SessionError> {
        let now = unix_millis();
        let mut active = self.active.write().await;
        let session = active
            .entry(document_id)
            .or_insert_with(|| Session::new(document_id, user_id, self.settings(), now));
        let ticket = session.join(user_id, name, role, now)?;
        if !ticket.rejoined {
            log::info!("{user_id} joined session {} of {document_id}", ticket.session_id);
        }
        Ok(ticket)
    }

    pub async fn leave(&self, document_id: Uuid, user_id: &str) -> Result<LeaveOutcome, SessionError> {
        let now = unix_millis();
        let mut active = self.active.write().await;
        let session = active
            .get_mut(&document_id)
            .ok_or_else(|| SessionError::UnknownParticipant(user_id.to_string()))?;
        let outcome = session.leave(user_id, now)?;
        if outcome.session_ended {
            if let Some(ended) = active.remove(&document_id) {
                drop(active);
                self.archive(ended).await;
            }
        }
        Ok(outcome)
    }

    /// Run `f` against the active session of a document.
    pub async fn with_session<R>(
        &self,
        document_id: Uuid,
        f: impl FnOnce(&mut Session, u64) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut active = self.active.write().await;
        let session = active.get_mut(&document_id).ok_or(SessionError::Ended)?;
        f(session, unix_millis())
    }

    pub async fn session(&self, document_id: Uuid) -> Option<Session> {
        self.active.read().await.get(&document_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn ended_sessions(&self) -> Vec<Session> {
        self.ended.read().await.clone()
    }

    pub async fn end(&self, document_id: Uuid, reason: EndReason) -> Option<Session> {
        let now = unix_millis();
        let mut session = self.active.write().await.remove(&document_id)?;
        session.end(reason, now);
        self.archive(session.clone()).await;
        Some(session)
    }

    pub async fn sweep(&self) -> Vec<Session> {
        self.sweep_at(unix_millis()).await
    }

    /// End sessions idle past the timeout and purge ended sessions past
    /// retention. Returns the sessions ended by this sweep.
    pub async fn sweep_at(&self, now: u64) -> Vec<Session> {
        let idle: Vec<Session> = {
            let mut active = self.active.write().await;
            let ids: Vec<Uuid> = active
                .iter()
                .filter(|(_, s)| s.is_idle(now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| active.remove(id))
                .map(|mut s| {
                    s.end(EndReason::Idle, now);
                    s
                })
                .collect()
        };
        for session in &idle {
            self.archive(session.clone()).await;
        }

        let retention = self.config.ended_retention.as_millis() as u64;
        let mut ended = self.ended.write().await;
        let before = ended.len();
        ended.retain(|s| now.saturating_sub(s.ended_at.unwrap_or(now)) <= retention);
        if ended.len() < before {
            log::debug!("Purged {} ended sessions", before - ended.len());
        }
        idle
    }

    async fn archive(&self, session: Session) {
        if let Some(engine) = &self.engine {
            if let Err(e) = engine.store().put_session(session.session_id, &session) {
                log::error!("Failed to persist session {}: {e}", session.session_id);
            }
        }
        self.ended.write().await.push(session);
    }

    /// Load a persisted session record.
    pub fn load_persisted(&self, session_id: Uuid) -> Result<Option<Session>, SessionError> {
        match &self.engine {
            Some(engine) => Ok(engine.store().get_session(session_id)?),
            None => Ok(None),
        }
    }
}
