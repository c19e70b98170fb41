//! Wire protocol for room synchronization.
//!
//! Every WebSocket binary message carries exactly one frame:
//! ```text
//! ┌──────────────────┬────────────────────────────┐
//! │ kind (varint)    │ payload (rest of message)  │
//! └──────────────────┴────────────────────────────┘
//!
//!   SYNC          [varint subtype][varint len][bytes]
//!                 subtype 0 = step1 (state vector)
//!                         1 = step2 (diff)
//!                         2 = update
//!   AWARENESS     bincode AwarenessUpdate
//!   AUTH          JSON {token, userId, userName, documentId}
//!   CUSTOM        JSON tagged by "type"
//!   ERROR         JSON {code, message}
//!   NOTIFICATION  JSON tagged by "type"
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    Custom = 3,
    Error = 4,
    Notification = 5,
}

impl MessageKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Sync),
            1 => Some(MessageKind::Awareness),
            2 => Some(MessageKind::Auth),
            3 => Some(MessageKind::Custom),
            4 => Some(MessageKind::Error),
            5 => Some(MessageKind::Notification),
            _ => None,
        }
    }
}

// ─── Varint ───────────────────────────────────────────────────────────

/// Append `value` as an unsigned LEB128 varint.
pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint starting at `*pos`, advancing it.
pub fn read_var_u64(bytes: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(ProtocolError::Truncated)?;
        *pos += 1;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(ProtocolError::VarintOverflow);
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn write_var_buf(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_var_buf<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = usize::try_from(read_var_u64(bytes, pos)?).map_err(|_| ProtocolError::Truncated)?;
    let end = pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
    let slice = bytes.get(*pos..end).ok_or(ProtocolError::Truncated)?;
    *pos = end;
    Ok(slice)
}

// ─── Frames ───────────────────────────────────────────────────────────

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn sync(message: &SyncMessage) -> Self {
        Self::new(MessageKind::Sync, message.encode())
    }

    pub fn awareness(update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageKind::Awareness, update.encode()?))
    }

    pub fn auth(request: &AuthRequest) -> Result<Self, ProtocolError> {
        Self::json(MessageKind::Auth, request)
    }

    pub fn custom(message: &CustomMessage) -> Result<Self, ProtocolError> {
        Self::json(MessageKind::Custom, message)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::json(
            MessageKind::Error,
            &ErrorMessage { code, message: message.into() },
        )
    }

    pub fn notification(notification: &Notification) -> Result<Self, ProtocolError> {
        Self::json(MessageKind::Notification, notification)
    }

    fn json<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(kind, payload))
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 1);
        write_var_u64(&mut buf, self.kind as u64);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a wire message, rejecting anything larger than `max_size`.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_size {
            return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max: max_size });
        }
        let mut pos = 0;
        let raw = read_var_u64(bytes, &mut pos)?;
        let kind = MessageKind::from_u64(raw).ok_or(ProtocolError::UnknownKind(raw))?;
        Ok(Self::new(kind, bytes[pos..].to_vec()))
    }

    pub fn as_sync(&self) -> Result<SyncMessage, ProtocolError> {
        self.expect_kind(MessageKind::Sync)?;
        SyncMessage::decode(&self.payload)
    }

    pub fn as_awareness(&self) -> Result<AwarenessUpdate, ProtocolError> {
        self.expect_kind(MessageKind::Awareness)?;
        AwarenessUpdate::decode(&self.payload)
    }

    pub fn as_auth(&self) -> Result<AuthRequest, ProtocolError> {
        self.parse_json(MessageKind::Auth)
    }

    pub fn as_custom(&self) -> Result<CustomMessage, ProtocolError> {
        self.parse_json(MessageKind::Custom)
    }

    pub fn as_error(&self) -> Result<ErrorMessage, ProtocolError> {
        self.parse_json(MessageKind::Error)
    }

    pub fn as_notification(&self) -> Result<Notification, ProtocolError> {
        self.parse_json(MessageKind::Notification)
    }

    fn parse_json<T: DeserializeOwned>(&self, kind: MessageKind) -> Result<T, ProtocolError> {
        self.expect_kind(kind)?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::UnexpectedKind { expected: kind, actual: self.kind });
        }
        Ok(())
    }
}

/// SYNC sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's encoded state vector; the receiver answers with `Step2`.
    Step1(Vec<u8>),
    /// Diff against the state vector from a `Step1`.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    const STEP1: u64 = 0;
    const STEP2: u64 = 1;
    const UPDATE: u64 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let (subtype, bytes) = match self {
            SyncMessage::Step1(b) => (Self::STEP1, b),
            SyncMessage::Step2(b) => (Self::STEP2, b),
            SyncMessage::Update(b) => (Self::UPDATE, b),
        };
        let mut buf = Vec::with_capacity(bytes.len() + 6);
        write_var_u64(&mut buf, subtype);
        write_var_buf(&mut buf, bytes);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let subtype = read_var_u64(bytes, &mut pos)?;
        let body = read_var_buf(bytes, &mut pos)?.to_vec();
        match subtype {
            Self::STEP1 => Ok(SyncMessage::Step1(body)),
            Self::STEP2 => Ok(SyncMessage::Step2(body)),
            Self::UPDATE => Ok(SyncMessage::Update(body)),
            other => Err(ProtocolError::UnknownSyncType(other)),
        }
    }

    /// Whether this message carries document content.
    pub fn is_write(&self) -> bool {
        !matches!(self, SyncMessage::Step1(_))
    }
}

// ─── Awareness ────────────────────────────────────────────────────────

/// One client's presence entry. `state == None` removes the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    /// Opaque JSON document describing cursor/selection/etc.
    pub state: Option<String>,
}

/// Awareness delta carried by an AWARENESS frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

// ─── JSON payloads ────────────────────────────────────────────────────

/// Participant role inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Viewers may read but never write document content.
    pub fn can_edit(self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
    pub user_id: String,
    pub user_name: String,
    pub document_id: Uuid,
}

/// Application sub-protocol carried by CUSTOM frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CustomMessage {
    Ping { ts: u64 },
    Pong { ts: u64 },
    Cursor { x: f64, y: f64 },
    Comment { element_id: String, text: String },
    Lock { element_id: String },
    Unlock { element_id: String },
    ConflictResolved { element_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthorized,
    NotAuthenticated,
    AlreadyAuthenticated,
    ReadOnly,
    InvalidFrame,
    InvalidUpdate,
    FrameTooLarge,
    SessionFull,
    LockHeld,
    RoomUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

/// A comment as it travels in notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentInfo {
    pub id: Uuid,
    pub element_id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: u64,
}

/// Server-pushed notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Notification {
    Authenticated {
        session_id: Uuid,
        user_id: String,
        role: Role,
        color: String,
    },
    UserJoined {
        user_id: String,
        name: String,
        color: String,
        role: Role,
    },
    UserLeft { user_id: String },
    CursorMoved { user_id: String, x: f64, y: f64 },
    CommentAdded { comment: CommentInfo },
    LockChanged { element_id: String, holder: Option<String> },
    SessionEnded { session_id: Uuid, reason: String },
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Truncated,
    VarintOverflow,
    UnknownKind(u64),
    UnknownSyncType(u64),
    UnexpectedKind { expected: MessageKind, actual: MessageKind },
    FrameTooLarge { size: usize, max: usize },
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Frame truncated"),
            Self::VarintOverflow => write!(f, "Varint overflows 64 bits"),
            Self::UnknownKind(k) => write!(f, "Unknown message kind {k}"),
            Self::UnknownSyncType(t) => write!(f, "Unknown sync subtype {t}"),
            Self::UnexpectedKind { expected, actual } => {
                write!(f, "Expected {expected:?} frame, got {actual:?}")
            }
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame of {size} bytes exceeds limit of {max}")
            }
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::DeserializationError(e.to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_var_u64(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[test]
    fn test_varint_truncated_and_overflow() {
        let mut pos = 0;
        assert_eq!(read_var_u64(&[0x80], &mut pos), Err(ProtocolError::Truncated));
        let mut pos = 0;
        let too_long = [0xFF; 11];
        assert_eq!(read_var_u64(&too_long, &mut pos), Err(ProtocolError::VarintOverflow));
    }

    #[test]
    fn test_frame_layout() {
        let frame = Frame::sync(&SyncMessage::Update(vec![9, 8, 7]));
        let bytes = frame.encode();
        // kind, subtype, len, payload
        assert_eq!(bytes, vec![0, 2, 3, 9, 8, 7]);
        let decoded = Frame::decode(&bytes, MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded.as_sync().unwrap(), SyncMessage::Update(vec![9, 8, 7]));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::new(MessageKind::Awareness, vec![0; 64]);
        let err = Frame::decode(&frame.encode(), 16).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 65, max: 16 }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(Frame::decode(&[42, 1, 2], MAX_FRAME_SIZE), Err(ProtocolError::UnknownKind(42)));
        assert_eq!(Frame::decode(&[], MAX_FRAME_SIZE), Err(ProtocolError::Truncated));
    }

    #[test]
    fn test_sync_truncated_body() {
        // declares 5 bytes, carries 2
        assert_eq!(SyncMessage::decode(&[1, 5, 0, 0]), Err(ProtocolError::Truncated));
        assert_eq!(SyncMessage::decode(&[7, 0]), Err(ProtocolError::UnknownSyncType(7)));
    }

    #[test]
    fn test_auth_json_shape() {
        let doc = Uuid::new_v4();
        let frame = Frame::auth(&AuthRequest {
            token: "t".into(),
            user_id: "u1".into(),
            user_name: "Ada".into(),
            document_id: doc,
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["userName"], "Ada");
        assert_eq!(json["documentId"], doc.to_string());
    }

    #[test]
    fn test_custom_tags() {
        let json = serde_json::to_value(CustomMessage::Lock { element_id: "S1".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "lock", "elementId": "S1"}));

        let parsed: CustomMessage =
            serde_json::from_str(r#"{"type":"conflict-resolved","elementId":"S2"}"#).unwrap();
        assert_eq!(parsed, CustomMessage::ConflictResolved { element_id: "S2".into() });

        let ping: CustomMessage = serde_json::from_str(r#"{"type":"ping","ts":12}"#).unwrap();
        assert_eq!(ping, CustomMessage::Ping { ts: 12 });
    }

    #[test]
    fn test_error_and_notification_json() {
        let frame = Frame::error(ErrorCode::ReadOnly, "viewers cannot edit").unwrap();
        let parsed = frame.as_error().unwrap();
        assert_eq!(parsed.code, ErrorCode::ReadOnly);
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json["code"], "read-only");

        let n = Notification::LockChanged { element_id: "S1".into(), holder: None };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "lock-changed");
        assert_eq!(json["elementId"], "S1");
    }

    #[test]
    fn test_wrong_kind_accessor() {
        let frame = Frame::sync(&SyncMessage::Step1(vec![0]));
        assert!(matches!(frame.as_custom(), Err(ProtocolError::UnexpectedKind { .. })));
    }

    #[test]
    fn test_awareness_payload() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry { client_id: 7, clock: 3, state: Some("{\"x\":1}".into()) },
                AwarenessEntry { client_id: 9, clock: 1, state: None },
            ],
        };
        let frame = Frame::awareness(&update).unwrap();
        let decoded = Frame::decode(&frame.encode(), MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded.as_awareness().unwrap(), update);
    }

    #[test]
    fn test_viewer_cannot_edit() {
        assert!(Role::Owner.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(!Role::Viewer.can_edit());
    }
}
