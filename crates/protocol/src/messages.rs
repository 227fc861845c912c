//! Typed messages exchanged between nodes.
//!
//! Requests and responses of the transaction protocol embed a shared
//! [`TxContext`] instead of inheriting common fields. [`Message`] is the sum
//! type the codec dispatches on through [`MessageKind`].

use crate::error::{CodecError, Result};
use gridcore_common::{CacheKey, CacheValue, FutureId, MiniId, NodeId, TxVersion};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Transaction concurrency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    /// Locks are acquired at prepare time
    Optimistic,
    /// Locks are acquired when keys are first touched
    Pessimistic,
}

/// Fields shared by every transactional request and response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxContext {
    pub version: TxVersion,
    pub future_id: FutureId,
    pub mini_id: MiniId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOp {
    Read,
    Update,
    Delete,
}

/// One key touched by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    pub key: CacheKey,
    pub op: EntryOp,
    pub value: Option<CacheValue>,
    pub ttl_ms: Option<u64>,
}

impl TxEntry {
    pub fn read(key: CacheKey) -> Self {
        Self {
            key,
            op: EntryOp::Read,
            value: None,
            ttl_ms: None,
        }
    }

    pub fn update(key: CacheKey, value: CacheValue) -> Self {
        Self {
            key,
            op: EntryOp::Update,
            value: Some(value),
            ttl_ms: None,
        }
    }

    pub fn delete(key: CacheKey) -> Self {
        Self {
            key,
            op: EntryOp::Delete,
            value: None,
            ttl_ms: None,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.op, EntryOp::Read)
    }
}

/// Authoritative current value returned by a prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedValue {
    pub key: CacheKey,
    pub version: TxVersion,
    pub value: Option<CacheValue>,
}

/// Error reported by a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("key {key} is locked by transaction {holder}")]
    LockConflict { key: CacheKey, holder: TxVersion },

    #[error("heuristic failure: {0}")]
    Heuristic(String),

    #[error("transaction rolled back: {0}")]
    Rollback(String),

    #[error("node does not own key {0}")]
    NotOwner(CacheKey),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub body: Vec<u8>,
}

/// Explicit lock acquisition for keys whose primary is the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub ctx: TxContext,
    pub thread_id: u64,
    pub topology_version: u64,
    pub keys: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    pub ctx: TxContext,
    pub pending: Vec<TxVersion>,
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub ctx: TxContext,
    pub thread_id: u64,
    pub topology_version: u64,
    pub concurrency: Concurrency,
    /// Keys of this mapping are already covered by an explicit lock
    pub explicit_lock: bool,
    /// Whole-partition lock requested
    pub partition_lock: bool,
    /// Commit directly on prepare; the destination is the only participant
    pub one_phase_commit: bool,
    pub reads: Vec<TxEntry>,
    pub writes: Vec<TxEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub ctx: TxContext,
    /// Partitions the responder no longer owns
    pub invalid_partitions: Vec<u32>,
    /// Versions of active transactions older than the requester
    pub pending: Vec<TxVersion>,
    pub owned_values: Vec<OwnedValue>,
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    pub ctx: TxContext,
    pub thread_id: u64,
    pub commit: bool,
    pub invalidate: bool,
    pub explicit_lock: bool,
    pub topology_version: u64,
    /// Number of entries in the whole transaction
    pub tx_size: usize,
    /// Present only for pessimistic commits
    pub writes: Option<Vec<TxEntry>>,
    /// Requester waits for the response
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishResponse {
    pub ctx: TxContext,
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    Update,
    Delete,
    /// Update only when absent; otherwise the primary returns the current value
    PutIfAbsent,
}

/// Non-transactional update sent by a near node to a primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearAtomicUpdateRequest {
    pub future_id: FutureId,
    pub topology_version: u64,
    pub op: AtomicOp,
    pub keys: Vec<CacheKey>,
    /// One entry per key; ignored for deletes
    pub values: Vec<Option<CacheValue>>,
    pub ttl_ms: Option<u64>,
    /// Version fixed by the requester, if any
    pub update_version: Option<TxVersion>,
}

impl NearAtomicUpdateRequest {
    pub fn value(&self, idx: usize) -> Option<CacheValue> {
        match self.op {
            AtomicOp::Delete => None,
            _ => self.values.get(idx).cloned().flatten(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearAtomicUpdateResponse {
    pub future_id: FutureId,
    /// Version assigned by the primary
    pub near_version: Option<TxVersion>,
    pub failed_keys: Vec<(CacheKey, String)>,
    /// Request indexes whose value was generated by the primary
    pub near_value_indexes: Vec<usize>,
    /// Values for `near_value_indexes`, in the same order
    pub near_values: Vec<Option<CacheValue>>,
    /// Request indexes the near node must not touch
    pub skipped_indexes: Vec<usize>,
    pub near_ttl_ms: Option<u64>,
}

impl NearAtomicUpdateResponse {
    pub fn new(future_id: FutureId) -> Self {
        Self {
            future_id,
            ..Default::default()
        }
    }

    pub fn add_failed(&mut self, key: CacheKey, reason: impl Into<String>) {
        self.failed_keys.push((key, reason.into()));
    }

    pub fn is_failed(&self, key: &CacheKey) -> bool {
        self.failed_keys.iter().any(|(k, _)| k == key)
    }

    pub fn add_near_value(&mut self, idx: usize, value: Option<CacheValue>) {
        self.near_value_indexes.push(idx);
        self.near_values.push(value);
    }
}

/// Replication of an applied atomic update from primary to backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtAtomicUpdateRequest {
    pub primary: NodeId,
    pub version: TxVersion,
    pub keys: Vec<CacheKey>,
    pub values: Vec<Option<CacheValue>>,
    pub ttl_ms: Option<u64>,
}

/// Message kind written on the wire ahead of the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    User = 1,
    LockRequest = 2,
    LockResponse = 3,
    PrepareRequest = 4,
    PrepareResponse = 5,
    FinishRequest = 6,
    FinishResponse = 7,
    NearAtomicUpdateRequest = 8,
    NearAtomicUpdateResponse = 9,
    DhtAtomicUpdateRequest = 10,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            1 => Self::User,
            2 => Self::LockRequest,
            3 => Self::LockResponse,
            4 => Self::PrepareRequest,
            5 => Self::PrepareResponse,
            6 => Self::FinishRequest,
            7 => Self::FinishResponse,
            8 => Self::NearAtomicUpdateRequest,
            9 => Self::NearAtomicUpdateResponse,
            10 => Self::DhtAtomicUpdateRequest,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    User(UserMessage),
    LockRequest(LockRequest),
    LockResponse(LockResponse),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    FinishRequest(FinishRequest),
    FinishResponse(FinishResponse),
    NearAtomicUpdateRequest(NearAtomicUpdateRequest),
    NearAtomicUpdateResponse(NearAtomicUpdateResponse),
    DhtAtomicUpdateRequest(DhtAtomicUpdateRequest),
}

impl Message {
    pub fn user(body: impl Into<Vec<u8>>) -> Self {
        Message::User(UserMessage { body: body.into() })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::User(_) => MessageKind::User,
            Message::LockRequest(_) => MessageKind::LockRequest,
            Message::LockResponse(_) => MessageKind::LockResponse,
            Message::PrepareRequest(_) => MessageKind::PrepareRequest,
            Message::PrepareResponse(_) => MessageKind::PrepareResponse,
            Message::FinishRequest(_) => MessageKind::FinishRequest,
            Message::FinishResponse(_) => MessageKind::FinishResponse,
            Message::NearAtomicUpdateRequest(_) => MessageKind::NearAtomicUpdateRequest,
            Message::NearAtomicUpdateResponse(_) => MessageKind::NearAtomicUpdateResponse,
            Message::DhtAtomicUpdateRequest(_) => MessageKind::DhtAtomicUpdateRequest,
        }
    }

    /// Copy for one additional destination of a multi-node send.
    pub fn copy_for_fan_out(&self) -> Self {
        self.clone()
    }

    /// Encode the variant-specific body
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Message::User(m) => encode(m),
            Message::LockRequest(m) => encode(m),
            Message::LockResponse(m) => encode(m),
            Message::PrepareRequest(m) => encode(m),
            Message::PrepareResponse(m) => encode(m),
            Message::FinishRequest(m) => encode(m),
            Message::FinishResponse(m) => encode(m),
            Message::NearAtomicUpdateRequest(m) => encode(m),
            Message::NearAtomicUpdateResponse(m) => encode(m),
            Message::DhtAtomicUpdateRequest(m) => encode(m),
        }
    }

    /// Decode a body written by [`Message::encode_body`]
    pub fn decode_body(kind: u8, body: &[u8]) -> Result<Self> {
        let kind = MessageKind::from_u8(kind).ok_or(CodecError::UnknownMessageKind(kind))?;
        Ok(match kind {
            MessageKind::User => Message::User(decode(body)?),
            MessageKind::LockRequest => Message::LockRequest(decode(body)?),
            MessageKind::LockResponse => Message::LockResponse(decode(body)?),
            MessageKind::PrepareRequest => Message::PrepareRequest(decode(body)?),
            MessageKind::PrepareResponse => Message::PrepareResponse(decode(body)?),
            MessageKind::FinishRequest => Message::FinishRequest(decode(body)?),
            MessageKind::FinishResponse => Message::FinishResponse(decode(body)?),
            MessageKind::NearAtomicUpdateRequest => Message::NearAtomicUpdateRequest(decode(body)?),
            MessageKind::NearAtomicUpdateResponse => {
                Message::NearAtomicUpdateResponse(decode(body)?)
            }
            MessageKind::DhtAtomicUpdateRequest => Message::DhtAtomicUpdateRequest(decode(body)?),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(CodecError::Decode(format!(
            "{} trailing bytes after message body",
            body.len() - read
        )));
    }
    Ok(value)
}
