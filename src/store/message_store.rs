//! Sled-backed message store
//!
//! Layout:
//! - `messages` tree: big-endian sequence number → JSON [`PendingMessage`]
//! - `meta` tree: session id, accepted types, server uuid, identity and
//!   sequence counters
//!
//! Big-endian keys make sled's lexicographic iteration order equal to
//! enqueue order.
//!
//! Writes are not flushed one by one. sled's background flusher persists
//! them within [`FLUSH_EVERY_MS`], and [`MessageStore::flush`] forces a
//! flush at points where losing the last writes would matter.

use super::{StoreError, StoreResult};
use crate::protocol::{message_type, types_hash, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// Interval of sled's background flusher
pub const FLUSH_EVERY_MS: u64 = 500;

const MESSAGES_TREE: &str = "messages";
const META_TREE: &str = "meta";

const SESSION_ID_KEY: &str = "session-id";
const ACCEPTED_TYPES_KEY: &str = "accepted-types";
const SERVER_UUID_KEY: &str = "server-uuid";
const IDENTITY_KEY: &str = "identity";
const NEXT_SEQUENCE_KEY: &str = "next-sequence";
const SERVER_SEQUENCE_KEY: &str = "server-sequence";
const CLIENT_TYPES_HASH_KEY: &str = "client-accepted-types-hash";

/// Identifier of a queued message: its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting for server acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub sequence: u64,
    pub message_type: String,
    pub payload: Message,
    pub urgent: bool,
}

impl PendingMessage {
    pub fn id(&self) -> MessageId {
        MessageId(self.sequence)
    }
}

/// Credentials assigned by the server on registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Sent with every exchange to authenticate the computer
    pub secure_id: String,
    /// Sent with pings; safe to expose over plain HTTP
    pub insecure_id: Option<String>,
}

/// Persistent queue of outbound messages plus session bookkeeping
pub struct MessageStore {
    db: Db,
    messages: Tree,
    meta: Tree,
    /// Serializes read-modify-write sequences on the meta tree
    write_lock: Mutex<()>,
}

impl MessageStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(FLUSH_EVERY_MS))
            .open()?;
        info!(path = %path.display(), "Opened message store");
        Self::from_db(db)
    }

    /// Open a store that is deleted when dropped
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let messages = db.open_tree(MESSAGES_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self {
            db,
            messages,
            meta,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write every buffered change to disk without blocking the runtime
    ///
    /// Returns the number of bytes flushed.
    pub async fn flush(&self) -> StoreResult<usize> {
        Ok(self.db.flush_async().await?)
    }

    fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        match self.meta.get(key)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn get_u64(&self, key: &str) -> StoreResult<Option<u64>> {
        match self.meta.get(key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes[..].try_into().map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("expected 8 bytes, found {}", bytes.len()),
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_optional_string(&self, key: &str, value: Option<&str>) -> StoreResult<()> {
        match value {
            Some(value) => self.meta.insert(key, value.as_bytes())?,
            None => self.meta.remove(key)?,
        };
        Ok(())
    }

    // Sessions

    /// Current session id, minted on first use
    pub fn get_session_id(&self) -> StoreResult<String> {
        let _guard = self.lock();
        if let Some(existing) = self.get_string(SESSION_ID_KEY)? {
            return Ok(existing);
        }

        let session_id = Uuid::new_v4().to_string();
        self.meta.insert(SESSION_ID_KEY, session_id.as_bytes())?;
        debug!(session_id = %session_id, "Minted new session id");
        Ok(session_id)
    }

    /// Invalidate the current session; the next request mints a fresh id
    pub fn drop_session_ids(&self) -> StoreResult<()> {
        let _guard = self.lock();
        self.meta.remove(SESSION_ID_KEY)?;
        debug!("Dropped session ids");
        Ok(())
    }

    // Accepted types

    /// Replace the set of message types the server accepts
    pub fn set_accepted_types<I, S>(&self, types: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        let encoded = serde_json::to_vec(&types)?;
        let _guard = self.lock();
        self.meta.insert(ACCEPTED_TYPES_KEY, encoded)?;
        Ok(())
    }

    pub fn get_accepted_types(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .get_json::<BTreeSet<String>>(ACCEPTED_TYPES_KEY)?
            .unwrap_or_default())
    }

    pub fn accepts(&self, message_type: &str) -> StoreResult<bool> {
        Ok(self.get_accepted_types()?.contains(message_type))
    }

    /// Digest of the accepted types, as reported to the server
    pub fn accepted_types_hash(&self) -> StoreResult<String> {
        Ok(types_hash(&self.get_accepted_types()?))
    }

    // Queue

    /// Queue a non-urgent message in the given session
    pub fn add(&self, message: Message, session_id: Option<&str>) -> StoreResult<MessageId> {
        self.add_with(message, session_id, false)
    }

    /// Queue a message in the given session
    ///
    /// The message is discarded with [`StoreError::WrongSession`] if the
    /// session is stale and with [`StoreError::NotAccepted`] if the server
    /// does not currently take its type.
    pub fn add_with(
        &self,
        message: Message,
        session_id: Option<&str>,
        urgent: bool,
    ) -> StoreResult<MessageId> {
        let session_id = session_id.ok_or(StoreError::MissingSession)?;
        let kind = message_type(&message)
            .ok_or_else(|| StoreError::InvalidMessage("missing string 'type' field".to_string()))?
            .to_string();

        let _guard = self.lock();
        if self.get_string(SESSION_ID_KEY)?.as_deref() != Some(session_id) {
            debug!(message_type = %kind, "Dropping message from stale session");
            return Err(StoreError::WrongSession);
        }
        if !self.get_accepted_types()?.contains(&kind) {
            debug!(message_type = %kind, "Dropping message of unaccepted type");
            return Err(StoreError::NotAccepted(kind));
        }

        self.enqueue(kind, message, urgent)
    }

    /// Queue a broker-generated message, bypassing session and acceptance checks
    pub fn add_unchecked(&self, message: Message, urgent: bool) -> StoreResult<MessageId> {
        let kind = message_type(&message)
            .ok_or_else(|| StoreError::InvalidMessage("missing string 'type' field".to_string()))?
            .to_string();

        let _guard = self.lock();
        self.enqueue(kind, message, urgent)
    }

    /// Assign the next sequence number and persist. Caller holds the write lock.
    fn enqueue(&self, kind: String, mut payload: Message, urgent: bool) -> StoreResult<MessageId> {
        payload
            .entry("timestamp")
            .or_insert_with(|| Value::from(chrono::Utc::now().timestamp()));

        let sequence = self.get_u64(NEXT_SEQUENCE_KEY)?.unwrap_or(0);
        let pending = PendingMessage {
            sequence,
            message_type: kind,
            payload,
            urgent,
        };
        let encoded = serde_json::to_vec(&pending)?;

        self.meta
            .insert(NEXT_SEQUENCE_KEY, (sequence + 1).to_be_bytes().to_vec())?;
        self.messages.insert(sequence.to_be_bytes(), encoded)?;

        debug!(
            sequence = sequence,
            message_type = %pending.message_type,
            urgent = urgent,
            "Queued message"
        );
        Ok(MessageId(sequence))
    }

    /// Pending messages in enqueue order, at most `max` of them
    pub fn get_pending_messages(&self, max: Option<usize>) -> StoreResult<Vec<PendingMessage>> {
        let limit = max.unwrap_or(usize::MAX);
        self.messages
            .iter()
            .take(limit)
            .map(|entry| -> StoreResult<PendingMessage> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    /// Whether any queued message asked for prompt delivery
    pub fn has_urgent_pending(&self) -> StoreResult<bool> {
        for entry in self.messages.iter() {
            let (_, value) = entry?;
            let pending: PendingMessage = serde_json::from_slice(&value)?;
            if pending.urgent {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn pending_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_pending(&self, id: MessageId) -> StoreResult<bool> {
        Ok(self.messages.contains_key(id.0.to_be_bytes())?)
    }

    /// Sequence number the next queued message will receive
    pub fn next_sequence(&self) -> StoreResult<u64> {
        Ok(self.get_u64(NEXT_SEQUENCE_KEY)?.unwrap_or(0))
    }

    /// Purge every message the server has acknowledged
    ///
    /// `next_expected` is the first sequence the server has not seen yet.
    /// Returns how many messages were removed.
    pub fn acknowledge_up_to(&self, next_expected: u64) -> StoreResult<usize> {
        let _guard = self.lock();
        let keys = self
            .messages
            .range(..next_expected.to_be_bytes())
            .keys()
            .collect::<Result<Vec<_>, _>>()?;

        for key in &keys {
            self.messages.remove(key)?;
        }
        if !keys.is_empty() {
            debug!(
                acknowledged = keys.len(),
                next_expected = next_expected,
                "Purged acknowledged messages"
            );
        }
        Ok(keys.len())
    }

    // Server identity

    pub fn set_server_uuid(&self, uuid: Option<&str>) -> StoreResult<()> {
        let _guard = self.lock();
        self.set_optional_string(SERVER_UUID_KEY, uuid)
    }

    pub fn get_server_uuid(&self) -> StoreResult<Option<String>> {
        self.get_string(SERVER_UUID_KEY)
    }

    pub fn set_identity(&self, identity: &Identity) -> StoreResult<()> {
        let encoded = serde_json::to_vec(identity)?;
        let _guard = self.lock();
        self.meta.insert(IDENTITY_KEY, encoded)?;
        Ok(())
    }

    pub fn get_identity(&self) -> StoreResult<Option<Identity>> {
        self.get_json(IDENTITY_KEY)
    }

    pub fn clear_identity(&self) -> StoreResult<()> {
        let _guard = self.lock();
        self.meta.remove(IDENTITY_KEY)?;
        Ok(())
    }

    // Server message stream

    /// Next sequence number expected in the server's own message stream
    pub fn get_server_sequence(&self) -> StoreResult<u64> {
        Ok(self.get_u64(SERVER_SEQUENCE_KEY)?.unwrap_or(0))
    }

    pub fn set_server_sequence(&self, sequence: u64) -> StoreResult<()> {
        let _guard = self.lock();
        self.meta
            .insert(SERVER_SEQUENCE_KEY, sequence.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Hash of the client-accepted types the server last acknowledged
    pub fn get_client_accepted_types_hash(&self) -> StoreResult<Option<String>> {
        self.get_string(CLIENT_TYPES_HASH_KEY)
    }

    pub fn set_client_accepted_types_hash(&self, hash: Option<&str>) -> StoreResult<()> {
        let _guard = self.lock();
        self.set_optional_string(CLIENT_TYPES_HASH_KEY, hash)
    }
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("db", &"sled::Db")
            .field("pending", &self.messages.len())
            .finish()
    }
}
