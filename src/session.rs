//! Session records and the persistence seam.
//!
//! A session is the runtime binding of one IMEI to one live connection
//! plus the metadata that survives it. The record never holds a direct
//! connection handle; it carries a logical `channel_id` the connection
//! layer resolves on demand, which keeps the persisted form free of
//! runtime references.
//!
//! [`SessionStore`] is the narrow interface to the backing key-value
//! store. Every operation is a single atomic round-trip over the five
//! pieces of per-session state (record, IMEI index, channel index,
//! active set, counters); a scripted-transaction store such as Redis
//! satisfies the contract, and [`MemoryStore`] satisfies it under one
//! process-local lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::imei::Imei;

/// Logical identifier of a live connection within this process.
pub type ChannelId = u64;

/// Most recent position attributed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub at: DateTime<Utc>,
}

/// The persisted per-session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub imei: Imei,
    pub channel_id: ChannelId,
    pub remote_addr: String,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_position: Option<LastPosition>,
    pub attributes: HashMap<String, String>,
}

impl SessionRecord {
    /// A fresh, unauthenticated record for a new connection.
    pub fn new(imei: Imei, channel_id: ChannelId, remote_addr: &str, now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4().to_string(),
            imei,
            channel_id,
            remote_addr: remote_addr.to_owned(),
            authenticated: false,
            created_at: now,
            last_activity: now,
            last_login_at: None,
            last_position: None,
            attributes: HashMap::new(),
        }
    }
}

/// Errors from the persistence layer.
#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached or the transaction failed.
    Unavailable(String),
    /// The addressed session does not exist.
    Missing(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "session store unavailable: {}", e),
            StoreError::Missing(id) => write!(f, "no such session {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Counters the store keeps alongside the records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub created: u64,
    pub replaced: u64,
    pub deleted: u64,
}

/// Narrow interface to the session persistence layer.
///
/// Mutations serialise per session inside the store; callers hold no
/// cross-component locks. Implementations backed by an expiring store
/// refresh key TTLs on every mutation; expiry is a backstop behind the
/// reaper, not the primary eviction path.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert `record`, atomically evicting any session held by the same
    /// IMEI. Returns the evicted record when a replacement occurred.
    async fn create_or_replace(
        &self,
        record: SessionRecord,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn get_by_imei(&self, imei: &Imei) -> Result<Option<SessionRecord>, StoreError>;

    async fn get_by_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Update `last_activity`. Missing sessions are ignored; the session
    /// may have been reaped between the frame and the write.
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Flip the authenticated flag and stamp `last_login_at`.
    async fn set_authenticated(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_last_position(
        &self,
        session_id: &str,
        position: LastPosition,
    ) -> Result<(), StoreError>;

    async fn set_attribute(
        &self,
        session_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Scan the active set for sessions idle past their ceiling:
    /// `auth_cutoff` bounds authenticated sessions, `unauth_cutoff` the
    /// ones that never logged in.
    async fn find_idle(
        &self,
        auth_cutoff: DateTime<Utc>,
        unauth_cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove the record, both index entries and the active-set
    /// membership in one step. Returns the removed record.
    async fn delete(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn active_count(&self) -> Result<usize, StoreError>;
}

/// Process-local [`SessionStore`] mirroring the five-key layout of the
/// scripted store. Backs tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    sessions: HashMap<String, SessionRecord>,
    imei_index: HashMap<Imei, String>,
    channel_index: HashMap<ChannelId, String>,
    active: HashSet<String>,
    metrics: StoreMetrics,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.lock().metrics
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MemoryStoreInner {
    fn remove_session(&mut self, session_id: &str) -> Option<SessionRecord> {
        let record = self.sessions.remove(session_id)?;
        self.imei_index.remove(&record.imei);
        self.channel_index.remove(&record.channel_id);
        self.active.remove(session_id);
        self.metrics.deleted += 1;
        Some(record)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_or_replace(
        &self,
        record: SessionRecord,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut inner = self.lock();
        let old_id = inner.imei_index.get(&record.imei).cloned();
        let replaced = old_id.and_then(|old_id| inner.remove_session(&old_id));
        if replaced.is_some() {
            inner.metrics.replaced += 1;
        }
        inner.imei_index.insert(record.imei.clone(), record.id.clone());
        inner.channel_index.insert(record.channel_id, record.id.clone());
        inner.active.insert(record.id.clone());
        inner.metrics.created += 1;
        inner.sessions.insert(record.id.clone(), record);
        Ok(replaced)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn get_by_imei(&self, imei: &Imei) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .imei_index
            .get(imei)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn get_by_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .channel_index
            .get(&channel_id)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(record) = self.lock().sessions.get_mut(session_id) {
            if at > record.last_activity {
                record.last_activity = at;
            }
        }
        Ok(())
    }

    async fn set_authenticated(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::Missing(session_id.to_owned()))?;
        record.authenticated = true;
        record.last_login_at = Some(at);
        if at > record.last_activity {
            record.last_activity = at;
        }
        Ok(())
    }

    async fn set_last_position(
        &self,
        session_id: &str,
        position: LastPosition,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::Missing(session_id.to_owned()))?;
        record.last_position = Some(position);
        Ok(())
    }

    async fn set_attribute(
        &self,
        session_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::Missing(session_id.to_owned()))?;
        record.attributes.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn find_idle(
        &self,
        auth_cutoff: DateTime<Utc>,
        unauth_cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut idle = Vec::new();
        for id in &inner.active {
            if let Some(record) = inner.sessions.get(id) {
                let cutoff = if record.authenticated {
                    auth_cutoff
                } else {
                    unauth_cutoff
                };
                if record.last_activity < cutoff {
                    idle.push(id.clone());
                }
            }
        }
        Ok(idle)
    }

    async fn delete(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock().remove_session(session_id))
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock().active.len())
    }
}
