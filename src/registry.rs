//! Session registry.
//!
//! Wraps the [`SessionStore`] seam with the gateway's policies: the
//! create/replace flow, the touch rate limit, and the per-failure-kind
//! error handling (create and authenticate failures are surfaced so the
//! connection is closed; touch and position failures are swallowed, the
//! next successful write restores the state).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;

use crate::imei::Imei;
use crate::session::{ChannelId, LastPosition, SessionRecord, SessionStore, StoreError};

/// Result of a login against the registry.
#[derive(Debug)]
pub struct CreateOutcome {
    pub session: SessionRecord,
    /// The session evicted by this login, when the IMEI was already bound.
    pub replaced: Option<SessionRecord>,
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    touch_min_interval: Duration,
    touch_marks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, touch_min_interval: Duration) -> SessionRegistry {
        SessionRegistry {
            store,
            touch_min_interval,
            touch_marks: Mutex::new(HashMap::new()),
        }
    }

    /// Bind an IMEI to a live connection, atomically displacing any
    /// session the IMEI already held. Errors here fail the login.
    pub async fn create_or_replace(
        &self,
        imei: &Imei,
        channel_id: ChannelId,
        remote_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, StoreError> {
        let record = SessionRecord::new(imei.clone(), channel_id, remote_addr, now);
        let replaced = self.store.create_or_replace(record.clone()).await?;
        Ok(CreateOutcome {
            session: record,
            replaced,
        })
    }

    /// Mark the session authenticated. Errors here fail the login.
    pub async fn authenticate(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.set_authenticated(session_id, now).await
    }

    /// Update `last_activity`, at most once per
    /// `touch_min_interval` per session. Store failures are swallowed
    /// with a warning.
    pub async fn touch(&self, session_id: &str, now: DateTime<Utc>) {
        if !self.mark_touch(session_id, now) {
            return;
        }
        if let Err(e) = self.store.touch(session_id, now).await {
            warn!("touch failed for session {}: {}", session_id, e);
            self.unmark_touch(session_id);
        }
    }

    /// Record the latest position. Failures are swallowed; the next fix
    /// restores the state.
    pub async fn update_position(&self, session_id: &str, position: LastPosition) {
        if let Err(e) = self.store.set_last_position(session_id, position).await {
            warn!("position update failed for session {}: {}", session_id, e);
        }
    }

    /// Attach a string attribute to the session. Failures are swallowed.
    pub async fn set_attribute(&self, session_id: &str, key: &str, value: &str) {
        if let Err(e) = self.store.set_attribute(session_id, key, value).await {
            warn!("attribute write failed for session {}: {}", session_id, e);
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.store.get(session_id).await
    }

    pub async fn get_by_imei(&self, imei: &Imei) -> Result<Option<SessionRecord>, StoreError> {
        self.store.get_by_imei(imei).await
    }

    pub async fn get_by_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.store.get_by_channel(channel_id).await
    }

    /// Evict a session. Returns the removed record so the caller can
    /// emit its lifecycle event; `None` when another path (a replacing
    /// login, the reaper) already evicted it.
    pub async fn remove(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.unmark_touch(session_id);
        self.store.delete(session_id).await
    }

    /// Sessions idle past their ceiling. Best effort: a store failure
    /// yields an empty sweep.
    pub async fn find_idle(
        &self,
        auth_cutoff: DateTime<Utc>,
        unauth_cutoff: DateTime<Utc>,
    ) -> Vec<String> {
        match self.store.find_idle(auth_cutoff, unauth_cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("idle scan failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn active_count(&self) -> Result<usize, StoreError> {
        self.store.active_count().await
    }

    /// Returns whether a store write should happen for this touch, and
    /// if so records it.
    fn mark_touch(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let min = match chrono::Duration::from_std(self.touch_min_interval) {
            Ok(min) => min,
            Err(_) => return true,
        };
        let mut marks = match self.touch_marks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match marks.get(session_id) {
            Some(last) if now - *last < min => false,
            _ => {
                marks.insert(session_id.to_owned(), now);
                true
            }
        }
    }

    fn unmark_touch(&self, session_id: &str) {
        let mut marks = match self.touch_marks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        marks.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> SessionRegistry {
        SessionRegistry::new(store, Duration::from_secs(1))
    }

    fn imei(s: &str) -> Imei {
        Imei::new(s).unwrap()
    }

    #[tokio::test]
    async fn replacement_reports_old_session() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        let now = Utc::now();

        let first = reg
            .create_or_replace(&imei("123456789012345"), 1, "a:1", now)
            .await
            .unwrap();
        assert!(first.replaced.is_none());
        reg.authenticate(&first.session.id, now).await.unwrap();

        let second = reg
            .create_or_replace(&imei("123456789012345"), 2, "b:1", now)
            .await
            .unwrap();
        let replaced = second.replaced.unwrap();
        assert_eq!(replaced.id, first.session.id);
        assert_eq!(replaced.channel_id, 1);
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn touch_is_rate_limited() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        let t0 = Utc::now();

        let outcome = reg
            .create_or_replace(&imei("123456789012345"), 1, "a:1", t0)
            .await
            .unwrap();
        let id = outcome.session.id.clone();

        // Two touches 100 ms apart: only the first hits the store.
        reg.touch(&id, t0 + chrono::Duration::seconds(5)).await;
        reg.touch(&id, t0 + chrono::Duration::milliseconds(5100)).await;
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.last_activity, t0 + chrono::Duration::seconds(5));

        // Past the interval the write goes through.
        reg.touch(&id, t0 + chrono::Duration::seconds(7)).await;
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.last_activity, t0 + chrono::Duration::seconds(7));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store);
        let now = Utc::now();
        let outcome = reg
            .create_or_replace(&imei("123456789012345"), 1, "a:1", now)
            .await
            .unwrap();
        let id = outcome.session.id;

        assert!(reg.remove(&id).await.unwrap().is_some());
        assert!(reg.remove(&id).await.unwrap().is_none());
    }
}
