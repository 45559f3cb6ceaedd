/// Authoritative table of live sessions
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use deckterm_types::{SessionId, TerminalError};

use super::session::{Session, SessionSummary};

/// Holds every live session and serializes lifecycle changes per id
///
/// Mutations that span an await (creating, recovering, closing) take the
/// id's lock first, so a recovery attach and a client delete of the same id
/// cannot interleave.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    id_locks: Mutex<HashMap<SessionId, Weak<AsyncMutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lifecycle lock for `id`
    pub async fn lock_id(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.id_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Register a session; returns false if the id is already taken
    pub async fn insert(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id.clone(), session);
        true
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, TerminalError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// Remove `session` only if it is still the entry registered under its id
    pub async fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn touch(&self, id: &str) -> Result<(), TerminalError> {
        self.get(id).await?.touch();
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(u16, u16), TerminalError> {
        Ok(self.get(id).await?.set_size(cols, rows))
    }

    /// Summaries of the sessions owned by `owner_id`, oldest first
    pub async fn list_by_owner(&self, owner_id: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<&Arc<Session>> = sessions
            .values()
            .filter(|s| s.is_owned_by(owner_id))
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        owned.into_iter().map(|s| s.summary()).collect()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PtyControl;
    use deckterm_types::Owner;
    use std::path::PathBuf;
    use std::time::Duration;

    struct InertPty;

    impl PtyControl for InertPty {
        fn write(&self, _data: &[u8]) -> bool {
            true
        }
        fn resize(&self, _cols: u16, _rows: u16) -> bool {
            true
        }
        fn close(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
        fn process_id(&self) -> Option<u32> {
            None
        }
    }

    fn session(id: &str, owner: &str) -> Arc<Session> {
        Arc::new(Session::new(
            id.to_string(),
            Owner::new(owner, format!("{}@example.com", owner)),
            PathBuf::from("/"),
            80,
            24,
            None,
            Arc::new(InertPty),
        ))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(session("a", "alice")).await);
        assert!(!registry.insert(session("a", "bob")).await);
        assert_eq!(registry.get("a").await.unwrap().owner.id, "alice");
        assert!(registry.remove("a").await.is_some());
        assert_eq!(registry.get("a").await.unwrap_err().reason(), "not_found");
    }

    #[tokio::test]
    async fn test_list_by_owner_filters() {
        let registry = SessionRegistry::new();
        registry.insert(session("a", "alice")).await;
        registry.insert(session("b", "bob")).await;
        registry.insert(session("c", "alice")).await;
        let ids: Vec<_> = registry
            .list_by_owner("alice")
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_resize_and_touch_unknown_id() {
        let registry = SessionRegistry::new();
        registry.insert(session("a", "alice")).await;
        assert_eq!(registry.resize("a", 100, 0).await.unwrap(), (100, 1));
        assert!(registry.touch("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_id_lock_serializes_same_id() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.lock_id("a").await;

        let other = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _guard = other.lock_id("a").await;
        });
        // A different id is not blocked
        let _b = tokio::time::timeout(Duration::from_secs(1), registry.lock_id("b"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
