use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use flowline_core::error::Result;
use flowline_core::run::SessionRecord;
use flowline_core::traits::SessionStore;
use flowline_core::types::SessionId;

/// Process-local store, for tests and one-off runs.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn get_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>> {
        let sid = session_id.0.clone();
        Box::pin(async move { Ok(self.sessions.read().await.get(&sid).cloned()) })
    }

    fn upsert_session(&self, record: SessionRecord) -> BoxFuture<'_, Result<SessionRecord>> {
        Box::pin(async move {
            self.sessions
                .write()
                .await
                .insert(record.session_id.0.clone(), record.clone());
            Ok(record)
        })
    }

    fn delete_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let sid = session_id.0.clone();
        Box::pin(async move { Ok(self.sessions.write().await.remove(&sid).is_some()) })
    }

    fn list_sessions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionRecord>>> {
        Box::pin(async move {
            let mut records: Vec<SessionRecord> =
                self.sessions.read().await.values().cloned().collect();
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            records.truncate(limit);
            Ok(records)
        })
    }
}
