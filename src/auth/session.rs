use std::{sync::Arc, time::Duration};

use tracing::debug;
use uuid::Uuid;

use crate::cache::KvCache;

/// Server-side session entries: `session:<sid>` -> user id.
/// A bearer token is only honored while its entry exists.
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn KvCache>,
    ttl: Duration,
}

fn key(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

impl SessionStore {
    pub fn new(cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn create(&self, user_id: Uuid) -> anyhow::Result<Uuid> {
        let session_id = Uuid::new_v4();
        self.cache
            .set_ex(&key(session_id), &user_id.to_string(), self.ttl)
            .await?;
        debug!(%user_id, %session_id, ttl_secs = self.ttl.as_secs(), "session created");
        Ok(session_id)
    }

    /// Read-only lookup; never refreshes or rewrites the entry.
    pub async fn owner(&self, session_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        let value = self.cache.get(&key(session_id)).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Idempotent: revoking an unknown session is not an error.
    pub async fn revoke(&self, session_id: Uuid) -> anyhow::Result<()> {
        let removed = self.cache.delete(&key(session_id)).await?;
        debug!(%session_id, removed, "session revoked");
        Ok(())
    }
}
