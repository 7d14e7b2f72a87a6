use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of one participant session. Created once, then passed to every
/// operation that needs to know who is rating.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionContext {
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct SessionEntry {
    context: SessionContext,
    last_seen: DateTime<Utc>,
    submissions: u32,
}

/// Result of resolving a request against the registry.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub context: SessionContext,
    /// True when the identity was minted by this call and the client must be told about it.
    pub created: bool,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// Return the session named by `token` or start a new one. Unknown or
    /// malformed tokens never adopt the client-supplied value.
    pub async fn ensure_session_identity(&self, token: Option<&str>) -> SessionHandle {
        let now = Utc::now();
        let requested = token.and_then(|raw| Uuid::parse_str(raw.trim()).ok());

        let mut guard = self.sessions.write().await;
        let idle_timeout = self.idle_timeout;
        let before = guard.len();
        guard.retain(|_, entry| now - entry.last_seen <= idle_timeout);
        if guard.len() != before {
            debug!(pruned = before - guard.len(), "pruned idle survey sessions");
        }

        if let Some(id) = requested {
            if let Some(entry) = guard.get_mut(&id) {
                entry.last_seen = now;
                return SessionHandle {
                    context: entry.context.clone(),
                    created: false,
                };
            }
        }

        let context = SessionContext {
            user_id: Uuid::new_v4(),
            started_at: now,
        };
        guard.insert(
            context.user_id,
            SessionEntry {
                context: context.clone(),
                last_seen: now,
                submissions: 0,
            },
        );
        info!(user_id = %context.user_id, "started survey session");

        SessionHandle {
            context,
            created: true,
        }
    }

    /// Count a successful submission and return its 1-based attempt number.
    pub async fn record_submission(&self, session: &SessionContext) -> u32 {
        let mut guard = self.sessions.write().await;
        let entry = guard
            .entry(session.user_id)
            .or_insert_with(|| SessionEntry {
                context: session.clone(),
                last_seen: Utc::now(),
                submissions: 0,
            });
        entry.submissions += 1;
        entry.last_seen = Utc::now();
        entry.submissions
    }

    pub async fn submissions(&self, session: &SessionContext) -> u32 {
        let guard = self.sessions.read().await;
        guard
            .get(&session.user_id)
            .map(|entry| entry.submissions)
            .unwrap_or(0)
    }
}
