//! Cache & PubSub (spec.md §4.C4): the fast, ephemeral path that sits in
//! front of the session store. Active sessions live here so reads never
//! have to hit Postgres, and the distributed create-lock serializes
//! session-creation races across however many lifecycle-engine instances
//! are running.
//!
//! Grounded on the `redis` usage in `cp5337-sx9`'s CDN data-fabric layer —
//! this crate never had a cache layer of its own, so the pattern (atomic
//! pipelines, a `CircularBuffer`-shaped "most recent N" index, pub/sub
//! topics) is imported wholesale rather than adapted from `push_mode.rs`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::CacheError;
use crate::models::{Session, SessionId};

/// Channels published to as session/violation state changes (spec.md §4.C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubTopic {
    SessionStarted,
    SessionUpdated,
    SessionStopped,
    ViolationNew,
    ReconciliationNeeded,
}

impl PubSubTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            PubSubTopic::SessionStarted => "session:started",
            PubSubTopic::SessionUpdated => "session:updated",
            PubSubTopic::SessionStopped => "session:stopped",
            PubSubTopic::ViolationNew => "violation:new",
            PubSubTopic::ReconciliationNeeded => "reconciliation:needed",
        }
    }
}

/// The active-session cache plus the distributed lock and pub/sub used to
/// coordinate session creation and broadcast state changes (spec.md §4.C4).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Writes the session payload and adds its id to the active-session
    /// index in one atomic operation — never read-modify-write (spec.md §5).
    async fn set_active(&self, session: &Session) -> Result<(), CacheError>;

    async fn get_active(&self, id: SessionId) -> Result<Option<Session>, CacheError>;

    /// Removes the session payload and its id from the active index
    /// atomically, mirroring [`set_active`](CacheBackend::set_active).
    async fn remove_active(&self, id: SessionId) -> Result<(), CacheError>;

    async fn active_session_ids(&self) -> Result<Vec<SessionId>, CacheError>;

    /// `SET key NX EX ttl` — acquires the distributed session-creation lock
    /// keyed by `(server_id, session_key)`. Returns `false` if another
    /// process holds it (spec.md §5).
    async fn try_acquire_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn release_create_lock(&self, key: &str) -> Result<(), CacheError>;

    async fn publish(&self, topic: PubSubTopic, payload: &str) -> Result<(), CacheError>;

    /// Overwrites the dashboard statistics cache entry (spec.md §4.C10).
    /// A plain string slot, not a typed one — the aggregator owns the shape
    /// of what it stores there, the cache just holds it.
    async fn set_stats(&self, payload: &str) -> Result<(), CacheError>;

    async fn get_stats(&self) -> Result<Option<String>, CacheError>;
}

/// Redis-backed [`CacheBackend`]. `active_sessions` is a Redis set of ids;
/// each session's payload lives at `session:{id}`; the create-lock is a
/// plain string key with `NX EX`.
pub struct RedisCache {
    client: redis::Client,
}

const ACTIVE_SESSIONS_KEY: &str = "active_sessions";
const DASHBOARD_STATS_KEY: &str = "dashboard_stats";

/// Safety-net expiry for a cached session payload (spec.md §4.C4 requires
/// `SETEX`, not a bare `SET`): the cache is a derived projection, never
/// the source of truth for session existence, so a payload that
/// outlives its `remove_active` call (a crashed process, a dropped
/// pub/sub) ages out on its own rather than sticking around forever.
/// Refreshed on every `set_active` call, so a long-running live session
/// never actually expires mid-playback.
const SESSION_PAYLOAD_TTL_SECS: u64 = 86_400;

fn session_payload_key(id: SessionId) -> String {
    format!("session:{}", id.0)
}

impl RedisCache {
    pub fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        Ok(RedisCache { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set_active(&self, session: &Session) -> Result<(), CacheError> {
        let payload = serde_json::to_string(session)
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut conn = self.conn().await?;
        // spec.md §4.C4/§5: add-id + setex payload + invalidate dashboard,
        // pipelined atomically — never read-modify-write the ID set.
        redis::pipe()
            .atomic()
            .sadd(ACTIVE_SESSIONS_KEY, session.id.0.to_string())
            .set_ex(session_payload_key(session.id), payload, SESSION_PAYLOAD_TTL_SECS)
            .del(DASHBOARD_STATS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::from)
    }

    async fn get_active(&self, id: SessionId) -> Result<Option<Session>, CacheError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(session_payload_key(id)).await.map_err(CacheError::from)?;
        match payload {
            Some(raw) => {
                let session = serde_json::from_str(&raw).map_err(|e| CacheError::Backend(e.to_string()))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn remove_active(&self, id: SessionId) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        // remove-id + del payload + invalidate dashboard, same pipelining
        // discipline as set_active.
        redis::pipe()
            .atomic()
            .srem(ACTIVE_SESSIONS_KEY, id.0.to_string())
            .del(session_payload_key(id))
            .del(DASHBOARD_STATS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::from)
    }

    async fn active_session_ids(&self) -> Result<Vec<SessionId>, CacheError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.smembers(ACTIVE_SESSIONS_KEY).await.map_err(CacheError::from)?;
        Ok(raw
            .into_iter()
            .filter_map(|s| s.parse::<uuid::Uuid>().ok())
            .map(SessionId)
            .collect())
    }

    async fn try_acquire_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(CacheError::from)?
            .is_some();
        Ok(acquired)
    }

    async fn release_create_lock(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(CacheError::from)
    }

    async fn publish(&self, topic: PubSubTopic, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(topic.as_str(), payload)
            .await
            .map_err(CacheError::from)
    }

    async fn set_stats(&self, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(DASHBOARD_STATS_KEY, payload)
            .await
            .map_err(CacheError::from)
    }

    async fn get_stats(&self) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(DASHBOARD_STATS_KEY).await.map_err(CacheError::from)
    }
}

struct InMemoryLock {
    expires_at: Instant,
}

/// In-memory test double — same role as [`crate::store::InMemorySessionStore`],
/// a `Mutex`-guarded map standing in for the real backend in unit tests.
#[derive(Default)]
pub struct InMemoryCache {
    active: std::sync::Mutex<HashMap<SessionId, Session>>,
    locks: std::sync::Mutex<HashMap<String, InMemoryLock>>,
    published: std::sync::Mutex<Vec<(String, String)>>,
    stats: std::sync::Mutex<Option<String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: everything published so far, in order.
    pub fn published_messages(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn set_active(&self, session: &Session) -> Result<(), CacheError> {
        self.active.lock().unwrap().insert(session.id, session.clone());
        self.stats.lock().unwrap().take();
        Ok(())
    }

    async fn get_active(&self, id: SessionId) -> Result<Option<Session>, CacheError> {
        Ok(self.active.lock().unwrap().get(&id).cloned())
    }

    async fn remove_active(&self, id: SessionId) -> Result<(), CacheError> {
        self.active.lock().unwrap().remove(&id);
        self.stats.lock().unwrap().take();
        Ok(())
    }

    async fn active_session_ids(&self) -> Result<Vec<SessionId>, CacheError> {
        Ok(self.active.lock().unwrap().keys().copied().collect())
    }

    async fn try_acquire_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(key.to_string(), InMemoryLock { expires_at: now + ttl });
        Ok(true)
    }

    async fn release_create_lock(&self, key: &str) -> Result<(), CacheError> {
        self.locks.lock().unwrap().remove(key);
        Ok(())
    }

    async fn publish(&self, topic: PubSubTopic, payload: &str) -> Result<(), CacheError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.as_str().to_string(), payload.to_string()));
        Ok(())
    }

    async fn set_stats(&self, payload: &str) -> Result<(), CacheError> {
        *self.stats.lock().unwrap() = Some(payload.to_string());
        Ok(())
    }

    async fn get_stats(&self) -> Result<Option<String>, CacheError> {
        Ok(self.stats.lock().unwrap().clone())
    }
}
