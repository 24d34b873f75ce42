//! Media-server adapter boundary (spec.md §4, "adapter layer"). Each
//! concrete server family (Plex, Jellyfin, Emby) implements
//! [`MediaServerAdapter`]; everything above this line only ever sees
//! [`ObservedSession`] values, never a server-specific wire shape.
//!
//! Grounded on the teacher's `DataProvider` trait shape (`sqlite_provider.rs`)
//! and its `InMemoryDataProvider` test double.

use async_trait::async_trait;

use crate::models::{MediaType, Observation, ServerId};

/// Which lifecycle event a pushed observation represents (spec.md §4.C9).
/// Poll-sourced observations are always `Sync`: a full snapshot entry that
/// should be created or updated the same way regardless of prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushEvent {
    #[default]
    Sync,
    Playing,
    Paused,
    Stopped,
    Progress,
}

/// One server-reported playback, as handed up from an adapter before
/// [`crate::mapper`] normalizes it into a `Session`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSession {
    pub server_id: ServerId,
    pub session_key: String,
    pub external_user_id: String,
    pub username: String,
    pub rating_key: Option<String>,
    pub title: String,
    pub media_type: MediaType,
    pub show_title: Option<String>,
    pub season_number: Option<i32>,
    pub episode_number: Option<i32>,
    pub year: Option<i32>,
    pub is_paused: bool,
    pub progress_ms: i64,
    pub total_duration_ms: i64,
    /// Artwork reported for the episode/track/channel itself.
    pub episode_artwork: Option<String>,
    /// Artwork reported for the parent show/channel, preferred over
    /// `episode_artwork` when present (spec.md §4.C2).
    pub show_artwork: Option<String>,
    pub observation: Observation,
    /// Which push event this came from; `Sync` for poll-sourced snapshots
    /// (spec.md §4.C9).
    pub event: PushEvent,
}

/// Errors surfaced while talking to a media server. Kept separate from
/// [`crate::error::StoreError`]/`CacheError` since adapter failures are a
/// distinct, outward-facing failure domain (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request to {server} timed out")]
    Timeout { server: String },
    #[error("{server} returned an unexpected response: {detail}")]
    BadResponse { server: String, detail: String },
    #[error("transport error talking to {server}: {source}")]
    Transport {
        server: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Polling and push-ingestion both go through this trait — the Poller
/// (C8) calls [`MediaServerAdapter::list_active_sessions`] on a timer, the
/// Push Processor (C9) calls [`MediaServerAdapter::parse_webhook`] on
/// inbound requests. One implementation per server variant.
#[async_trait]
pub trait MediaServerAdapter: Send + Sync {
    /// The server this adapter instance talks to.
    fn server_id(&self) -> ServerId;

    /// Full snapshot of everything the server currently reports as
    /// playing/paused. Used by the Poller (spec.md §4.C8).
    async fn list_active_sessions(&self) -> Result<Vec<ObservedSession>, AdapterError>;

    /// Decode a single push/webhook payload into an observation. Used by
    /// the Push Processor (spec.md §4.C9) — only implemented meaningfully
    /// for adapters whose server [supports push](crate::models::ServerVariant::supports_push).
    async fn parse_webhook(&self, payload: &[u8]) -> Result<ObservedSession, AdapterError>;
}

/// In-memory test double standing in for a real server connection.
/// Grounded on the teacher's `InMemoryDataProvider`: tests seed it with
/// canned snapshots/payloads instead of standing up an HTTP server.
pub struct InMemoryAdapter {
    server_id: ServerId,
    snapshot: std::sync::Mutex<Vec<ObservedSession>>,
    next_webhook: std::sync::Mutex<Option<ObservedSession>>,
}

impl InMemoryAdapter {
    pub fn new(server_id: ServerId) -> Self {
        InMemoryAdapter {
            server_id,
            snapshot: std::sync::Mutex::new(Vec::new()),
            next_webhook: std::sync::Mutex::new(None),
        }
    }

    /// Replaces the snapshot [`list_active_sessions`](MediaServerAdapter::list_active_sessions) will return.
    pub fn set_snapshot(&self, sessions: Vec<ObservedSession>) {
        *self.snapshot.lock().unwrap() = sessions;
    }

    /// Queues the value the next [`parse_webhook`](MediaServerAdapter::parse_webhook) call will return.
    pub fn queue_webhook(&self, session: ObservedSession) {
        *self.next_webhook.lock().unwrap() = Some(session);
    }
}

#[async_trait]
impl MediaServerAdapter for InMemoryAdapter {
    fn server_id(&self) -> ServerId {
        self.server_id
    }

    async fn list_active_sessions(&self) -> Result<Vec<ObservedSession>, AdapterError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn parse_webhook(&self, _payload: &[u8]) -> Result<ObservedSession, AdapterError> {
        self.next_webhook
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdapterError::BadResponse {
                server: "in-memory".into(),
                detail: "no webhook queued".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(server_id: ServerId) -> ObservedSession {
        ObservedSession {
            server_id,
            session_key: "sk-1".into(),
            external_user_id: "ext-1".into(),
            username: "alice".into(),
            rating_key: Some("rk-1".into()),
            title: "Some Movie".into(),
            media_type: MediaType::Movie,
            show_title: None,
            season_number: None,
            episode_number: None,
            year: Some(2024),
            is_paused: false,
            progress_ms: 0,
            total_duration_ms: 6_000_000,
            episode_artwork: None,
            show_artwork: None,
            observation: Observation::default(),
            event: PushEvent::Sync,
        }
    }

    #[tokio::test]
    async fn list_active_sessions_returns_seeded_snapshot() {
        let server_id = ServerId::new();
        let adapter = InMemoryAdapter::new(server_id);
        adapter.set_snapshot(vec![sample(server_id)]);

        let out = adapter.list_active_sessions().await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].session_key, "sk-1");
    }

    #[tokio::test]
    async fn parse_webhook_without_a_queued_payload_errors() {
        let adapter = InMemoryAdapter::new(ServerId::new());
        let err = adapter.parse_webhook(b"{}").await.unwrap_err();
        assert!(matches!(err, AdapterError::BadResponse { .. }));
    }

    #[tokio::test]
    async fn parse_webhook_returns_and_consumes_the_queued_payload() {
        let server_id = ServerId::new();
        let adapter = InMemoryAdapter::new(server_id);
        adapter.queue_webhook(sample(server_id));

        let first = adapter.parse_webhook(b"{}").await.unwrap();
        assert_eq!(first.session_key, "sk-1");

        let second = adapter.parse_webhook(b"{}").await;
        assert!(second.is_err());
    }
}
