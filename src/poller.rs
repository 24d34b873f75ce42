//! Poller (spec.md §4.C8): the periodic half of the dual-producer model.
//! Wakes on a fixed interval, asks every registered adapter for its full
//! active-session snapshot, and feeds each one through the lifecycle
//! engine. Also responsible for noticing sessions that simply vanished
//! (the server stopped reporting them without ever sending a stop event)
//! and retiring them.
//!
//! Grounded on `replay.rs`'s fixed-interval "drive a data source through
//! an engine" loop, generalized from replaying historical ticks to polling
//! a live adapter on a `tokio::time::interval`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::adapter::MediaServerAdapter;
use crate::cache::CacheBackend;
use crate::lifecycle::LifecycleEngine;
use crate::models::SessionId;

/// Polls one adapter on a fixed interval and reconciles its snapshot
/// against the lifecycle engine's view of that server's live sessions
/// (spec.md §4.C8). Store access for each observation goes through
/// `engine`, which owns the store itself; the poller never talks to the
/// store directly.
pub struct Poller {
    adapter: Arc<dyn MediaServerAdapter>,
    engine: Arc<LifecycleEngine>,
    cache: Arc<dyn CacheBackend>,
    interval: std::time::Duration,
    adapter_timeout: std::time::Duration,
}

impl Poller {
    pub fn new(
        adapter: Arc<dyn MediaServerAdapter>,
        engine: Arc<LifecycleEngine>,
        cache: Arc<dyn CacheBackend>,
        interval: std::time::Duration,
        adapter_timeout: std::time::Duration,
    ) -> Self {
        Poller {
            adapter,
            engine,
            cache,
            interval,
            adapter_timeout,
        }
    }

    /// Runs until `shutdown` resolves. Each tick is independent — an
    /// adapter error on one tick is logged and the loop keeps going, since
    /// the next tick will simply retry (spec.md §7: transient adapter
    /// failures are not fatal to the process).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "poll cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("poller shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One poll cycle: fetch the snapshot, ingest every observation, then
    /// stop any previously-live session for this server that the snapshot
    /// no longer mentions (spec.md §4.C8 — the server stopped reporting it
    /// without a push-delivered stop event).
    pub async fn poll_once(&self) -> Result<(), crate::adapter::AdapterError> {
        let snapshot = tokio::time::timeout(self.adapter_timeout, self.adapter.list_active_sessions())
            .await
            .map_err(|_| crate::adapter::AdapterError::Timeout {
                server: self.adapter.server_id().0.to_string(),
            })??;
        let now = Utc::now();

        let observed_keys: HashSet<String> = snapshot.iter().map(|s| s.session_key.clone()).collect();

        for observed in snapshot {
            if let Err(e) = self.engine.ingest_observation(observed, now).await {
                warn!(error = %e, "failed to ingest polled observation");
            }
        }

        if let Err(e) = self.reconcile_vanished(self.adapter.server_id(), &observed_keys, now).await {
            warn!(error = %e, "failed to reconcile vanished sessions");
        }

        Ok(())
    }

    async fn reconcile_vanished(
        &self,
        server_id: crate::models::ServerId,
        observed_keys: &HashSet<String>,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), crate::error::StoreError> {
        let ids: Vec<SessionId> = self.cache.active_session_ids().await.map_err(|e| {
            crate::error::StoreError::Backend(e.to_string())
        })?;

        for id in ids {
            let Some(cached) = self
                .cache
                .get_active(id)
                .await
                .map_err(|e| crate::error::StoreError::Backend(e.to_string()))?
            else {
                continue;
            };
            if cached.server_id != server_id {
                continue;
            }
            if observed_keys.contains(cached.session_key.as_str()) {
                continue;
            }

            info!(session_id = %id.0, "session vanished from poll snapshot, stopping");
            if let Err(e) = self.engine.stop_session_atomic(id, now).await {
                warn!(session_id = %id.0, error = %e, "failed to stop vanished session");
            }
        }

        Ok(())
    }
}
