//! Aggregator (spec.md §4.C10): timer-driven refresh of the dashboard
//! statistics cache entry. Recomputing is a single function call
//! (`Aggregator::run_once`); the timer loop around it guards against
//! being started twice, the same way the rest of the runtime does.
//!
//! Grounded on the teacher's `ServerConfig`/interval-timer shape (a plain
//! struct driving a `tokio::time::interval` loop) and the double-start
//! guard implicit in `AppState`'s shared, lock-guarded session map — here
//! an `AtomicBool` on the aggregator itself plays that role.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheBackend;
use crate::error::CacheError;
use crate::models::MediaType;

/// The dashboard statistics snapshot written to the cache (spec.md
/// §4.C10). Shape is owned entirely by this module; the cache just holds
/// the serialized form under a well-known key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub live_session_count: usize,
    pub live_by_media_type: HashMap<String, usize>,
    pub computed_at: DateTime<Utc>,
}

/// Recomputes [`DashboardStats`] from the cache's own active-session view
/// and writes it back under the dashboard-stats slot (spec.md §4.C10: "a
/// single function call to recompute and set the cache").
pub struct Aggregator {
    cache: Arc<dyn CacheBackend>,
    interval: std::time::Duration,
    enabled: bool,
    running: AtomicBool,
}

impl Aggregator {
    pub fn new(cache: Arc<dyn CacheBackend>, interval: std::time::Duration, enabled: bool) -> Self {
        Aggregator {
            cache,
            interval,
            enabled,
            running: AtomicBool::new(false),
        }
    }

    /// Runs the refresh loop until `shutdown` resolves. Disabled
    /// aggregators (`enabled: false`) return immediately without ever
    /// touching the cache. A second call while one is already running logs
    /// `already running` and returns without starting a second loop
    /// (spec.md §4.C10).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !self.enabled {
            debug!("aggregator disabled, not starting");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("aggregator already running");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "dashboard stats refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("aggregator shutting down");
                        self.running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    }

    /// Recomputes and writes the dashboard statistics cache entry once.
    pub async fn run_once(&self) -> Result<DashboardStats, CacheError> {
        let ids = self.cache.active_session_ids().await?;
        let mut live_by_media_type: HashMap<String, usize> = HashMap::new();

        for id in &ids {
            if let Some(session) = self.cache.get_active(*id).await? {
                *live_by_media_type
                    .entry(media_type_key(session.media_type))
                    .or_insert(0) += 1;
            }
        }

        let stats = DashboardStats {
            live_session_count: ids.len(),
            live_by_media_type,
            computed_at: Utc::now(),
        };

        let payload = serde_json::to_string(&stats).map_err(|e| CacheError::Backend(e.to_string()))?;
        self.cache.set_stats(&payload).await?;
        debug!(live = stats.live_session_count, "refreshed dashboard stats");
        Ok(stats)
    }
}

fn media_type_key(media_type: MediaType) -> String {
    match media_type {
        MediaType::Movie => "movie",
        MediaType::Episode => "episode",
        MediaType::Track => "track",
        MediaType::Live => "live",
        MediaType::Photo => "photo",
        MediaType::Unknown => "unknown",
    }
    .to_string()
}
