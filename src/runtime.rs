//! Runtime / dependency injection (spec.md §9 Design Notes: "process-wide
//! singletons → dependency injection"). [`LifecycleRuntime`] owns the
//! store, cache, lifecycle engine, and every background task (one Poller
//! per registered adapter, one Push Processor per push-capable adapter,
//! the Aggregator) and wires them together instead of reaching for
//! globals. `start`/`stop` carry the same double-start guard the
//! Aggregator and teacher's `AppState` use.
//!
//! Grounded on the teacher's `AppState` (a struct bundling the data
//! provider and config behind an `Arc`, constructed once in `run_server`
//! and handed to every handler) generalized from "one provider, one
//! router" to "one store/cache pair, several background drivers".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::adapter::MediaServerAdapter;
use crate::aggregator::Aggregator;
use crate::cache::CacheBackend;
use crate::config::Settings;
use crate::lifecycle::LifecycleEngine;
use crate::models::{Rule, ServerId, ServerVariant};
use crate::poller::Poller;
use crate::push_processor::PushProcessor;
use crate::server::ApiState;
use crate::store::SessionStore;

/// One configured media-server adapter plus the variant it serves — the
/// runtime needs the variant to know whether to also start a Push
/// Processor for it (spec.md §6: only Plex pushes).
pub struct AdapterHandle {
    pub adapter: Arc<dyn MediaServerAdapter>,
    pub variant: ServerVariant,
}

/// Bundles every long-lived dependency and background task for one
/// running process. Construct once, call [`start`](Self::start), and keep
/// the handle alive until shutdown.
pub struct LifecycleRuntime {
    settings: Settings,
    store: Arc<dyn SessionStore>,
    cache: Arc<dyn CacheBackend>,
    engine: Arc<LifecycleEngine>,
    adapters: Vec<AdapterHandle>,
    /// One processor per push-capable adapter, keyed by the server it
    /// serves — shared with the HTTP surface so an inbound webhook can be
    /// routed to the processor for its server (spec.md §4.C9).
    push_processors: HashMap<ServerId, Arc<PushProcessor>>,
    aggregator: Arc<Aggregator>,
    running: AtomicBool,
    shutdown_tx: std::sync::Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl LifecycleRuntime {
    pub fn new(
        settings: Settings,
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn CacheBackend>,
        rules: Vec<Rule>,
        adapters: Vec<AdapterHandle>,
    ) -> Self {
        let engine = Arc::new(LifecycleEngine::new(
            store.clone(),
            cache.clone(),
            rules,
            settings.create_lock_ttl(),
        ));
        let aggregator = Arc::new(Aggregator::new(
            cache.clone(),
            settings.aggregator_interval(),
            settings.aggregator_enabled,
        ));

        let push_processors = adapters
            .iter()
            .filter(|handle| handle.variant.supports_push())
            .map(|handle| {
                let processor = Arc::new(PushProcessor::new(
                    handle.adapter.clone(),
                    handle.variant,
                    engine.clone(),
                ));
                (handle.adapter.server_id(), processor)
            })
            .collect();

        LifecycleRuntime {
            settings,
            store,
            cache,
            engine,
            adapters,
            push_processors,
            aggregator,
            running: AtomicBool::new(false),
            shutdown_tx: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the Poller for every adapter, a Push Processor for every
    /// push-capable one, the Aggregator, and the health/readiness HTTP
    /// server. A second call while already running logs `already running`
    /// and returns without spawning a second set of tasks (spec.md §4.C10
    /// applies the same guard; the runtime extends it to itself).
    pub async fn start(&self) -> Result<(), std::io::Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("runtime already running");
            return Ok(());
        }

        let (tx, rx) = tokio::sync::watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(tx);

        for handle in &self.adapters {
            let poller = Poller::new(
                handle.adapter.clone(),
                self.engine.clone(),
                self.cache.clone(),
                self.settings.poll_interval(),
                self.settings.adapter_timeout(),
            );
            let poller_rx = rx.clone();
            tokio::spawn(async move { poller.run(poller_rx).await });

            if handle.variant.supports_push() {
                info!(variant = handle.variant.as_str(), "push delivery available, processor ready");
            }
        }

        let aggregator = self.aggregator.clone();
        let aggregator_rx = rx.clone();
        tokio::spawn(async move { aggregator.run(aggregator_rx).await });

        let api_state = Arc::new(ApiState::new(self.cache.clone(), self.push_processors.clone()));
        let host = self.settings.http_host.clone();
        let port = self.settings.http_port;
        tokio::spawn(async move {
            if let Err(e) = crate::server::run(&host, port, api_state).await {
                tracing::error!(error = %e, "health server exited");
            }
        });

        info!("lifecycle runtime started");
        Ok(())
    }

    /// Signals every background task to stop. Idempotent — calling it
    /// without a prior [`start`](Self::start) is a no-op.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("lifecycle runtime stopped");
    }

    pub fn engine(&self) -> Arc<LifecycleEngine> {
        self.engine.clone()
    }

    /// Exposes the store this runtime was built with, for callers that sit
    /// outside the lifecycle/poller/push-processor graph (e.g. a
    /// maintenance job resetting trust scores — spec.md §3's "maintenance
    /// jobs may reset it").
    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;
    use crate::cache::InMemoryCache;
    use crate::models::ServerId;
    use crate::store::InMemorySessionStore;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.poll_interval_secs = 3600;
        s.aggregator_interval_secs = 3600;
        s
    }

    #[tokio::test]
    async fn stop_before_start_is_a_safe_no_op() {
        let server_id = ServerId::new();
        let adapter: Arc<dyn MediaServerAdapter> = Arc::new(InMemoryAdapter::new(server_id));
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());

        let runtime = LifecycleRuntime::new(
            settings(),
            store,
            cache,
            vec![],
            vec![AdapterHandle {
                adapter,
                variant: ServerVariant::Jellyfin,
            }],
        );

        assert!(!runtime.is_running());
        runtime.stop();
        assert!(!runtime.is_running());
    }
}
