//! Session Lifecycle Engine (spec.md §4.C7) — "the heart" of this crate.
//! Reconciles whatever the Poller and Push Processor observe into one
//! authoritative session history: resolves identity, decides new-vs-update,
//! runs the rule engine, records violations, and retires sessions once the
//! server stops reporting them.
//!
//! Grounded on `push_mode.rs`'s `PushModeEngine`: a struct holding the
//! durable dependencies (there, a DAG and per-node state; here, the store
//! and cache), one method per externally-triggered transition, each
//! validating its inputs before touching state and logging at the same
//! points the teacher does (`tracing` in place of the teacher's unused
//! `log` facade, since this crate's ambient logging already runs on
//! `tracing`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::adapter::ObservedSession;
use crate::cache::{CacheBackend, PubSubTopic};
use crate::error::{LifecycleError, StoreError};
use crate::mapper;
use crate::models::{Rule, Session, SessionId, Violation};
use crate::rule_engine::{self, EvalContext};
use crate::state_tracker::{self, PauseAccounting, StopInput};
use crate::store::SessionStore;
use crate::violation_recorder;

/// Backoff schedule reused from [`crate::store::RETRY_BACKOFF_MS`] for
/// store operations that can return `StoreError::SerializationFailure`
/// without already being wrapped in a retrying transaction (spec.md §5).
async fn retry_on_conflict<F, Fut, T>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::SerializationFailure) if attempt < crate::store::RETRY_BACKOFF_MS.len() => {
                tokio::time::sleep(std::time::Duration::from_millis(
                    crate::store::RETRY_BACKOFF_MS[attempt],
                ))
                .await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// How far back [`LifecycleEngine`] looks when building rule-evaluation
/// history (spec.md §4.C5 rule windows top out at 24h for device velocity;
/// a week comfortably covers every rule type this crate ships).
const HISTORY_WINDOW: chrono::Duration = chrono::Duration::days(7);

/// True when a live session's rating key no longer matches the latest
/// observation under the same session key (spec.md §8 scenario 4 — media
/// change: "the user's player switched content without a new session
/// handshake").
fn rating_key_changed(live: &Session, observed: &ObservedSession) -> bool {
    match (&live.rating_key, &observed.rating_key) {
        (Some(existing), Some(new)) => existing != new,
        _ => false,
    }
}

/// Coordinates the session store, cache, and rule engine into the state
/// machine spec.md §4.C7 describes. One instance per running process;
/// [`crate::runtime::LifecycleRuntime`] owns it and hands it to the Poller
/// and Push Processor.
pub struct LifecycleEngine {
    store: Arc<dyn SessionStore>,
    cache: Arc<dyn CacheBackend>,
    rules: Vec<Rule>,
    create_lock_ttl: std::time::Duration,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn CacheBackend>,
        rules: Vec<Rule>,
        create_lock_ttl: std::time::Duration,
    ) -> Self {
        LifecycleEngine {
            store,
            cache,
            rules,
            create_lock_ttl,
        }
    }

    fn create_lock_key(observed: &ObservedSession) -> String {
        format!("create-lock:{}:{}", observed.server_id.0, observed.session_key)
    }

    /// Single entry point for a freshly observed playback: decides whether
    /// this is a brand-new session or an update to a live one, runs the
    /// rule engine either way, and returns the session as it stands after
    /// the call (spec.md §4.C7).
    pub async fn ingest_observation(
        &self,
        observed: ObservedSession,
        now: DateTime<Utc>,
    ) -> Result<Session, LifecycleError> {
        let server_user = self
            .store
            .upsert_server_user(observed.server_id, &observed.external_user_id, &observed.username)
            .await?;

        let session_key = crate::models::SessionKey::new(observed.session_key.clone())
            .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;

        let existing = self
            .store
            .get_live_session(observed.server_id, &session_key)
            .await?;

        // `create_session_with_rules` evaluates rules itself, transactionally,
        // as part of creating the row (spec.md §9) — every other branch still
        // needs the separate post-write evaluation pass below.
        let (session, rules_already_evaluated) = match existing {
            // Media change (spec.md §8 scenario 4): same session key, a
            // different rating key — the player switched content under the
            // same playback slot without a new handshake. No continuity
            // chain: the replacement starts fresh with `reference_id=None`.
            Some(live) if rating_key_changed(&live, &observed) => {
                (self.handle_continuity_change(live, &observed, now, None).await?, false)
            }
            Some(live) => (self.update_existing_session(live, &observed, now).await?, false),
            None => {
                // Quality change (spec.md §8 scenario 3): same rating key,
                // a new session key, while the old session for that rating
                // key is still live (e.g. a mid-play transcode renegotiation).
                // Linked via `reference_id`, and the watched latch carries
                // across the chain.
                match self
                    .find_quality_change_predecessor(server_user.id, &observed)
                    .await?
                {
                    Some(predecessor) => {
                        let predecessor_id = predecessor.id;
                        let session = self
                            .handle_continuity_change(predecessor, &observed, now, Some(predecessor_id))
                            .await?;
                        (session, false)
                    }
                    None => {
                        let session = self
                            .create_session_with_rules(&observed, server_user.id, now)
                            .await?;
                        (session, true)
                    }
                }
            }
        };

        if !rules_already_evaluated {
            self.evaluate_and_record_rules(&session).await?;
        }
        Ok(session)
    }

    /// Finds a still-live session for this user with the same rating key
    /// but a different session key (spec.md §8 scenario 3 — quality
    /// change). `None` if the observation carries no rating key or no such
    /// predecessor exists.
    async fn find_quality_change_predecessor(
        &self,
        server_user_id: crate::models::ServerUserId,
        observed: &ObservedSession,
    ) -> Result<Option<Session>, LifecycleError> {
        let Some(rating_key) = observed.rating_key.as_deref() else {
            return Ok(None);
        };

        let live = self.store.live_sessions_for_server_user(server_user_id).await?;
        Ok(live.into_iter().find(|s| {
            s.server_id == observed.server_id
                && s.rating_key.as_deref() == Some(rating_key)
                && s.session_key.as_str() != observed.session_key
        }))
    }

    /// Creates a brand-new live session, guarded by the distributed
    /// create-lock so two concurrent observations of the same
    /// `(server, session_key)` never both win the race (spec.md §5).
    async fn create_session_with_rules(
        &self,
        observed: &ObservedSession,
        server_user_id: crate::models::ServerUserId,
        now: DateTime<Utc>,
    ) -> Result<Session, LifecycleError> {
        let lock_key = Self::create_lock_key(observed);
        let acquired = self
            .cache
            .try_acquire_create_lock(&lock_key, self.create_lock_ttl)
            .await?;

        if !acquired {
            debug!(key = %lock_key, "create lock held elsewhere, re-reading live session");
            let session_key = crate::models::SessionKey::new(observed.session_key.clone())
                .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;
            if let Some(live) = self.store.get_live_session(observed.server_id, &session_key).await? {
                return Ok(live);
            }
            return Err(LifecycleError::RetriesExhausted { attempts: 0 });
        }

        let result = async {
            let session = mapper::map_new_session(observed, server_user_id, now)
                .map_err(|_| StoreError::Backend("empty session key".into()))?;

            // Insert, rule evaluation, violation insert, and trust-score
            // penalty all happen inside one SERIALIZABLE transaction on the
            // store side (spec.md §9). Broadcasting happens here, strictly
            // after that call returns, so a retried or rolled-back attempt
            // never leaks a phantom event.
            let since = session.started_at - HISTORY_WINDOW;
            let violations = self
                .store
                .create_session_with_rules(&session, &self.rules, since)
                .await?;

            self.cache.set_active(&session).await.map_err(LifecycleError::Cache)?;

            let payload = serde_json::to_string(&session).unwrap_or_default();
            self.cache
                .publish(PubSubTopic::SessionStarted, &payload)
                .await
                .map_err(LifecycleError::Cache)?;

            for violation in &violations {
                violation_recorder::broadcast(self.cache.as_ref(), violation)
                    .await
                    .map_err(LifecycleError::Cache)?;
            }

            info!(
                session_id = %session.id.0,
                server_user_id = %server_user_id.0,
                violations = violations.len(),
                "session started"
            );
            Ok::<_, LifecycleError>(session)
        }
        .await;

        self.cache.release_create_lock(&lock_key).await.map_err(LifecycleError::Cache)?;
        result
    }

    /// Applies a fresh observation to an already-live session: updates
    /// progress/observation fields, folds pause/resume transitions through
    /// [`state_tracker::accumulate_pause`], and persists + republishes the
    /// result (spec.md §4.C7).
    async fn update_existing_session(
        &self,
        mut session: Session,
        observed: &ObservedSession,
        now: DateTime<Utc>,
    ) -> Result<Session, LifecycleError> {
        let new_state = if observed.is_paused {
            crate::models::SessionState::Paused
        } else {
            crate::models::SessionState::Playing
        };

        let accounting = state_tracker::accumulate_pause(
            session.state,
            new_state,
            PauseAccounting {
                last_paused_at: session.last_paused_at,
                paused_duration_ms: session.paused_duration_ms,
            },
            now,
        );

        mapper::apply_observation(&mut session, observed, now);
        session.state = new_state;
        session.last_paused_at = accounting.last_paused_at;
        session.paused_duration_ms = accounting.paused_duration_ms;

        retry_on_conflict(|| self.store.update_session(&session)).await?;
        self.cache.set_active(&session).await.map_err(LifecycleError::Cache)?;

        let payload = serde_json::to_string(&session).unwrap_or_default();
        self.cache
            .publish(PubSubTopic::SessionUpdated, &payload)
            .await
            .map_err(LifecycleError::Cache)?;

        Ok(session)
    }

    /// Stops a live session. Idempotent: a session already stopped (by a
    /// racing poll/push delivery) is a no-op, not an error (spec.md §4.C3
    /// invariant 5, §4.C7).
    pub async fn stop_session_atomic(
        &self,
        session_id: SessionId,
        stopped_at: DateTime<Utc>,
    ) -> Result<Option<Session>, LifecycleError> {
        let session = self.store.get_session(session_id).await?;
        if !session.is_live() {
            return Ok(None);
        }

        let stop = state_tracker::stop_duration(
            StopInput {
                started_at: session.started_at,
                last_paused_at: session.last_paused_at,
                paused_duration_ms: session.paused_duration_ms,
            },
            stopped_at,
        );
        // Watched latch (spec.md §8): once true, stays true regardless of
        // what this particular stop's progress looks like.
        let watched = session.watched || state_tracker::watch_completion(session.progress_ms, session.total_duration_ms);
        let short_session = !state_tracker::should_record(stop.duration_ms);

        let stopped = retry_on_conflict(|| {
            self.store.stop_session(
                session_id,
                stopped_at,
                stop.duration_ms,
                stop.final_paused_duration_ms,
                watched,
                short_session,
            )
        })
        .await?;

        if !stopped {
            return Ok(None);
        }

        self.cache.remove_active(session_id).await.map_err(LifecycleError::Cache)?;

        let mut finished = session;
        finished.state = crate::models::SessionState::Stopped;
        finished.stopped_at = Some(stopped_at);
        finished.duration_ms = Some(stop.duration_ms);
        finished.paused_duration_ms = stop.final_paused_duration_ms;
        finished.watched = watched;
        finished.short_session = short_session;

        let payload = serde_json::to_string(&finished).unwrap_or_default();
        self.cache
            .publish(PubSubTopic::SessionStopped, &payload)
            .await
            .map_err(LifecycleError::Cache)?;

        info!(session_id = %session_id.0, duration_ms = stop.duration_ms, watched, short_session, "session stopped");
        Ok(Some(finished))
    }

    /// Stops `existing` and starts a replacement session for the same
    /// user, used by both continuity scenarios of spec.md §8:
    /// - Quality change (scenario 3): `reference_id = Some(existing.id)`,
    ///   and the watched latch carries forward onto the new session.
    /// - Media change (scenario 4): `reference_id = None` — a fresh,
    ///   unrelated session under the same session key.
    async fn handle_continuity_change(
        &self,
        existing: Session,
        observed: &ObservedSession,
        now: DateTime<Utc>,
        reference_id: Option<SessionId>,
    ) -> Result<Session, LifecycleError> {
        let server_user_id = existing.server_user_id;
        let existing_id = existing.id;
        let carried_watched = existing.watched;

        let stopped = self.stop_session_atomic(existing_id, now).await?;
        let carried_watched = stopped.map(|s| s.watched).unwrap_or(carried_watched);

        let mut new_session = mapper::map_new_session(observed, server_user_id, now)
            .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;
        new_session.reference_id = reference_id;
        if reference_id.is_some() {
            new_session.watched = carried_watched;
        }

        retry_on_conflict(|| self.store.insert_session(&new_session)).await?;
        self.cache.set_active(&new_session).await.map_err(LifecycleError::Cache)?;

        let payload = serde_json::to_string(&new_session).unwrap_or_default();
        self.cache
            .publish(PubSubTopic::SessionStarted, &payload)
            .await
            .map_err(LifecycleError::Cache)?;

        info!(
            session_id = %new_session.id.0,
            predecessor_id = %existing_id.0,
            reference_id = ?reference_id.map(|r| r.0),
            "continuity change: old session stopped, replacement started"
        );
        Ok(new_session)
    }

    /// Handles an inbound `paused` push event (spec.md §4.C9): requires an
    /// existing live row for this session key. A paused push with no live
    /// row to update is dropped, not promoted into a new session.
    pub async fn apply_paused_event(
        &self,
        mut observed: ObservedSession,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, LifecycleError> {
        let session_key = crate::models::SessionKey::new(observed.session_key.clone())
            .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;
        let Some(live) = self.store.get_live_session(observed.server_id, &session_key).await? else {
            warn!(session_key = %observed.session_key, "paused push for a session with no live row, dropping");
            return Ok(None);
        };

        observed.is_paused = true;
        let session = self.update_existing_session(live, &observed, now).await?;
        self.evaluate_and_record_rules(&session).await?;
        Ok(Some(session))
    }

    /// Handles an inbound `stopped` push event (spec.md §4.C9): stops the
    /// live session under this key, if one still exists. A push for an
    /// already-stopped key is a no-op, not an error.
    pub async fn apply_stopped_event(
        &self,
        server_id: crate::models::ServerId,
        session_key_raw: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, LifecycleError> {
        let session_key = crate::models::SessionKey::new(session_key_raw.to_string())
            .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;
        let Some(live) = self.store.get_live_session(server_id, &session_key).await? else {
            return Ok(None);
        };
        self.stop_session_atomic(live.id, now).await
    }

    /// Handles an inbound `progress` push event (spec.md §4.C9): the cheap
    /// path, updating only `progress_ms`/`total_duration_ms` and the
    /// watched latch, broadcasting only on the false→true watched
    /// transition. Drops the event if no live row exists for this key.
    pub async fn apply_progress_event(
        &self,
        observed: ObservedSession,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, LifecycleError> {
        let session_key = crate::models::SessionKey::new(observed.session_key.clone())
            .map_err(|_| LifecycleError::Store(StoreError::Backend("empty session key".into())))?;
        let Some(mut session) = self.store.get_live_session(observed.server_id, &session_key).await? else {
            return Ok(None);
        };

        let was_watched = session.watched;
        session.progress_ms = observed.progress_ms;
        session.total_duration_ms = observed.total_duration_ms;
        session.last_seen_at = now;
        session.watched =
            was_watched || state_tracker::watch_completion(session.progress_ms, session.total_duration_ms);

        retry_on_conflict(|| self.store.update_session(&session)).await?;
        self.cache.set_active(&session).await.map_err(LifecycleError::Cache)?;

        if !was_watched && session.watched {
            let payload = serde_json::to_string(&session).unwrap_or_default();
            self.cache
                .publish(PubSubTopic::SessionUpdated, &payload)
                .await
                .map_err(LifecycleError::Cache)?;
        }

        Ok(Some(session))
    }

    /// Runs every active rule that applies to `session.server_user_id`
    /// against it, recording any violations found (spec.md §4.C5/§4.C6).
    async fn evaluate_and_record_rules(&self, session: &Session) -> Result<Vec<Violation>, LifecycleError> {
        let since = session.started_at - HISTORY_WINDOW;
        let history = self
            .store
            .recent_sessions_for_server_user(session.server_user_id, since)
            .await?;
        let live = self
            .store
            .live_sessions_for_server_user(session.server_user_id)
            .await?;

        let recent_history: Vec<Session> = history.into_iter().filter(|s| s.id != session.id).collect();
        let concurrent_live: Vec<Session> = live.into_iter().filter(|s| s.id != session.id).collect();

        let ctx = EvalContext {
            session,
            recent_history: &recent_history,
            concurrent_live: &concurrent_live,
        };

        let mut recorded = Vec::new();
        for rule in self.rules.iter().filter(|r| r.is_active && r.applies_to(session.server_user_id)) {
            let result = rule_engine::evaluate(rule, &ctx);
            if !result.violated {
                continue;
            }
            match violation_recorder::record_violation(
                self.store.as_ref(),
                self.cache.as_ref(),
                rule,
                session,
                &result,
            )
            .await
            {
                Ok(Some(violation)) => recorded.push(violation),
                Ok(None) => {}
                Err(e) => warn!(rule = rule.name, error = %e, "failed to record violation"),
            }
        }

        Ok(recorded)
    }
}
