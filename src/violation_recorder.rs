//! Violation Recorder (spec.md §4.C6): turns a violated [`RuleResult`]
//! into a persisted [`Violation`], applies the trust-score penalty, and
//! broadcasts it.
//!
//! `record_violation` below is the path used for sessions already live
//! (updates and continuity changes): violation insert and trust-score
//! update are each their own store call, deduped via `ON CONFLICT DO
//! NOTHING` on `(session_id, rule_id)`. The one path where a session's
//! first write and its rule evaluation must be indivisible — creating a
//! brand-new session — does not come through here at all; it goes
//! through [`crate::store::SessionStore::create_session_with_rules`],
//! which runs the insert, the evaluation, and any resulting violation
//! inserts inside a single SERIALIZABLE transaction. Both paths publish
//! through [`broadcast`] only after their write has committed.
//!
//! Grounded on the teacher's `SqliteDataProvider` insert pattern
//! (`store_asset_equity`/`store_analytics`: map domain value to row,
//! `INSERT ... ON CONFLICT`, map DB errors into the domain enum) combined
//! with the dedup strategy spec.md §4.C6 calls for: `ON CONFLICT DO
//! NOTHING` on `(session_id, rule_id)` so a rule re-evaluated against an
//! already-flagged session never produces a second violation or a second
//! trust-score deduction.

use crate::cache::{CacheBackend, PubSubTopic};
use crate::error::{CacheError, StoreError};
use crate::models::{Rule, ServerUserId, Session, Violation, ViolationId};
use crate::rule_engine::RuleResult;
use crate::store::SessionStore;

/// Records a violation and applies its trust-score penalty, unless a
/// violation for this `(session, rule)` pair already exists (spec.md
/// §4.C6 dedup). Returns `None` when the write was deduped away.
pub async fn record_violation(
    store: &dyn SessionStore,
    cache: &dyn CacheBackend,
    rule: &Rule,
    session: &Session,
    result: &RuleResult,
) -> Result<Option<Violation>, RecordError> {
    if !result.violated {
        return Ok(None);
    }

    let violation = Violation {
        id: ViolationId::new(),
        rule_id: rule.id,
        rule_type: result.rule_type,
        server_user_id: session.server_user_id,
        session_id: session.id,
        severity: result.severity,
        data: result.data.clone(),
        created_at: session.last_seen_at,
        acknowledged_at: None,
    };

    let inserted = insert_violation_deduped(store, &violation).await?;
    if !inserted {
        return Ok(None);
    }

    store
        .apply_trust_penalty(session.server_user_id, result.severity.penalty())
        .await?;

    let user = store.get_server_user(session.server_user_id).await?;
    if is_untrusted(user.trust_score) {
        tracing::warn!(
            server_user_id = %user.id.0,
            trust_score = user.trust_score,
            "server user has hit the trust floor"
        );
    }

    broadcast(cache, &violation).await?;

    Ok(Some(violation))
}

/// Dedup insert — `ON CONFLICT (session_id, rule_id) DO NOTHING` in the
/// real store; the in-memory double checks the same pair before inserting
/// (spec.md §4.C6). Delegated to [`SessionStore`] implementations via a
/// violations table the store owns, so this module stays storage-agnostic.
async fn insert_violation_deduped(
    store: &dyn SessionStore,
    violation: &Violation,
) -> Result<bool, StoreError> {
    store.insert_violation_if_absent(violation).await
}

pub(crate) async fn broadcast(cache: &dyn CacheBackend, violation: &Violation) -> Result<(), CacheError> {
    let payload = serde_json::to_string(violation).unwrap_or_default();
    cache.publish(PubSubTopic::ViolationNew, &payload).await
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Given the up-to-date trust score after penalties have been applied,
/// whether the server user has crossed the "untrusted" floor (spec.md
/// §3: trust score floors at 0, never goes negative).
pub fn is_untrusted(trust_score: i32) -> bool {
    trust_score <= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MediaType, Observation, RuleParams, RuleType, ServerId, SessionId, SessionKey,
        SessionState, Severity, ViolationData,
    };
    use crate::store::InMemorySessionStore;
    use crate::cache::InMemoryCache;
    use chrono::Utc;

    fn sample_session(server_user_id: ServerUserId) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(),
            server_id: ServerId::new(),
            server_user_id,
            session_key: SessionKey::new("sk-1").unwrap(),
            rating_key: None,
            state: SessionState::Playing,
            title: "Some Movie".into(),
            media_type: MediaType::Movie,
            show_title: None,
            season_number: None,
            episode_number: None,
            year: None,
            artwork_path: None,
            started_at: now,
            last_seen_at: now,
            stopped_at: None,
            paused_duration_ms: 0,
            last_paused_at: None,
            duration_ms: None,
            progress_ms: 0,
            total_duration_ms: 6_000_000,
            watched: false,
            short_session: false,
            reference_id: None,
            observation: Observation::default(),
        }
    }

    fn violated_result() -> RuleResult {
        RuleResult {
            violated: true,
            severity: Severity::High,
            data: ViolationData::default(),
            rule_type: RuleType::ImpossibleTravel,
        }
    }

    #[tokio::test]
    async fn clean_result_records_nothing() {
        let store = InMemorySessionStore::new();
        let cache = InMemoryCache::new();
        let user = store.upsert_server_user(ServerId::new(), "ext-1", "alice").await.unwrap();
        let session = sample_session(user.id);
        let rule = Rule::new("r", RuleParams::ImpossibleTravel { max_speed_kmh: 900.0 });

        let clean = RuleResult {
            violated: false,
            severity: Severity::High,
            data: ViolationData::default(),
            rule_type: RuleType::ImpossibleTravel,
        };

        let outcome = record_violation(&store, &cache, &rule, &session, &clean).await.unwrap();
        assert!(outcome.is_none());
        assert!(cache.published_messages().is_empty());
    }

    #[tokio::test]
    async fn violated_result_persists_penalizes_and_broadcasts() {
        let store = InMemorySessionStore::new();
        let cache = InMemoryCache::new();
        let user = store.upsert_server_user(ServerId::new(), "ext-1", "alice").await.unwrap();
        let session = sample_session(user.id);
        let rule = Rule::new("r", RuleParams::ImpossibleTravel { max_speed_kmh: 900.0 });

        let outcome = record_violation(&store, &cache, &rule, &session, &violated_result())
            .await
            .unwrap();
        assert!(outcome.is_some());

        let reloaded = store.get_server_user(user.id).await.unwrap();
        assert_eq!(reloaded.trust_score, 80);
        assert_eq!(cache.published_messages().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_violation_for_same_session_and_rule_is_deduped() {
        let store = InMemorySessionStore::new();
        let cache = InMemoryCache::new();
        let user = store.upsert_server_user(ServerId::new(), "ext-1", "alice").await.unwrap();
        let session = sample_session(user.id);
        let rule = Rule::new("r", RuleParams::ImpossibleTravel { max_speed_kmh: 900.0 });

        record_violation(&store, &cache, &rule, &session, &violated_result()).await.unwrap();
        let second = record_violation(&store, &cache, &rule, &session, &violated_result())
            .await
            .unwrap();

        assert!(second.is_none());
        let reloaded = store.get_server_user(user.id).await.unwrap();
        // Only the first violation's penalty applied.
        assert_eq!(reloaded.trust_score, 80);
        assert_eq!(cache.published_messages().len(), 1);
    }

    #[test]
    fn is_untrusted_reflects_the_zero_floor() {
        assert!(is_untrusted(0));
        assert!(!is_untrusted(1));
    }
}
