//! Session Store (spec.md §4.C3): the durable home for sessions, server
//! users, and the serializable-transaction machinery the lifecycle engine
//! builds on. Grounded on the teacher's `SqliteDataProvider` — same shape
//! (a `new_in_memory`-style test double next to the real backend, schema
//! bootstrapped with `CREATE TABLE IF NOT EXISTS`, errors mapped into one
//! domain enum) — rebuilt against `sqlx`/Postgres because spec.md's
//! SERIALIZABLE-transaction and advisory-lock requirements have no SQLite
//! equivalent.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::StoreError;
use crate::models::{
    Observation, Rule, RuleType, ServerId, ServerUser, ServerUserId, Session, SessionId,
    SessionKey, Violation, ViolationId,
};
use crate::rule_engine::{self, EvalContext};

/// Durable session/server-user access, independent of whether the backend
/// is Postgres or an in-memory double (spec.md §4.C3).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    /// The live (unstopped) session for this key, if any — the lookup
    /// that gates "new session vs. update existing" in the lifecycle layer.
    async fn get_live_session(
        &self,
        server_id: ServerId,
        session_key: &SessionKey,
    ) -> Result<Option<Session>, StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError>;

    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Marks a live session stopped. Returns `false` without error if the
    /// session was already stopped — the `stoppedAt IS NULL` guard spec.md
    /// §4.C3 invariant 5 requires for idempotent stop handling under
    /// concurrent poll/push delivery.
    async fn stop_session(
        &self,
        id: SessionId,
        stopped_at: DateTime<Utc>,
        duration_ms: i64,
        paused_duration_ms: i64,
        watched: bool,
        short_session: bool,
    ) -> Result<bool, StoreError>;

    /// All sessions (live or finished) for this server user started at or
    /// after `since`, most recent first. Feeds the rule engine's history
    /// window (spec.md §4.C5).
    async fn recent_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    async fn live_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
    ) -> Result<Vec<Session>, StoreError>;

    async fn get_server_user(&self, id: ServerUserId) -> Result<ServerUser, StoreError>;

    /// Looks up a server user by `(server_id, external_id)`, creating one
    /// at the default trust score if this is the first time they're seen
    /// (spec.md §4.C7 step 1, identity resolution).
    async fn upsert_server_user(
        &self,
        server_id: ServerId,
        external_id: &str,
        username: &str,
    ) -> Result<ServerUser, StoreError>;

    async fn apply_trust_penalty(&self, id: ServerUserId, penalty: i32) -> Result<(), StoreError>;

    /// Inserts `violation` unless an unacknowledged violation of the same
    /// `rule_type` for the same `server_user_id` within the last 5 minutes
    /// already covers it (spec.md §4.C6 dedup): for single-session rule
    /// types, "covers" means the same `session_id`; for multi-session rule
    /// types, it means an overlapping `related_session_ids` set. Returns
    /// whether the insert actually happened — the guard
    /// [`crate::violation_recorder`] relies on to never double-penalize a
    /// trust score.
    async fn insert_violation_if_absent(&self, violation: &Violation) -> Result<bool, StoreError>;

    /// Inserts `session`, evaluates every rule in `rules` against history
    /// read inside the same atomic unit, and records whatever violations
    /// result — session insert, rule evaluation, violation insert, and
    /// trust-score decrement all happen as one indivisible write (spec.md
    /// §9: "three uncoordinated writes" is exactly what this method exists
    /// to avoid). Returns the violations actually recorded (post-dedup) so
    /// the caller can broadcast them once this call returns — broadcasting
    /// must never happen before that, or a retried/rolled-back attempt
    /// leaks a phantom event (spec.md §9).
    async fn create_session_with_rules(
        &self,
        session: &Session,
        rules: &[Rule],
        history_since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError>;
}

/// spec.md §4.C6 dedup window.
pub const VIOLATION_DEDUP_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// Whether `candidate` (an existing, unacknowledged violation within the
/// window) makes `new_violation` a duplicate (spec.md §4.C6).
fn is_duplicate_violation(candidate: &Violation, new_violation: &Violation) -> bool {
    if new_violation.rule_type.is_multi_session() {
        candidate.data.related_session_ids.contains(&new_violation.session_id)
            || new_violation
                .data
                .related_session_ids
                .contains(&candidate.session_id)
            || candidate
                .data
                .related_session_ids
                .iter()
                .any(|id| new_violation.data.related_session_ids.contains(id))
    } else {
        candidate.session_id == new_violation.session_id
    }
}

/// Hashes `(server_user_id, rule_type)` into the 64-bit key
/// `pg_advisory_xact_lock` takes, so concurrent evaluations of the same
/// rule for the same user serialize on one lock instead of the whole table
/// (spec.md §5).
pub fn advisory_lock_key(server_user_id: ServerUserId, rule_type: RuleType) -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    server_user_id.0.hash(&mut hasher);
    (rule_type as u8).hash(&mut hasher);
    hasher.finish() as i64
}

/// Backoff schedule for SERIALIZABLE conflict retries (spec.md §5):
/// 50ms, 100ms, 200ms, capped at 3 attempts.
pub const RETRY_BACKOFF_MS: [u64; 3] = [50, 100, 200];

/// Runs `op` inside a SERIALIZABLE transaction, retrying on SQLSTATE 40001
/// (serialization failure) with the exponential backoff above. Bails out
/// after `RETRY_BACKOFF_MS.len()` retries (spec.md §5, §7).
pub async fn with_serializable_retry<F, T>(
    pool: &PgPool,
    statement_timeout: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: for<'a> FnMut(
        &'a mut Transaction<'_, Postgres>,
    ) -> futures::future::BoxFuture<'a, Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        match op(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(StoreError::from)?;
                return Ok(value);
            }
            Err(StoreError::SerializationFailure) if attempt < RETRY_BACKOFF_MS.len() => {
                let _ = tx.rollback().await;
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                attempt += 1;
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
    }
}

/// Postgres-backed [`SessionStore`].
pub struct PgSessionStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgSessionStore {
    pub async fn connect(database_url: &str, statement_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = PgSessionStore { pool, statement_timeout };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_users (
                id UUID PRIMARY KEY,
                server_id UUID NOT NULL,
                user_id UUID NOT NULL,
                external_id TEXT NOT NULL,
                username TEXT NOT NULL,
                thumb TEXT,
                trust_score INTEGER NOT NULL DEFAULT 100,
                UNIQUE (server_id, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                server_id UUID NOT NULL,
                server_user_id UUID NOT NULL REFERENCES server_users(id),
                session_key TEXT NOT NULL,
                rating_key TEXT,
                state TEXT NOT NULL,
                title TEXT NOT NULL,
                media_type TEXT NOT NULL,
                show_title TEXT,
                season_number INTEGER,
                episode_number INTEGER,
                year INTEGER,
                artwork_path TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                last_seen_at TIMESTAMPTZ NOT NULL,
                stopped_at TIMESTAMPTZ,
                paused_duration_ms BIGINT NOT NULL DEFAULT 0,
                last_paused_at TIMESTAMPTZ,
                duration_ms BIGINT,
                progress_ms BIGINT NOT NULL DEFAULT 0,
                total_duration_ms BIGINT NOT NULL DEFAULT 0,
                watched BOOLEAN NOT NULL DEFAULT FALSE,
                short_session BOOLEAN NOT NULL DEFAULT FALSE,
                reference_id UUID,
                observation JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        // Partial unique index enforces "at most one live session per
        // (server, session_key)" (spec.md §3/§4.C3 invariant 4) at the
        // database layer, not just in application code.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_key
            ON sessions (server_id, session_key)
            WHERE stopped_at IS NULL
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_server_user_started ON sessions (server_user_id, started_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS violations (
                id UUID PRIMARY KEY,
                rule_id UUID NOT NULL,
                rule_type TEXT NOT NULL,
                server_user_id UUID NOT NULL,
                session_id UUID NOT NULL,
                severity TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                acknowledged_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        // Dedup (spec.md §4.C6) is a window + overlap check, not a single
        // unique constraint, but this index keeps that read cheap.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_violations_dedup ON violations (server_user_id, rule_type, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }
}

/// Column list shared by every `SELECT` against `sessions`, kept next to
/// [`SessionRow`] so the two can't drift apart.
const SESSION_COLUMNS: &str = "id, server_id, server_user_id, session_key, rating_key, state, \
    title, media_type, show_title, season_number, episode_number, year, artwork_path, \
    started_at, last_seen_at, stopped_at, paused_duration_ms, last_paused_at, duration_ms, \
    progress_ms, total_duration_ms, watched, short_session, reference_id, observation";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: uuid::Uuid,
    server_id: uuid::Uuid,
    server_user_id: uuid::Uuid,
    session_key: String,
    rating_key: Option<String>,
    state: String,
    title: String,
    media_type: String,
    show_title: Option<String>,
    season_number: Option<i32>,
    episode_number: Option<i32>,
    year: Option<i32>,
    artwork_path: Option<String>,
    started_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    paused_duration_ms: i64,
    last_paused_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    progress_ms: i64,
    total_duration_ms: i64,
    watched: bool,
    short_session: bool,
    reference_id: Option<uuid::Uuid>,
    observation: sqlx::types::Json<Observation>,
}

/// Enum columns are stored as their bare `serde`-serialized string (e.g.
/// `state = 'paused'`, not `'"paused"'`), so decoding goes back through
/// `Value::String` rather than `serde_json::from_str`.
fn decode_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Backend(e.to_string()))
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, StoreError> {
        Ok(Session {
            id: SessionId(row.id),
            server_id: ServerId(row.server_id),
            server_user_id: ServerUserId(row.server_user_id),
            session_key: SessionKey::new(row.session_key)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            rating_key: row.rating_key,
            state: decode_enum(&row.state)?,
            title: row.title,
            media_type: decode_enum(&row.media_type)?,
            show_title: row.show_title,
            season_number: row.season_number,
            episode_number: row.episode_number,
            year: row.year,
            artwork_path: row.artwork_path,
            started_at: row.started_at,
            last_seen_at: row.last_seen_at,
            stopped_at: row.stopped_at,
            paused_duration_ms: row.paused_duration_ms,
            last_paused_at: row.last_paused_at,
            duration_ms: row.duration_ms,
            progress_ms: row.progress_ms,
            total_duration_ms: row.total_duration_ms,
            watched: row.watched,
            short_session: row.short_session,
            reference_id: row.reference_id.map(SessionId),
            observation: row.observation.0,
        })
    }
}

fn session_insert_values(
    session: &Session,
) -> Result<(serde_json::Value, serde_json::Value, serde_json::Value), StoreError> {
    let observation =
        serde_json::to_value(&session.observation).map_err(|_| StoreError::SerializationFailure)?;
    let media_type =
        serde_json::to_value(session.media_type).map_err(|_| StoreError::SerializationFailure)?;
    let state = serde_json::to_value(session.state).map_err(|_| StoreError::SerializationFailure)?;
    Ok((observation, media_type, state))
}

/// Shared by [`PgSessionStore::insert_session`] and the transactional
/// `create_session_with_rules` path — same INSERT, different executor.
async fn insert_session_exec<'e, E>(exec: E, session: &Session) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let (observation, media_type, state) = session_insert_values(session)?;

    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, server_id, server_user_id, session_key, rating_key, state, title,
            media_type, show_title, season_number, episode_number, year, artwork_path,
            started_at, last_seen_at, stopped_at, paused_duration_ms, last_paused_at,
            duration_ms, progress_ms, total_duration_ms, watched, short_session,
            reference_id, observation
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(session.id.0)
    .bind(session.server_id.0)
    .bind(session.server_user_id.0)
    .bind(session.session_key.as_str())
    .bind(&session.rating_key)
    .bind(state.as_str())
    .bind(&session.title)
    .bind(media_type.as_str())
    .bind(&session.show_title)
    .bind(session.season_number)
    .bind(session.episode_number)
    .bind(session.year)
    .bind(&session.artwork_path)
    .bind(session.started_at)
    .bind(session.last_seen_at)
    .bind(session.stopped_at)
    .bind(session.paused_duration_ms)
    .bind(session.last_paused_at)
    .bind(session.duration_ms)
    .bind(session.progress_ms)
    .bind(session.total_duration_ms)
    .bind(session.watched)
    .bind(session.short_session)
    .bind(session.reference_id.map(|id| id.0))
    .bind(observation)
    .execute(exec)
    .await
    .map_err(StoreError::from)?;

    Ok(())
}

async fn recent_sessions_exec<'e, E>(
    exec: E,
    server_user_id: ServerUserId,
    since: DateTime<Utc>,
) -> Result<Vec<Session>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<SessionRow> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE server_user_id = $1 AND started_at >= $2 \
         ORDER BY started_at DESC"
    ))
    .bind(server_user_id.0)
    .bind(since)
    .fetch_all(exec)
    .await
    .map_err(StoreError::from)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

async fn live_sessions_exec<'e, E>(
    exec: E,
    server_user_id: ServerUserId,
) -> Result<Vec<Session>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<SessionRow> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE server_user_id = $1 AND stopped_at IS NULL"
    ))
    .bind(server_user_id.0)
    .fetch_all(exec)
    .await
    .map_err(StoreError::from)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

/// Shared by [`insert_violation_if_absent`](PgSessionStore::insert_violation_if_absent)
/// (its own short-lived transaction) and the combined `create_session_with_rules`
/// transaction — the dedup read + conditional insert, against whatever
/// transaction the caller already has open (spec.md §4.C6).
async fn insert_violation_tx(
    tx: &mut Transaction<'_, Postgres>,
    violation: &Violation,
) -> Result<bool, StoreError> {
    // Multi-session rules need the advisory lock before the window read
    // (spec.md §4.C6): SERIALIZABLE alone lets two transactions both see
    // an empty window and both insert, since they touch different
    // session_ids and so never conflict on a row.
    if violation.rule_type.is_multi_session() {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(violation.server_user_id, violation.rule_type))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
    }

    let rule_type =
        serde_json::to_value(violation.rule_type).map_err(|_| StoreError::SerializationFailure)?;
    let window_start = violation.created_at - VIOLATION_DEDUP_WINDOW;

    let candidates: Vec<ViolationDedupRow> = sqlx::query_as(
        r#"
        SELECT session_id, data FROM violations
        WHERE server_user_id = $1 AND rule_type = $2
          AND acknowledged_at IS NULL AND created_at >= $3
        "#,
    )
    .bind(violation.server_user_id.0)
    .bind(rule_type.as_str())
    .bind(window_start)
    .fetch_all(&mut *tx)
    .await
    .map_err(StoreError::from)?;

    for candidate in &candidates {
        let candidate = Violation {
            id: violation.id,
            rule_id: violation.rule_id,
            rule_type: violation.rule_type,
            server_user_id: violation.server_user_id,
            session_id: SessionId(candidate.session_id),
            severity: violation.severity,
            data: serde_json::from_value(candidate.data.clone()).unwrap_or_default(),
            created_at: violation.created_at,
            acknowledged_at: None,
        };
        if is_duplicate_violation(&candidate, violation) {
            return Ok(false);
        }
    }

    let severity =
        serde_json::to_value(violation.severity).map_err(|_| StoreError::SerializationFailure)?;
    let data = serde_json::to_value(&violation.data).map_err(|_| StoreError::SerializationFailure)?;

    sqlx::query(
        r#"
        INSERT INTO violations (
            id, rule_id, rule_type, server_user_id, session_id, severity, data,
            created_at, acknowledged_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(violation.id.0)
    .bind(violation.rule_id.0)
    .bind(rule_type.as_str())
    .bind(violation.server_user_id.0)
    .bind(violation.session_id.0)
    .bind(severity.as_str())
    .bind(data)
    .bind(violation.created_at)
    .bind(violation.acknowledged_at)
    .execute(&mut *tx)
    .await
    .map_err(StoreError::from)?;

    Ok(true)
}

async fn apply_trust_penalty_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: ServerUserId,
    penalty: i32,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE server_users SET trust_score = GREATEST(0, trust_score - $2) WHERE id = $1")
        .bind(id.0)
        .bind(penalty)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
    Ok(())
}

/// Builds the `Violation` a violated `RuleResult` implies, same shape
/// [`crate::violation_recorder::record_violation`] constructs.
fn violation_from_result(rule: &Rule, session: &Session, result: &rule_engine::RuleResult) -> Violation {
    Violation {
        id: ViolationId::new(),
        rule_id: rule.id,
        rule_type: result.rule_type,
        server_user_id: session.server_user_id,
        session_id: session.id,
        severity: result.severity,
        data: result.data.clone(),
        created_at: session.last_seen_at,
        acknowledged_at: None,
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        insert_session_exec(&self.pool, session).await
    }

    async fn get_live_session(
        &self,
        server_id: ServerId,
        session_key: &SessionKey,
    ) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE server_id = $1 AND session_key = $2 AND stopped_at IS NULL"
        ))
        .bind(server_id.0)
        .bind(session_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?;

        row.ok_or(StoreError::SessionNotFound(id.0))?.try_into()
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let (observation, _media_type, state) = session_insert_values(session)?;

        sqlx::query(
            r#"
            UPDATE sessions SET
                state = $2, title = $3, show_title = $4, season_number = $5,
                episode_number = $6, year = $7, artwork_path = $8, last_seen_at = $9,
                paused_duration_ms = $10, last_paused_at = $11, progress_ms = $12,
                total_duration_ms = $13, watched = $14, observation = $15
            WHERE id = $1 AND stopped_at IS NULL
            "#,
        )
        .bind(session.id.0)
        .bind(state.as_str())
        .bind(&session.title)
        .bind(&session.show_title)
        .bind(session.season_number)
        .bind(session.episode_number)
        .bind(session.year)
        .bind(&session.artwork_path)
        .bind(session.last_seen_at)
        .bind(session.paused_duration_ms)
        .bind(session.last_paused_at)
        .bind(session.progress_ms)
        .bind(session.total_duration_ms)
        .bind(session.watched)
        .bind(observation)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn stop_session(
        &self,
        id: SessionId,
        stopped_at: DateTime<Utc>,
        duration_ms: i64,
        paused_duration_ms: i64,
        watched: bool,
        short_session: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET state = 'stopped', stopped_at = $2, duration_ms = $3,
                paused_duration_ms = $4, watched = $5, short_session = $6,
                last_paused_at = NULL
            WHERE id = $1 AND stopped_at IS NULL
            "#,
        )
        .bind(id.0)
        .bind(stopped_at)
        .bind(duration_ms)
        .bind(paused_duration_ms)
        .bind(watched)
        .bind(short_session)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        recent_sessions_exec(&self.pool, server_user_id, since).await
    }

    async fn live_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
    ) -> Result<Vec<Session>, StoreError> {
        live_sessions_exec(&self.pool, server_user_id).await
    }

    async fn get_server_user(&self, id: ServerUserId) -> Result<ServerUser, StoreError> {
        let row = sqlx::query_as::<_, ServerUserRow>(
            "SELECT id, server_id, user_id, external_id, username, thumb, trust_score FROM server_users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        row.map(Into::into)
            .ok_or(StoreError::ServerUserNotFound(id.0))
    }

    async fn upsert_server_user(
        &self,
        server_id: ServerId,
        external_id: &str,
        username: &str,
    ) -> Result<ServerUser, StoreError> {
        let row = sqlx::query_as::<_, ServerUserRow>(
            r#"
            INSERT INTO server_users (id, server_id, user_id, external_id, username, trust_score)
            VALUES ($1, $2, $1, $3, $4, 100)
            ON CONFLICT (server_id, external_id)
            DO UPDATE SET username = EXCLUDED.username
            RETURNING id, server_id, user_id, external_id, username, thumb, trust_score
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(server_id.0)
        .bind(external_id)
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(row.into())
    }

    async fn apply_trust_penalty(&self, id: ServerUserId, penalty: i32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE server_users SET trust_score = GREATEST(0, trust_score - $2) WHERE id = $1",
        )
        .bind(id.0)
        .bind(penalty)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_violation_if_absent(&self, violation: &Violation) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let inserted = insert_violation_tx(&mut tx, violation).await?;
        if inserted {
            tx.commit().await.map_err(StoreError::from)?;
        } else {
            tx.rollback().await.map_err(StoreError::from)?;
        }
        Ok(inserted)
    }

    async fn create_session_with_rules(
        &self,
        session: &Session,
        rules: &[Rule],
        history_since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError> {
        with_serializable_retry(&self.pool, self.statement_timeout, move |tx| {
            Box::pin(async move {
                insert_session_exec(&mut *tx, session).await?;

                let history = recent_sessions_exec(&mut *tx, session.server_user_id, history_since).await?;
                let live = live_sessions_exec(&mut *tx, session.server_user_id).await?;
                let recent_history: Vec<Session> =
                    history.into_iter().filter(|s| s.id != session.id).collect();
                let concurrent_live: Vec<Session> =
                    live.into_iter().filter(|s| s.id != session.id).collect();

                let ctx = EvalContext {
                    session,
                    recent_history: &recent_history,
                    concurrent_live: &concurrent_live,
                };

                let mut recorded = Vec::new();
                for rule in rules.iter().filter(|r| r.is_active && r.applies_to(session.server_user_id)) {
                    let result = rule_engine::evaluate(rule, &ctx);
                    if !result.violated {
                        continue;
                    }
                    let violation = violation_from_result(rule, session, &result);
                    if insert_violation_tx(tx, &violation).await? {
                        apply_trust_penalty_tx(tx, violation.server_user_id, result.severity.penalty()).await?;
                        recorded.push(violation);
                    }
                }

                Ok(recorded)
            })
        })
        .await
    }
}

#[derive(sqlx::FromRow)]
struct ViolationDedupRow {
    session_id: uuid::Uuid,
    data: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct ServerUserRow {
    id: uuid::Uuid,
    server_id: uuid::Uuid,
    user_id: uuid::Uuid,
    external_id: String,
    username: String,
    thumb: Option<String>,
    trust_score: i32,
}

impl From<ServerUserRow> for ServerUser {
    fn from(row: ServerUserRow) -> Self {
        ServerUser {
            id: ServerUserId(row.id),
            server_id: ServerId(row.server_id),
            user_id: crate::models::UserId(row.user_id),
            external_id: row.external_id,
            username: row.username,
            thumb: row.thumb,
            trust_score: row.trust_score,
        }
    }
}

/// In-memory test double. Grounded on `SqliteDataProvider::new_in_memory`:
/// same role (fast, no external dependency, exercised by every unit test),
/// but backed by plain `HashMap`s guarded by a `Mutex` since there is no
/// embedded-database equivalent of SQLite in this stack.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    server_users: Mutex<HashMap<ServerUserId, ServerUser>>,
    violations: Mutex<Vec<Violation>>,
    /// Serializes `create_session_with_rules` end to end, standing in for
    /// the SERIALIZABLE transaction the Postgres backend uses — two
    /// concurrent creators on the same key must see each other's writes
    /// before either evaluates rules (spec.md §9). An async mutex, since
    /// the guard has to live across the `.await` points in between.
    write_lock: tokio::sync::Mutex<()>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_server_user(&self, user: ServerUser) {
        self.server_users.lock().unwrap().insert(user.id, user);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        let clashes = sessions.values().any(|s| {
            s.server_id == session.server_id
                && s.session_key == session.session_key
                && s.is_live()
                && s.id != session.id
        });
        if clashes {
            return Err(StoreError::Backend(
                "a live session already exists for this session_key".into(),
            ));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_live_session(
        &self,
        server_id: ServerId,
        session_key: &SessionKey,
    ) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .values()
            .find(|s| s.server_id == server_id && &s.session_key == session_key && s.is_live())
            .cloned())
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id.0))
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(&session.id) {
            return Err(StoreError::SessionNotFound(session.id.0));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn stop_session(
        &self,
        id: SessionId,
        stopped_at: DateTime<Utc>,
        duration_ms: i64,
        paused_duration_ms: i64,
        watched: bool,
        short_session: bool,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id.0))?;
        if !session.is_live() {
            return Ok(false);
        }
        session.state = crate::models::SessionState::Stopped;
        session.stopped_at = Some(stopped_at);
        session.duration_ms = Some(duration_ms);
        session.paused_duration_ms = paused_duration_ms;
        session.last_paused_at = None;
        session.watched = watched;
        session.short_session = short_session;
        Ok(true)
    }

    async fn recent_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut out: Vec<Session> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.server_user_id == server_user_id && s.started_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }

    async fn live_sessions_for_server_user(
        &self,
        server_user_id: ServerUserId,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.server_user_id == server_user_id && s.is_live())
            .cloned()
            .collect())
    }

    async fn get_server_user(&self, id: ServerUserId) -> Result<ServerUser, StoreError> {
        self.server_users
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ServerUserNotFound(id.0))
    }

    async fn upsert_server_user(
        &self,
        server_id: ServerId,
        external_id: &str,
        username: &str,
    ) -> Result<ServerUser, StoreError> {
        let mut users = self.server_users.lock().unwrap();
        if let Some(existing) = users
            .values_mut()
            .find(|u| u.server_id == server_id && u.external_id == external_id)
        {
            existing.username = username.to_string();
            return Ok(existing.clone());
        }
        let user = ServerUser::new(server_id, external_id, username);
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn apply_trust_penalty(&self, id: ServerUserId, penalty: i32) -> Result<(), StoreError> {
        let mut users = self.server_users.lock().unwrap();
        let user = users
            .get_mut(&id)
            .ok_or(StoreError::ServerUserNotFound(id.0))?;
        user.apply_penalty(penalty);
        Ok(())
    }

    async fn insert_violation_if_absent(&self, violation: &Violation) -> Result<bool, StoreError> {
        let mut violations = self.violations.lock().unwrap();
        let window_start = violation.created_at - VIOLATION_DEDUP_WINDOW;

        let is_dup = violations.iter().any(|candidate| {
            candidate.server_user_id == violation.server_user_id
                && candidate.rule_type == violation.rule_type
                && !candidate.is_acknowledged()
                && candidate.created_at >= window_start
                && is_duplicate_violation(candidate, violation)
        });
        if is_dup {
            return Ok(false);
        }

        violations.push(violation.clone());
        Ok(true)
    }

    async fn create_session_with_rules(
        &self,
        session: &Session,
        rules: &[Rule],
        history_since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError> {
        let _guard = self.write_lock.lock().await;

        self.insert_session(session).await?;

        let history = self
            .recent_sessions_for_server_user(session.server_user_id, history_since)
            .await?;
        let live = self.live_sessions_for_server_user(session.server_user_id).await?;
        let recent_history: Vec<Session> = history.into_iter().filter(|s| s.id != session.id).collect();
        let concurrent_live: Vec<Session> = live.into_iter().filter(|s| s.id != session.id).collect();

        let ctx = EvalContext {
            session,
            recent_history: &recent_history,
            concurrent_live: &concurrent_live,
        };

        let mut recorded = Vec::new();
        for rule in rules.iter().filter(|r| r.is_active && r.applies_to(session.server_user_id)) {
            let result = rule_engine::evaluate(rule, &ctx);
            if !result.violated {
                continue;
            }
            let violation = violation_from_result(rule, session, &result);
            if self.insert_violation_if_absent(&violation).await? {
                self.apply_trust_penalty(violation.server_user_id, result.severity.penalty())
                    .await?;
                recorded.push(violation);
            }
        }

        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaType, Observation, SessionState};

    fn sample_session(server_id: ServerId, server_user_id: ServerUserId) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(),
            server_id,
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

    #[tokio::test]
    async fn insert_then_get_live_session_round_trips() {
        let store = InMemorySessionStore::new();
        let server_id = ServerId::new();
        let server_user_id = ServerUserId::new();
        let session = sample_session(server_id, server_user_id);
        store.insert_session(&session).await.unwrap();

        let found = store
            .get_live_session(server_id, &session.session_key)
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, session.id);
    }

    #[tokio::test]
    async fn inserting_a_second_live_session_with_the_same_key_fails() {
        let store = InMemorySessionStore::new();
        let server_id = ServerId::new();
        let a = sample_session(server_id, ServerUserId::new());
        let mut b = sample_session(server_id, ServerUserId::new());
        b.session_key = a.session_key.clone();

        store.insert_session(&a).await.unwrap();
        assert!(store.insert_session(&b).await.is_err());
    }

    #[tokio::test]
    async fn stop_session_is_idempotent() {
        let store = InMemorySessionStore::new();
        let session = sample_session(ServerId::new(), ServerUserId::new());
        store.insert_session(&session).await.unwrap();

        let now = Utc::now();
        let first = store
            .stop_session(session.id, now, 1000, 0, false, false)
            .await
            .unwrap();
        assert!(first);

        let second = store
            .stop_session(session.id, now, 1000, 0, false, false)
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn upsert_server_user_creates_then_reuses() {
        let store = InMemorySessionStore::new();
        let server_id = ServerId::new();
        let first = store
            .upsert_server_user(server_id, "ext-1", "alice")
            .await
            .unwrap();
        let second = store
            .upsert_server_user(server_id, "ext-1", "alice-renamed")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username, "alice-renamed");
    }

    #[tokio::test]
    async fn apply_trust_penalty_floors_at_zero() {
        let store = InMemorySessionStore::new();
        let user = store
            .upsert_server_user(ServerId::new(), "ext-1", "alice")
            .await
            .unwrap();
        store.apply_trust_penalty(user.id, 1000).await.unwrap();
        let reloaded = store.get_server_user(user.id).await.unwrap();
        assert_eq!(reloaded.trust_score, 0);
    }

    #[test]
    fn advisory_lock_key_is_stable_for_same_inputs() {
        let user = ServerUserId::new();
        let a = advisory_lock_key(user, RuleType::ImpossibleTravel);
        let b = advisory_lock_key(user, RuleType::ImpossibleTravel);
        assert_eq!(a, b);
    }

    #[test]
    fn advisory_lock_key_differs_across_rule_types() {
        let user = ServerUserId::new();
        let a = advisory_lock_key(user, RuleType::ImpossibleTravel);
        let b = advisory_lock_key(user, RuleType::DeviceVelocity);
        assert_ne!(a, b);
    }

    fn sample_violation(
        server_user_id: ServerUserId,
        session_id: SessionId,
        rule_type: RuleType,
        created_at: DateTime<Utc>,
    ) -> Violation {
        Violation {
            id: crate::models::ViolationId::new(),
            rule_id: crate::models::RuleId::new(),
            rule_type,
            server_user_id,
            session_id,
            severity: crate::models::Severity::Warning,
            data: crate::models::ViolationData::default(),
            created_at,
            acknowledged_at: None,
        }
    }

    #[tokio::test]
    async fn single_session_violation_outside_the_window_is_not_deduped() {
        let store = InMemorySessionStore::new();
        let user = ServerUserId::new();
        let session = SessionId::new();
        let t0 = Utc::now();

        let first = sample_violation(user, session, RuleType::ImpossibleTravel, t0);
        assert!(store.insert_violation_if_absent(&first).await.unwrap());

        let stale = sample_violation(
            user,
            session,
            RuleType::ImpossibleTravel,
            t0 + chrono::Duration::minutes(10),
        );
        assert!(store.insert_violation_if_absent(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn multi_session_violations_with_overlapping_related_sessions_are_deduped() {
        let store = InMemorySessionStore::new();
        let user = ServerUserId::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();
        let t0 = Utc::now();

        let mut first = sample_violation(user, a, RuleType::ConcurrentStreams, t0);
        first.data.related_session_ids = vec![a, b];
        assert!(store.insert_violation_if_absent(&first).await.unwrap());

        // Different triggering session, but shares `b` in its related set.
        let mut second = sample_violation(
            user,
            c,
            RuleType::ConcurrentStreams,
            t0 + chrono::Duration::minutes(1),
        );
        second.data.related_session_ids = vec![b, c];
        assert!(!store.insert_violation_if_absent(&second).await.unwrap());
    }

    #[tokio::test]
    async fn create_session_with_rules_records_a_violation_and_penalizes_trust() {
        let store = InMemorySessionStore::new();
        let server_id = ServerId::new();
        let user = store.upsert_server_user(server_id, "ext-1", "alice").await.unwrap();

        let rule = crate::models::Rule::new(
            "concurrent streams",
            crate::models::RuleParams::ConcurrentStreams { max_streams: 1 },
        );

        let mut first = sample_session(server_id, user.id);
        first.session_key = SessionKey::new("sk-1").unwrap();
        let since = first.started_at - chrono::Duration::days(7);
        let violations = store
            .create_session_with_rules(&first, &[rule.clone()], since)
            .await
            .unwrap();
        assert!(violations.is_empty());

        let mut second = sample_session(server_id, user.id);
        second.session_key = SessionKey::new("sk-2").unwrap();
        let violations = store
            .create_session_with_rules(&second, &[rule], since)
            .await
            .unwrap();

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_type, RuleType::ConcurrentStreams);

        let reloaded = store.get_server_user(user.id).await.unwrap();
        assert_eq!(reloaded.trust_score, 90);
    }

    #[tokio::test]
    async fn concurrent_create_session_with_rules_sees_exactly_one_violation() {
        use std::sync::Arc;

        let store = Arc::new(InMemorySessionStore::new());
        let server_id = ServerId::new();
        let user = store.upsert_server_user(server_id, "ext-1", "alice").await.unwrap();

        let rule = crate::models::Rule::new(
            "concurrent streams",
            crate::models::RuleParams::ConcurrentStreams { max_streams: 1 },
        );

        let mut a = sample_session(server_id, user.id);
        a.session_key = SessionKey::new("sk-a").unwrap();
        let mut b = sample_session(server_id, user.id);
        b.session_key = SessionKey::new("sk-b").unwrap();
        let since = a.started_at - chrono::Duration::days(7);

        let store_a = store.clone();
        let rule_a = rule.clone();
        let store_b = store.clone();
        let rule_b = rule.clone();

        let (result_a, result_b) = tokio::join!(
            tokio::spawn(async move { store_a.create_session_with_rules(&a, &[rule_a], since).await }),
            tokio::spawn(async move { store_b.create_session_with_rules(&b, &[rule_b], since).await }),
        );

        let violations_a = result_a.unwrap().unwrap();
        let violations_b = result_b.unwrap().unwrap();

        // Whichever session lands second sees the other as concurrent and
        // trips the rule; the write lock stops both from landing "first".
        assert_eq!(violations_a.len() + violations_b.len(), 1);

        let reloaded = store.get_server_user(user.id).await.unwrap();
        assert_eq!(reloaded.trust_score, 90);
    }
}
