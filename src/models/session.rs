use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

use super::{ServerId, ServerUserId};

/// Identity of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when a raw adapter string can't be a [`SessionKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionKeyError {
    #[error("session key must not be empty")]
    Empty,
}

/// The adapter-supplied opaque per-server key, unique among *live* sessions
/// on that server (spec.md §3, §4.C3 invariant 4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, SessionKeyError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(SessionKeyError::Empty);
        }
        Ok(SessionKey(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playback state machine. `Stopped` is terminal — spec.md §4.C7.e.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Playing,
    Paused,
    Stopped,
}

/// Media kind, normalized by the adapter (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
    Track,
    Live,
    Photo,
    Unknown,
}

/// Geo/device/network fingerprint captured at observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Observation {
    pub ip_address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub player_name: Option<String>,
    pub device: Option<String>,
    pub product: Option<String>,
    pub platform: Option<String>,
    pub quality: Option<String>,
    pub is_transcode: bool,
    pub video_decision: Option<String>,
    pub audio_decision: Option<String>,
    pub bitrate_kbps: Option<u32>,
}

impl Observation {
    /// `None` unless both coordinates are present — a session with partial
    /// geo data never participates in distance-based rules.
    pub fn geo_point(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }

    pub fn country_code(&self) -> Option<&str> {
        self.country.as_deref()
    }
}

/// A single observed playback. See spec.md §3 for the full invariant list;
/// enforcement lives in [`crate::state_tracker`] and [`crate::lifecycle`] —
/// this struct is intentionally a plain value type so the store can
/// round-trip it without encoding business rules twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub server_id: ServerId,
    pub server_user_id: ServerUserId,
    pub session_key: SessionKey,
    pub rating_key: Option<String>,
    pub state: SessionState,

    pub title: String,
    pub media_type: MediaType,
    pub show_title: Option<String>,
    pub season_number: Option<i32>,
    pub episode_number: Option<i32>,
    pub year: Option<i32>,
    pub artwork_path: Option<String>,

    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub paused_duration_ms: i64,
    pub last_paused_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub progress_ms: i64,
    pub total_duration_ms: i64,
    pub watched: bool,
    pub short_session: bool,

    pub reference_id: Option<SessionId>,

    pub observation: Observation,
}

impl Session {
    pub fn is_live(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// Checks the invariants of spec.md §3 hold for this value. Used in
    /// tests and debug assertions at the lifecycle/store boundary, never on
    /// the hot path in release builds.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        match self.state {
            SessionState::Stopped => {
                if self.stopped_at.is_none() || self.duration_ms.is_none() {
                    return Err("stopped session must have stoppedAt and durationMs set");
                }
            }
            SessionState::Playing | SessionState::Paused => {
                if self.stopped_at.is_some() || self.duration_ms.is_some() {
                    return Err("live session must not have stoppedAt/durationMs set");
                }
            }
        }
        match self.state {
            SessionState::Paused if self.last_paused_at.is_none() => {
                return Err("paused session must have lastPausedAt set")
            }
            SessionState::Playing if self.last_paused_at.is_some() => {
                return Err("playing session must not have lastPausedAt set")
            }
            _ => {}
        }
        if self.paused_duration_ms < 0 {
            return Err("pausedDurationMs must never be negative");
        }
        Ok(())
    }
}
