//! Session Mapper (spec.md §4.C2): turns an adapter-reported
//! [`ObservedSession`] into the canonical fields a [`Session`] needs,
//! normalizing quality/device/platform strings the way different server
//! variants spell them differently.
//!
//! Grounded on the teacher's `yahoo_finance.rs`/`equity.rs` normalization
//! layer — same shape: one adapter-facing raw type in, one canonical
//! domain type's worth of fields out, with a handful of lookup tables for
//! vendor-specific spellings.

use chrono::{DateTime, Utc};

use crate::adapter::ObservedSession;
use crate::models::{
    Observation, ServerUserId, Session, SessionId, SessionKey, SessionKeyError, SessionState,
};

/// Canonicalizes a transcode/quality label reported by a server into one of
/// a small fixed vocabulary, so downstream rule evaluation and display never
/// have to special-case vendor spelling differences.
pub fn normalize_quality(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let lower = raw.to_ascii_lowercase();
    let canon = if lower.contains("4k") || lower.contains("2160") {
        "4k"
    } else if lower.contains("1080") {
        "1080p"
    } else if lower.contains("720") {
        "720p"
    } else if lower.contains("sd") || lower.contains("480") {
        "sd"
    } else {
        return Some(raw.to_string());
    };
    Some(canon.to_string())
}

/// Resolves the quality label to store, following spec.md §4.C2's fallback
/// chain: a normalized resolution string if the server reported one, else a
/// bitrate-derived label, else a bare transcode/direct marker.
pub fn resolve_quality(observation: &Observation) -> Option<String> {
    if let Some(resolution) = normalize_quality(observation.quality.as_deref()) {
        return Some(resolution);
    }
    if let Some(kbps) = observation.bitrate_kbps {
        let mbps = (f64::from(kbps) / 1000.0).round() as i64;
        return Some(format!("{mbps}Mbps"));
    }
    Some(if observation.is_transcode { "Transcoding" } else { "Direct" }.to_string())
}

/// Canonicalizes a player/device platform label (e.g. `"tvOS"`, `"Apple TV"`,
/// `"appletv"` all collapse to `"appletv"`).
pub fn normalize_platform(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let lower = raw.to_ascii_lowercase();
    let canon = if lower.contains("appletv") || lower.contains("apple tv") || lower.contains("tvos") {
        "appletv"
    } else if lower.contains("roku") {
        "roku"
    } else if lower.contains("android") {
        "android"
    } else if lower.contains("ios") || lower.contains("iphone") || lower.contains("ipad") {
        "ios"
    } else if lower.contains("web") || lower.contains("chrome") || lower.contains("firefox") || lower.contains("safari") {
        "web"
    } else {
        return Some(raw.to_string());
    };
    Some(canon.to_string())
}

/// Picks the artwork path to store: prefer a show-level image for episodes
/// (falls back to whatever the session-level path was, since not every
/// server variant reports both).
pub fn select_artwork_path(episode_art: Option<&str>, show_art: Option<&str>) -> Option<String> {
    show_art.or(episode_art).map(str::to_string)
}

/// Builds the initial live [`Session`] for a brand-new observation.
/// `server_user_id` is resolved beforehand (spec.md §4.C7 step 1: identity
/// resolution happens before mapping).
pub fn map_new_session(
    observed: &ObservedSession,
    server_user_id: ServerUserId,
    now: DateTime<Utc>,
) -> Result<Session, SessionKeyError> {
    let mut observation = normalize_observation(observed.observation.clone());
    observation.platform = normalize_platform(observation.platform.as_deref());
    observation.quality = resolve_quality(&observation);

    Ok(Session {
        id: SessionId::new(),
        server_id: observed.server_id,
        server_user_id,
        session_key: SessionKey::new(observed.session_key.clone())?,
        rating_key: observed.rating_key.clone(),
        state: if observed.is_paused {
            SessionState::Paused
        } else {
            SessionState::Playing
        },
        title: observed.title.clone(),
        media_type: observed.media_type,
        show_title: observed.show_title.clone(),
        season_number: observed.season_number,
        episode_number: observed.episode_number,
        year: observed.year,
        artwork_path: select_artwork_path(
            observed.episode_artwork.as_deref(),
            observed.show_artwork.as_deref(),
        ),
        started_at: now,
        last_seen_at: now,
        stopped_at: None,
        paused_duration_ms: 0,
        last_paused_at: if observed.is_paused { Some(now) } else { None },
        duration_ms: None,
        progress_ms: observed.progress_ms,
        total_duration_ms: observed.total_duration_ms,
        watched: false,
        short_session: false,
        reference_id: None,
        observation,
    })
}

/// Applies a fresh observation onto an already-live session's mutable
/// fields, leaving identity/state-machine transitions to [`crate::lifecycle`].
pub fn apply_observation(session: &mut Session, observed: &ObservedSession, now: DateTime<Utc>) {
    let mut observation = normalize_observation(observed.observation.clone());
    observation.platform = normalize_platform(observation.platform.as_deref());
    observation.quality = resolve_quality(&observation);

    session.progress_ms = observed.progress_ms;
    session.total_duration_ms = observed.total_duration_ms;
    session.last_seen_at = now;
    session.artwork_path = select_artwork_path(
        observed.episode_artwork.as_deref(),
        observed.show_artwork.as_deref(),
    );
    session.observation = observation;
}

fn normalize_observation(mut observation: Observation) -> Observation {
    observation.platform = observation.platform.map(|p| p.trim().to_string());
    observation.device = observation.device.map(|d| d.trim().to_string());
    observation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaType, ServerId};

    fn observed() -> ObservedSession {
        ObservedSession {
            server_id: ServerId::new(),
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
            event: crate::adapter::PushEvent::Sync,
        }
    }

    #[test]
    fn normalize_quality_collapses_vendor_spellings() {
        assert_eq!(normalize_quality(Some("2160p HDR")).as_deref(), Some("4k"));
        assert_eq!(normalize_quality(Some("4K")).as_deref(), Some("4k"));
        assert_eq!(normalize_quality(Some("1080p")).as_deref(), Some("1080p"));
        assert_eq!(normalize_quality(None), None);
    }

    #[test]
    fn resolve_quality_falls_back_to_bitrate_then_transcode_marker() {
        let mut obs = Observation::default();
        assert_eq!(resolve_quality(&obs).as_deref(), Some("Direct"));

        obs.is_transcode = true;
        assert_eq!(resolve_quality(&obs).as_deref(), Some("Transcoding"));

        obs.bitrate_kbps = Some(8_200);
        assert_eq!(resolve_quality(&obs).as_deref(), Some("8Mbps"));

        obs.quality = Some("1080p".into());
        assert_eq!(resolve_quality(&obs).as_deref(), Some("1080p"));
    }

    #[test]
    fn normalize_platform_collapses_appletv_spellings() {
        assert_eq!(normalize_platform(Some("tvOS")).as_deref(), Some("appletv"));
        assert_eq!(normalize_platform(Some("Apple TV")).as_deref(), Some("appletv"));
        assert_eq!(normalize_platform(Some("Chrome")).as_deref(), Some("web"));
        assert_eq!(normalize_platform(Some("Windows")).as_deref(), Some("Windows"));
    }

    #[test]
    fn select_artwork_path_prefers_show_level_art() {
        assert_eq!(
            select_artwork_path(Some("ep.jpg"), Some("show.jpg")),
            Some("show.jpg".to_string())
        );
        assert_eq!(select_artwork_path(Some("ep.jpg"), None), Some("ep.jpg".to_string()));
        assert_eq!(select_artwork_path(None, None), None);
    }

    #[test]
    fn map_new_session_starts_in_the_right_state() {
        let now = Utc::now();
        let mut obs = observed();
        let session = map_new_session(&obs, ServerUserId::new(), now).unwrap();
        assert_eq!(session.state, SessionState::Playing);
        assert!(session.last_paused_at.is_none());

        obs.is_paused = true;
        let paused = map_new_session(&obs, ServerUserId::new(), now).unwrap();
        assert_eq!(paused.state, SessionState::Paused);
        assert_eq!(paused.last_paused_at, Some(now));
    }

    #[test]
    fn map_new_session_prefers_show_level_artwork() {
        let mut obs = observed();
        obs.episode_artwork = Some("ep.jpg".into());
        obs.show_artwork = Some("show.jpg".into());
        let session = map_new_session(&obs, ServerUserId::new(), Utc::now()).unwrap();
        assert_eq!(session.artwork_path.as_deref(), Some("show.jpg"));
    }

    #[test]
    fn map_new_session_rejects_empty_session_key() {
        let mut obs = observed();
        obs.session_key = "  ".into();
        assert!(map_new_session(&obs, ServerUserId::new(), Utc::now()).is_err());
    }

    #[test]
    fn apply_observation_updates_progress_without_touching_state() {
        let now = Utc::now();
        let mut session = map_new_session(&observed(), ServerUserId::new(), now).unwrap();
        let state_before = session.state;

        let mut obs = observed();
        obs.progress_ms = 30_000;
        apply_observation(&mut session, &obs, now);

        assert_eq!(session.progress_ms, 30_000);
        assert_eq!(session.state, state_before);
    }
}
