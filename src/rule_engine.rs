//! Rule Engine (spec.md §4.C5): one pure function per rule family, plus a
//! dispatcher. Every function here is deterministic given its inputs — no
//! I/O, no clock reads beyond the timestamps already on the sessions it's
//! handed. [`crate::violation_recorder`] is the only caller that turns a
//! [`RuleResult`] into something persisted.
//!
//! Grounded on the teacher's `analytics/registry.rs` `AnalyticExecutor`
//! dispatch table: one enum key, one function per variant, a single
//! `evaluate` entry point that looks up and calls the right one.

use crate::geo::{distance_km, required_speed_kmh};
use crate::models::{Rule, RuleParams, RuleType, Session, Severity, ViolationData};

/// Everything [`evaluate`] needs besides the rule itself and the session
/// under evaluation (spec.md §4.C5: rules see "the session plus recent
/// history").
pub struct EvalContext<'a> {
    pub session: &'a Session,
    /// Other sessions (live or finished) for the same server user, most
    /// recent first, excluding `session` itself.
    pub recent_history: &'a [Session],
    /// Other *currently live* sessions for the same server user, excluding
    /// `session` itself — the input multi-session rules evaluate against.
    pub concurrent_live: &'a [Session],
}

/// The outcome of evaluating one rule against one session (spec.md §4.C5).
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub violated: bool,
    pub severity: Severity,
    pub data: ViolationData,
    pub rule_type: RuleType,
}

impl RuleResult {
    fn clean(rule_type: RuleType) -> Self {
        RuleResult {
            violated: false,
            severity: rule_type.default_severity(),
            data: ViolationData::default(),
            rule_type,
        }
    }
}

/// Dispatches to the rule-specific evaluator for `rule.params` (spec.md §4.C5).
pub fn evaluate(rule: &Rule, ctx: &EvalContext<'_>) -> RuleResult {
    match &rule.params {
        RuleParams::ImpossibleTravel { max_speed_kmh } => {
            evaluate_impossible_travel(ctx, *max_speed_kmh)
        }
        RuleParams::SimultaneousLocations { min_distance_km } => {
            evaluate_simultaneous_locations(ctx, *min_distance_km)
        }
        RuleParams::DeviceVelocity {
            window_hours,
            max_ips,
        } => evaluate_device_velocity(ctx, *window_hours, *max_ips),
        RuleParams::ConcurrentStreams { max_streams } => {
            evaluate_concurrent_streams(ctx, *max_streams)
        }
        RuleParams::GeoRestriction { blocked_countries } => {
            evaluate_geo_restriction(ctx, blocked_countries)
        }
    }
}

/// Flags playback that implies travel faster than `max_speed_kmh` between
/// the current session's location and the most recent prior observation
/// with a different one (spec.md §4.C5, §8 scenario 6).
pub fn evaluate_impossible_travel(ctx: &EvalContext<'_>, max_speed_kmh: f64) -> RuleResult {
    let rule_type = RuleType::ImpossibleTravel;
    let Some(current_point) = ctx.session.observation.geo_point() else {
        return RuleResult::clean(rule_type);
    };

    let prior = ctx
        .recent_history
        .iter()
        .filter(|s| s.started_at < ctx.session.started_at)
        .find_map(|s| s.observation.geo_point().map(|p| (s, p)));

    let Some((prior_session, prior_point)) = prior else {
        return RuleResult::clean(rule_type);
    };

    let distance = distance_km(prior_point, current_point);
    if distance == 0.0 {
        return RuleResult::clean(rule_type);
    }

    let elapsed_hours =
        (ctx.session.started_at - prior_session.last_seen_at).num_milliseconds() as f64
            / 3_600_000.0;
    let required_speed = required_speed_kmh(distance, elapsed_hours);

    if required_speed > max_speed_kmh {
        let mut result = RuleResult::clean(rule_type);
        result.violated = true;
        result.data.related_session_ids = vec![prior_session.id];
        result.data.extra.insert("distance_km".into(), serde_json::json!(distance));
        result.data.extra.insert("required_speed_kmh".into(), serde_json::json!(required_speed));
        result
    } else {
        RuleResult::clean(rule_type)
    }
}

/// Flags concurrently-live sessions whose locations are farther apart than
/// `min_distance_km` — a strong signal of credential sharing, since one
/// account can't physically be streaming from two distant places at once
/// (spec.md §4.C5).
pub fn evaluate_simultaneous_locations(ctx: &EvalContext<'_>, min_distance_km: f64) -> RuleResult {
    let rule_type = RuleType::SimultaneousLocations;
    let Some(current_point) = ctx.session.observation.geo_point() else {
        return RuleResult::clean(rule_type);
    };

    let offenders: Vec<_> = ctx
        .concurrent_live
        .iter()
        .filter_map(|s| s.observation.geo_point().map(|p| (s, p)))
        .filter(|(_, p)| distance_km(current_point, *p) >= min_distance_km)
        .collect();

    if offenders.is_empty() {
        return RuleResult::clean(rule_type);
    }

    let mut result = RuleResult::clean(rule_type);
    result.violated = true;
    result.data.related_session_ids = offenders.iter().map(|(s, _)| s.id).collect();
    result
}

/// Flags a server user observed from more than `max_ips` distinct IP
/// addresses within the trailing `window_hours` (spec.md §4.C5).
pub fn evaluate_device_velocity(ctx: &EvalContext<'_>, window_hours: i64, max_ips: u32) -> RuleResult {
    let rule_type = RuleType::DeviceVelocity;
    let cutoff = ctx.session.started_at - chrono::Duration::hours(window_hours);

    let mut ips: std::collections::HashSet<&str> = ctx
        .recent_history
        .iter()
        .filter(|s| s.started_at >= cutoff)
        .filter_map(|s| s.observation.ip_address.as_deref())
        .collect();
    if let Some(ip) = ctx.session.observation.ip_address.as_deref() {
        ips.insert(ip);
    }

    if ips.len() as u32 > max_ips {
        let mut result = RuleResult::clean(rule_type);
        result.violated = true;
        result.data.extra.insert("distinct_ip_count".into(), serde_json::json!(ips.len()));
        result
    } else {
        RuleResult::clean(rule_type)
    }
}

/// Flags a server user with more than `max_streams` sessions live at once
/// (spec.md §4.C5).
pub fn evaluate_concurrent_streams(ctx: &EvalContext<'_>, max_streams: u32) -> RuleResult {
    let rule_type = RuleType::ConcurrentStreams;
    let total_live = ctx.concurrent_live.len() as u32 + 1; // + the session under evaluation

    if total_live > max_streams {
        let mut result = RuleResult::clean(rule_type);
        result.violated = true;
        result.data.related_session_ids = ctx.concurrent_live.iter().map(|s| s.id).collect();
        result.data.extra.insert("concurrent_stream_count".into(), serde_json::json!(total_live));
        result
    } else {
        RuleResult::clean(rule_type)
    }
}

/// Flags playback observed from a blocked country (spec.md §4.C5).
pub fn evaluate_geo_restriction(ctx: &EvalContext<'_>, blocked_countries: &[String]) -> RuleResult {
    let rule_type = RuleType::GeoRestriction;
    let Some(country) = ctx.session.observation.country_code() else {
        return RuleResult::clean(rule_type);
    };

    let blocked = blocked_countries.iter().any(|c| c.eq_ignore_ascii_case(country));
    if blocked {
        let mut result = RuleResult::clean(rule_type);
        result.violated = true;
        result.data.extra.insert("country".into(), serde_json::json!(country));
        result
    } else {
        RuleResult::clean(rule_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaType, Observation, ServerId, ServerUserId, SessionId, SessionKey, SessionState};
    use chrono::{TimeZone, Utc};

    fn session_at(
        server_user_id: crate::models::ServerUserId,
        started_at: chrono::DateTime<Utc>,
        lat: f64,
        lon: f64,
        ip: &str,
    ) -> Session {
        let mut observation = Observation::default();
        observation.lat = Some(lat);
        observation.lon = Some(lon);
        observation.ip_address = Some(ip.to_string());
        Session {
            id: SessionId::new(),
            server_id: ServerId::new(),
            server_user_id,
            session_key: SessionKey::new(format!("sk-{}", started_at.timestamp())).unwrap(),
            rating_key: None,
            state: SessionState::Playing,
            title: "Some Movie".into(),
            media_type: MediaType::Movie,
            show_title: None,
            season_number: None,
            episode_number: None,
            year: None,
            artwork_path: None,
            started_at,
            last_seen_at: started_at,
            stopped_at: None,
            paused_duration_ms: 0,
            last_paused_at: None,
            duration_ms: None,
            progress_ms: 0,
            total_duration_ms: 6_000_000,
            watched: false,
            short_session: false,
            reference_id: None,
            observation,
        }
    }

    #[test]
    fn scenario_6_impossible_travel_flags_sf_to_nyc_in_five_minutes() {
        let user = ServerUserId::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = t0 + chrono::Duration::milliseconds(300_000);

        let prior = session_at(user, t0, 37.7749, -122.4194, "1.1.1.1"); // San Francisco
        let current = session_at(user, t1, 40.7128, -74.0060, "2.2.2.2"); // New York

        let history = vec![prior];
        let rule = Rule::new(
            "impossible travel",
            RuleParams::ImpossibleTravel { max_speed_kmh: 1000.0 },
        );
        let ctx = EvalContext {
            session: &current,
            recent_history: &history,
            concurrent_live: &[],
        };

        let result = evaluate(&rule, &ctx);
        assert!(result.violated);
        assert_eq!(result.data.related_session_ids, vec![history[0].id]);
    }

    #[test]
    fn impossible_travel_is_clean_without_prior_geo_observation() {
        let user = ServerUserId::new();
        let t0 = Utc::now();
        let current = session_at(user, t0, 37.7749, -122.4194, "1.1.1.1");
        let rule = Rule::new(
            "impossible travel",
            RuleParams::ImpossibleTravel { max_speed_kmh: 1000.0 },
        );
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &[],
        };
        assert!(!evaluate(&rule, &ctx).violated);
    }

    #[test]
    fn simultaneous_locations_flags_distant_concurrent_sessions() {
        let user = ServerUserId::new();
        let now = Utc::now();
        let current = session_at(user, now, 37.7749, -122.4194, "1.1.1.1");
        let other = session_at(user, now, 40.7128, -74.0060, "2.2.2.2");

        let rule = Rule::new(
            "simultaneous locations",
            RuleParams::SimultaneousLocations { min_distance_km: 500.0 },
        );
        let concurrent = vec![other];
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &concurrent,
        };
        let result = evaluate(&rule, &ctx);
        assert!(result.violated);
        assert_eq!(result.data.related_session_ids, vec![concurrent[0].id]);
    }

    #[test]
    fn simultaneous_locations_is_clean_when_nearby() {
        let user = ServerUserId::new();
        let now = Utc::now();
        let current = session_at(user, now, 37.7749, -122.4194, "1.1.1.1");
        let other = session_at(user, now, 37.7750, -122.4190, "1.1.1.1");

        let rule = Rule::new(
            "simultaneous locations",
            RuleParams::SimultaneousLocations { min_distance_km: 500.0 },
        );
        let concurrent = vec![other];
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &concurrent,
        };
        assert!(!evaluate(&rule, &ctx).violated);
    }

    #[test]
    fn device_velocity_counts_distinct_ips_in_window() {
        let user = ServerUserId::new();
        let now = Utc::now();
        let history = vec![
            session_at(user, now - chrono::Duration::hours(1), 0.0, 0.0, "1.1.1.1"),
            session_at(user, now - chrono::Duration::hours(2), 0.0, 0.0, "2.2.2.2"),
            session_at(user, now - chrono::Duration::hours(30), 0.0, 0.0, "9.9.9.9"), // outside window
        ];
        let current = session_at(user, now, 0.0, 0.0, "3.3.3.3");

        let rule = Rule::new(
            "device velocity",
            RuleParams::DeviceVelocity { window_hours: 24, max_ips: 2 },
        );
        let ctx = EvalContext {
            session: &current,
            recent_history: &history,
            concurrent_live: &[],
        };
        // 3 distinct ips within the 24h window (1.1.1.1, 2.2.2.2, 3.3.3.3) > max 2
        assert!(evaluate(&rule, &ctx).violated);
    }

    #[test]
    fn concurrent_streams_respects_max() {
        let user = ServerUserId::new();
        let now = Utc::now();
        let current = session_at(user, now, 0.0, 0.0, "1.1.1.1");
        let other = session_at(user, now, 0.0, 0.0, "1.1.1.1");

        let rule = Rule::new("concurrent streams", RuleParams::ConcurrentStreams { max_streams: 2 });
        let concurrent = vec![other];
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &concurrent,
        };
        // total live = 2 (current + 1 concurrent) == max, not violated
        assert!(!evaluate(&rule, &ctx).violated);

        let concurrent2 = vec![concurrent[0].clone(), session_at(user, now, 0.0, 0.0, "1.1.1.1")];
        let ctx2 = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &concurrent2,
        };
        assert!(evaluate(&rule, &ctx2).violated);
    }

    #[test]
    fn geo_restriction_flags_blocked_country_case_insensitively() {
        let user = ServerUserId::new();
        let mut current = session_at(user, Utc::now(), 0.0, 0.0, "1.1.1.1");
        current.observation.country = Some("RU".into());

        let rule = Rule::new(
            "geo restriction",
            RuleParams::GeoRestriction { blocked_countries: vec!["ru".into()] },
        );
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &[],
        };
        assert!(evaluate(&rule, &ctx).violated);
    }

    #[test]
    fn geo_restriction_is_clean_without_country_data() {
        let user = ServerUserId::new();
        let current = session_at(user, Utc::now(), 0.0, 0.0, "1.1.1.1");
        let rule = Rule::new(
            "geo restriction",
            RuleParams::GeoRestriction { blocked_countries: vec!["ru".into()] },
        );
        let ctx = EvalContext {
            session: &current,
            recent_history: &[],
            concurrent_live: &[],
        };
        assert!(!evaluate(&rule, &ctx).violated);
    }
}
