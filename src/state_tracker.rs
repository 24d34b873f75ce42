//! Pure session-timing functions (spec.md §4.C1). No I/O, no clock reads —
//! callers pass `now`/`stopped_at` explicitly so these stay deterministic
//! and trivially unit-testable, the way the teacher's `analytics/calculators.rs`
//! pure functions are tested with literal inputs and outputs.

use chrono::{DateTime, Utc};

use crate::models::SessionState;

/// The pause-accounting fields that travel together through a transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseAccounting {
    pub last_paused_at: Option<DateTime<Utc>>,
    pub paused_duration_ms: i64,
}

/// `accumulatePause` — spec.md §4.C1.
///
/// - playing -> paused: stamps `last_paused_at`, leaves the running total untouched.
/// - paused -> playing: folds the just-finished pause into the running total and clears the stamp.
/// - any -> same state: passthrough (in particular paused -> paused does *not* reset the stamp).
pub fn accumulate_pause(
    prev_state: SessionState,
    new_state: SessionState,
    prev: PauseAccounting,
    now: DateTime<Utc>,
) -> PauseAccounting {
    use SessionState::*;
    match (prev_state, new_state) {
        (Playing, Paused) => PauseAccounting {
            last_paused_at: Some(now),
            paused_duration_ms: prev.paused_duration_ms,
        },
        (Paused, Playing) => {
            let elapsed = prev
                .last_paused_at
                .map(|t| (now - t).num_milliseconds())
                .unwrap_or(0);
            PauseAccounting {
                last_paused_at: None,
                paused_duration_ms: prev.paused_duration_ms + elapsed.max(0),
            }
        }
        _ => prev,
    }
}

/// Input to [`stop_duration`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopInput {
    pub started_at: DateTime<Utc>,
    pub last_paused_at: Option<DateTime<Utc>>,
    pub paused_duration_ms: i64,
}

/// Output of [`stop_duration`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopOutput {
    pub duration_ms: i64,
    pub final_paused_duration_ms: i64,
}

/// `stopDuration` — spec.md §4.C1. If the session was paused at the moment
/// of stop, the open pause is folded in before computing elapsed duration.
pub fn stop_duration(input: StopInput, stopped_at: DateTime<Utc>) -> StopOutput {
    let final_paused_duration_ms = match input.last_paused_at {
        Some(paused_at) => {
            input.paused_duration_ms + (stopped_at - paused_at).num_milliseconds().max(0)
        }
        None => input.paused_duration_ms,
    };

    let elapsed_ms = (stopped_at - input.started_at).num_milliseconds();
    let duration_ms = (elapsed_ms - final_paused_duration_ms).max(0);

    StopOutput {
        duration_ms,
        final_paused_duration_ms,
    }
}

/// `watchCompletion` — spec.md §4.C1: true once 80% of the runtime was seen.
pub fn watch_completion(progress_ms: i64, total_duration_ms: i64) -> bool {
    total_duration_ms > 0 && (progress_ms as f64 / total_duration_ms as f64) >= 0.80
}

/// The engagement threshold below which a finished session is `shortSession`
/// and excluded from downstream analytics (spec.md §4.C1, Glossary).
pub const ENGAGEMENT_THRESHOLD_MS: i64 = 120_000;

/// `shouldRecord` — spec.md §4.C1.
pub fn should_record(duration_ms: i64) -> bool {
    duration_ms >= ENGAGEMENT_THRESHOLD_MS
}
