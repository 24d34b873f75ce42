use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ServerId;

/// Owning identity across servers (one `UserId` may map to several
/// `ServerUser` rows, one per server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        UserId(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique per (server, externalId) — spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerUserId(pub Uuid);

impl ServerUserId {
    pub fn new() -> Self {
        ServerUserId(Uuid::new_v4())
    }
}

impl Default for ServerUserId {
    fn default() -> Self {
        Self::new()
    }
}

/// The lower bound a trust score floors at. Violations decrement; nothing
/// ever takes it below this (spec.md §3 invariant, §4.C6 penalty table).
pub const TRUST_SCORE_FLOOR: i32 = 0;
/// Default trust score for a newly observed server user.
pub const TRUST_SCORE_DEFAULT: i32 = 100;

/// A user as seen on one particular server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUser {
    pub id: ServerUserId,
    pub server_id: ServerId,
    pub user_id: UserId,
    pub external_id: String,
    pub username: String,
    pub thumb: Option<String>,
    pub trust_score: i32,
}

impl ServerUser {
    pub fn new(server_id: ServerId, external_id: impl Into<String>, username: impl Into<String>) -> Self {
        ServerUser {
            id: ServerUserId::new(),
            server_id,
            user_id: UserId::new(),
            external_id: external_id.into(),
            username: username.into(),
            thumb: None,
            trust_score: TRUST_SCORE_DEFAULT,
        }
    }

    /// Applies a violation penalty, floored at [`TRUST_SCORE_FLOOR`].
    /// Monotonically non-increasing, per spec.md §3 invariant.
    pub fn apply_penalty(&mut self, penalty: i32) {
        self.trust_score = (self.trust_score - penalty).max(TRUST_SCORE_FLOOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> ServerUser {
        ServerUser::new(ServerId::new(), "ext-1", "alice")
    }

    #[test]
    fn default_trust_score_is_100() {
        assert_eq!(user().trust_score, TRUST_SCORE_DEFAULT);
    }

    #[test]
    fn penalty_decrements_trust_score() {
        let mut u = user();
        u.apply_penalty(20);
        assert_eq!(u.trust_score, 80);
    }

    #[test]
    fn penalty_floors_at_zero() {
        let mut u = user();
        u.apply_penalty(1000);
        assert_eq!(u.trust_score, 0);
        u.apply_penalty(5);
        assert_eq!(u.trust_score, 0);
    }

    #[test]
    fn repeated_penalties_never_increase_score() {
        let mut u = user();
        let mut last = u.trust_score;
        for p in [10, 20, 5, 0, 30] {
            u.apply_penalty(p);
            assert!(u.trust_score <= last);
            last = u.trust_score;
        }
    }
}
