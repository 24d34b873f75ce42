use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RuleId, RuleType, ServerUserId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolationId(pub Uuid);

impl ViolationId {
    pub fn new() -> Self {
        ViolationId(Uuid::new_v4())
    }
}

impl Default for ViolationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Warning,
    High,
}

impl Severity {
    /// Trust-score penalty table from spec.md §4.C6.
    pub fn penalty(&self) -> i32 {
        match self {
            Severity::High => 20,
            Severity::Warning => 10,
            Severity::Low => 5,
        }
    }
}

/// Opaque payload attached to a violation; `related_session_ids` is
/// populated for multi-session rule types (spec.md §3/§4.C5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViolationData {
    pub related_session_ids: Vec<SessionId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: ViolationId,
    pub rule_id: RuleId,
    pub rule_type: RuleType,
    pub server_user_id: ServerUserId,
    pub session_id: SessionId,
    pub severity: Severity,
    pub data: ViolationData,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Violation {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}
