use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ServerUserId, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        RuleId(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

/// The five rule families of spec.md §4.C5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ImpossibleTravel,
    SimultaneousLocations,
    DeviceVelocity,
    ConcurrentStreams,
    GeoRestriction,
}

impl RuleType {
    /// Default severity mapping from spec.md §4.C5, used unless the rule
    /// overrides it via [`RuleParams`].
    pub fn default_severity(&self) -> Severity {
        match self {
            RuleType::GeoRestriction | RuleType::ImpossibleTravel => Severity::High,
            RuleType::ConcurrentStreams | RuleType::SimultaneousLocations => Severity::Warning,
            RuleType::DeviceVelocity => Severity::Low,
        }
    }

    /// Whether this rule type can implicate more than one session at once
    /// (spec.md §4.C5/§4.C6 — drives `relatedSessionIds` and the dedup
    /// strategy).
    pub fn is_multi_session(&self) -> bool {
        matches!(
            self,
            RuleType::ConcurrentStreams | RuleType::SimultaneousLocations
        )
    }
}

/// Type-specific rule parameters (spec.md §3 "parameters (type-specific)").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleParams {
    ImpossibleTravel { max_speed_kmh: f64 },
    SimultaneousLocations { min_distance_km: f64 },
    DeviceVelocity { window_hours: i64, max_ips: u32 },
    ConcurrentStreams { max_streams: u32 },
    GeoRestriction { blocked_countries: Vec<String> },
}

impl RuleParams {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleParams::ImpossibleTravel { .. } => RuleType::ImpossibleTravel,
            RuleParams::SimultaneousLocations { .. } => RuleType::SimultaneousLocations,
            RuleParams::DeviceVelocity { .. } => RuleType::DeviceVelocity,
            RuleParams::ConcurrentStreams { .. } => RuleType::ConcurrentStreams,
            RuleParams::GeoRestriction { .. } => RuleType::GeoRestriction,
        }
    }
}

/// A configurable policy rule (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub params: RuleParams,
    pub is_active: bool,
    /// `None` = global, applies to every user.
    pub server_user_id: Option<ServerUserId>,
}

impl Rule {
    pub fn new(name: impl Into<String>, params: RuleParams) -> Self {
        Rule {
            id: RuleId::new(),
            name: name.into(),
            params,
            is_active: true,
            server_user_id: None,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        self.params.rule_type()
    }

    /// Whether this rule applies to `server_user_id` — global rules apply
    /// to everyone, scoped rules only to their addressee (spec.md §4.C5).
    pub fn applies_to(&self, server_user_id: ServerUserId) -> bool {
        match self.server_user_id {
            None => true,
            Some(id) => id == server_user_id,
        }
    }
}
