//! Core data model (spec.md §3).

mod rule;
mod server;
mod server_user;
mod session;
mod violation;

pub use rule::{Rule, RuleId, RuleParams, RuleType};
pub use server::{Server, ServerId, ServerVariant};
pub use server_user::{ServerUser, ServerUserId, UserId};
pub use session::{
    MediaType, Observation, Session, SessionId, SessionKey, SessionKeyError, SessionState,
};
pub use violation::{Severity, Violation, ViolationData, ViolationId};
