pub mod adapter;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod lifecycle;
pub mod mapper;
pub mod models;
pub mod poller;
pub mod push_processor;
pub mod rule_engine;
pub mod runtime;
pub mod server;
pub mod state_tracker;
pub mod store;
pub mod violation_recorder;

pub use adapter::{AdapterError, MediaServerAdapter, ObservedSession, PushEvent};
pub use aggregator::{Aggregator, DashboardStats};
pub use cache::{CacheBackend, PubSubTopic};
pub use config::Settings;
pub use error::{CacheError, LifecycleError, StoreError};
pub use lifecycle::LifecycleEngine;
pub use models::{
    MediaType, Observation, Rule, RuleId, RuleParams, RuleType, Server, ServerId, ServerUser,
    ServerUserId, ServerVariant, Session, SessionId, SessionKey, SessionState, Severity, UserId,
    Violation, ViolationData, ViolationId,
};
pub use poller::Poller;
pub use push_processor::{PushProcessor, PushProcessorError};
pub use runtime::{AdapterHandle, LifecycleRuntime};
pub use server::ApiState;
pub use store::SessionStore;
