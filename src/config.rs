//! Runtime configuration.
//!
//! Defaults layer under an optional TOML file, which layers under
//! `SESSIONGUARD_*` environment variables — the same layered-`config` shape
//! cp5337-sx9's services use, rather than hand-rolled env var parsing.

use serde::Deserialize;
use std::time::Duration;

/// All tunables for a running [`crate::runtime::LifecycleRuntime`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Postgres connection string for the session store.
    pub database_url: String,
    /// Redis connection string for the cache/pubsub backend.
    pub cache_url: String,
    /// How often the poller sweeps every server (default 60s, per spec §4.C8).
    pub poll_interval_secs: u64,
    /// Per-server adapter fetch deadline (default 10s, per spec §5).
    pub adapter_timeout_secs: u64,
    /// `SET LOCAL statement_timeout` applied to every lifecycle transaction.
    pub statement_timeout_secs: u64,
    /// TTL of the distributed session-create lock (default 5s, per spec §4.C4).
    pub create_lock_ttl_secs: u64,
    /// Max retries on a SERIALIZABLE conflict before surfacing the error.
    pub serialization_max_retries: u32,
    /// Aggregator refresh interval (default 60s, per spec §4.C10).
    pub aggregator_interval_secs: u64,
    /// Whether the aggregator background job runs at all.
    pub aggregator_enabled: bool,
    /// Host the health-check server binds to.
    pub http_host: String,
    /// Port the health-check server binds to.
    pub http_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "postgres://localhost/session_guard".to_string(),
            cache_url: "redis://127.0.0.1/".to_string(),
            poll_interval_secs: 60,
            adapter_timeout_secs: 10,
            statement_timeout_secs: 10,
            create_lock_ttl_secs: 5,
            serialization_max_retries: 3,
            aggregator_interval_secs: 60,
            aggregator_enabled: true,
            http_host: "127.0.0.1".to_string(),
            http_port: 8080,
        }
    }
}

impl Settings {
    /// Loads settings from defaults, an optional `config.toml` in the
    /// working directory, then `SESSIONGUARD_*` environment overrides.
    ///
    /// # Errors
    /// Returns an error if a present config file is malformed or an
    /// environment override can't be deserialized into its field type.
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("SESSIONGUARD").separator("__"));

        builder.build()?.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn create_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.create_lock_ttl_secs)
    }

    pub fn aggregator_interval(&self) -> Duration {
        Duration::from_secs(self.aggregator_interval_secs)
    }
}
