//! Session Guard daemon binary.
//!
//! Run with: `cargo run --bin session-guard`

use std::sync::Arc;

use session_guard::cache::RedisCache;
use session_guard::config::Settings;
use session_guard::runtime::LifecycleRuntime;
use session_guard::store::PgSessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::load()?;

    let store = PgSessionStore::connect(&settings.database_url, settings.statement_timeout()).await?;
    let cache = RedisCache::connect(&settings.cache_url)?;

    // Media-server adapters (plex/jellyfin/emby HTTP clients) are the
    // pluggable collaborator described in spec.md §6, not built by this
    // crate. Operators wire their concrete adapters in here as
    // `runtime::AdapterHandle`s; none are registered by default.
    let adapters = Vec::new();

    let runtime = Arc::new(LifecycleRuntime::new(
        settings,
        Arc::new(store),
        Arc::new(cache),
        Vec::new(),
        adapters,
    ));

    runtime.start().await?;
    tracing::info!("session-guard running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    runtime.stop();

    Ok(())
}
