//! Shared-store backend selection from `MEM_OR_EXTERNAL`.

use std::sync::Arc;

use doorman_state::SharedStore;
use doorman_state_memory::MemorySharedStore;
use doorman_state_redis::{RedisConfig, RedisSharedStore};
use tracing::info;

use crate::config::{BackendMode, Settings};
use crate::error::ServerError;

/// Build the shared store for the configured mode.
///
/// The multi-worker gate has already run in validation; this only wires
/// up whichever backend was approved.
pub fn create_shared_store(settings: &Settings) -> Result<Arc<dyn SharedStore>, ServerError> {
    match settings.backend.mode {
        BackendMode::Mem => {
            info!("shared state: in-process (single worker)");
            Ok(Arc::new(MemorySharedStore::new()))
        }
        BackendMode::Redis | BackendMode::External => {
            let redis = &settings.backend.redis;
            let config = RedisConfig {
                host: redis.host.clone(),
                port: redis.port,
                db: redis.db,
                password: redis.password.clone(),
                ..RedisConfig::default()
            };
            let store = RedisSharedStore::new(&config)
                .map_err(|e| ServerError::Config(format!("redis backend: {e}")))?;
            info!(host = %redis.host, port = redis.port, "shared state: redis");
            Ok(Arc::new(store))
        }
    }
}
