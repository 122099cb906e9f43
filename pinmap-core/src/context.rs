//! SessionContext: everything one session shares, built once at startup
//!
//! Owns the readiness registry, the response cache and the shutdown token.
//! Components receive it (or the parts they need) explicitly.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::response_cache::ResponseCache;
use crate::config::Config;
use crate::controller::collaborators::component;
use crate::registry::readiness_registry::ReadinessRegistry;

pub struct SessionContext {
    config: Arc<Config>,
    registry: Arc<ReadinessRegistry>,
    cache: Arc<ResponseCache>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionContext {
    /// Build the registry and cache from `config` and register the cache
    /// as a component.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ReadinessRegistry::new(config.registry.default_wait_timeout));
        let cache = Arc::new(ResponseCache::new(config.cache.clone(), config.build.clone()));

        registry.register_instance(component::RESPONSE_CACHE, Arc::clone(&cache), [] as [&str; 0]);

        info!(
            version = %config.build.version,
            environment = %config.build.environment,
            aggressive_cache_busting = config.cache.aggressive_cache_busting,
            "Session context created"
        );

        Self {
            config: Arc::new(config),
            registry,
            cache,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ReadinessRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Token cancelled by [`Self::shutdown`]
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the periodic cache sweep
    pub fn start_background_tasks(&self) {
        let handle = self.cache.spawn_sweeper(self.shutdown.child_token());
        self.tasks.lock().push(handle);
    }

    /// Cancel background tasks and wait for them to stop
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Session context shut down");
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("cancelled", &self.shutdown.is_cancelled())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
