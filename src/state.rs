use std::sync::Arc;

use crate::cache::AggregationCache;
use crate::config::Settings;
use crate::error::StoreError;
use crate::orchestrator::LikeOrchestrator;
use crate::rate_limit::RateLimiter;
use crate::shards::CacheService;
use crate::source::ObservationLedger;
use crate::store::{KvStore, RedisStore};

// app's shared state: one store handle, handed to every component explicitly

pub struct AppState {
    pub settings: Settings,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheService>,
}

impl AppState {
    // Spawns the cache workers; needs a running tokio runtime
    pub fn new(settings: Settings, store: Arc<dyn KvStore>) -> Arc<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), settings.rate_limit));
        let cache = Arc::new(AggregationCache::new(store, settings.range));
        let cache = Arc::new(CacheService::spawn(cache, settings.cache));

        Arc::new(Self {
            settings,
            rate_limiter,
            cache,
        })
    }

    pub async fn connect(settings: Settings, redis_url: &str) -> Result<Arc<Self>, StoreError> {
        let store = RedisStore::connect(redis_url, settings.store_timeout).await?;
        Ok(Self::new(settings, Arc::new(store)))
    }

    pub fn orchestrator(&self, ledger: Arc<dyn ObservationLedger>) -> LikeOrchestrator {
        LikeOrchestrator::new(
            ledger,
            self.rate_limiter.clone(),
            self.cache.clone(),
            self.settings.range,
        )
    }
}
