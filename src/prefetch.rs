//! Background warming of cache entries the user is likely to open next.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheKey, ResourceCache};
use crate::config::PrefetchConfig;

/// Warms child entries of the highlighted items with bounded concurrency.
///
/// Each call to [`Prefetcher::prefetch`] supersedes the previous one: fetches
/// that have not started yet are abandoned. Fetches that already started run
/// to completion and land in the cache.
pub struct Prefetcher {
    cache: ResourceCache,
    semaphore: Arc<Semaphore>,
    enabled: bool,
    current: CancellationToken,
}

impl Prefetcher {
    pub fn new(cache: ResourceCache, config: &PrefetchConfig) -> Self {
        Self {
            cache,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            enabled: config.enabled,
            current: CancellationToken::new(),
        }
    }

    /// Cancels outstanding prefetches and starts warming `keys`.
    pub fn prefetch(&mut self, keys: Vec<CacheKey>) -> Vec<JoinHandle<()>> {
        self.cancel();
        if !self.enabled {
            return Vec::new();
        }

        let token = self.current.clone();
        keys.into_iter()
            .filter(|key| self.cache.peek(key).is_none())
            .map(|key| {
                let cache = self.cache.clone();
                let semaphore = Arc::clone(&self.semaphore);
                let token = token.clone();
                tokio::spawn(async move {
                    let _permit = tokio::select! {
                        () = token.cancelled() => return,
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };
                    if token.is_cancelled() {
                        return;
                    }
                    let started = Instant::now();
                    match cache.get(&key).await {
                        Ok(_) => debug!(key = ?key.id(), took_ms = %started.elapsed().as_millis(), "prefetch: ok"),
                        Err(err) => debug!(key = ?key.id(), error = %err, "prefetch: failed"),
                    }
                })
            })
            .collect()
    }

    /// Abandons prefetches that have not started yet.
    pub fn cancel(&mut self) {
        self.current.cancel();
        self.current = CancellationToken::new();
    }
}
