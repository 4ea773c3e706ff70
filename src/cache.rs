//! TTL cache of resource-hierarchy data with request coalescing.
//!
//! Each key has at most one registered in-flight fetch. Concurrent callers of
//! [`ResourceCache::get`] attach to it through a shared future. Fetches run on
//! their own tokio task and commit into the cache themselves, so a caller that
//! stops waiting never strands the in-flight marker.
//!
//! Every fetch gets a per-key generation number. A result is committed only
//! if no newer fetch has committed already and no invalidation happened after
//! the fetch started.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Backoff, CacheError, HatchError, ProviderError};
use crate::model::{Cluster, Container, RawTask, ResourceKind, Service, Task};
use crate::provider::CloudProvider;

/// What to fetch. Carries the parent entity so the fetch can be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Clusters(String),
    Services(Cluster),
    Tasks(Service),
    TaskDetail(Task),
}

/// Identity of a cache slot: resource type plus parent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub kind: ResourceKind,
    pub parent: String,
}

impl CacheKey {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Clusters(_) => ResourceKind::Clusters,
            Self::Services(_) => ResourceKind::Services,
            Self::Tasks(_) => ResourceKind::Tasks,
            Self::TaskDetail(_) => ResourceKind::TaskDetail,
        }
    }

    pub fn id(&self) -> KeyId {
        let parent = match self {
            Self::Clusters(region) => region.clone(),
            Self::Services(cluster) => cluster.arn.clone(),
            Self::Tasks(service) => service.arn.clone(),
            Self::TaskDetail(task) => task.arn.clone(),
        };
        KeyId { kind: self.kind(), parent }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Clusters(Vec<Cluster>),
    Services(Vec<Service>),
    Tasks(Vec<Task>),
    TaskDetail(Task),
}

pub type FetchResult = Result<Arc<Payload>, HatchError>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct CacheEntry {
    payload: Arc<Payload>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    in_flight: Option<InFlight>,
    /// Last generation handed out
    issued: u64,
    /// Generation of the committed entry
    committed: u64,
    /// Results from generations below this are discarded
    floor: u64,
    /// Spawned fetches that have not committed yet, superseded ones included
    running: usize,
}

impl Slot {
    /// Nothing cached and no fetch left that could commit into it.
    fn is_idle(&self) -> bool {
        self.running == 0 && self.entry.is_none()
    }
}

type Slots = Arc<Mutex<HashMap<KeyId, Slot>>>;

/// Keyed, TTL-based, deduplicating cache in front of a [`CloudProvider`].
#[derive(Clone)]
pub struct ResourceCache {
    provider: Arc<dyn CloudProvider>,
    ttls: CacheConfig,
    backoff: Backoff,
    slots: Slots,
}

fn lock(slots: &Mutex<HashMap<KeyId, Slot>>) -> MutexGuard<'_, HashMap<KeyId, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceCache {
    pub fn new(provider: Arc<dyn CloudProvider>, ttls: CacheConfig) -> Self {
        Self {
            provider,
            ttls,
            backoff: Backoff::default(),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the payload for `key`, fetching it if absent or expired.
    ///
    /// Concurrent calls for the same key share a single provider fetch.
    pub async fn get(&self, key: &CacheKey) -> FetchResult {
        let fetch = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(key.id()).or_default();
            if let Some(entry) = slot.entry.as_ref().filter(|e| e.is_fresh()) {
                return Ok(Arc::clone(&entry.payload));
            }
            match &slot.in_flight {
                Some(in_flight) => in_flight.fetch.clone(),
                None => self.start_fetch(slot, key),
            }
        };
        fetch.await
    }

    /// Fresh payload for `key` without triggering a fetch.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<Payload>> {
        let slots = lock(&self.slots);
        slots
            .get(&key.id())
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| entry.is_fresh())
            .map(|entry| Arc::clone(&entry.payload))
    }

    /// Removes the entry for `key`. A fetch already in flight finishes in the
    /// background but its result is not committed. The slot itself is dropped
    /// once no fetch for it is left running.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut slots = lock(&self.slots);
        let id = key.id();
        if let Some(slot) = slots.get_mut(&id) {
            slot.entry = None;
            slot.in_flight = None;
            slot.floor = slot.issued + 1;
            debug!(key = ?id, "cache entry invalidated");
            if slot.is_idle() {
                slots.remove(&id);
            }
        }
    }

    /// Forces a new fetch for `key`.
    pub async fn refresh(&self, key: &CacheKey) -> FetchResult {
        self.invalidate(key);
        self.get(key).await
    }

    /// Whether a fetch for `key` is currently registered as in flight.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.slots).get(&key.id()).is_some_and(|slot| slot.in_flight.is_some())
    }

    fn start_fetch(&self, slot: &mut Slot, key: &CacheKey) -> SharedFetch {
        slot.issued += 1;
        slot.running += 1;
        let generation = slot.issued;
        let ttl = self.ttls.ttl(key.kind());

        let provider = Arc::clone(&self.provider);
        let slots = Arc::clone(&self.slots);
        let backoff = self.backoff;
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = fetch(provider.as_ref(), backoff, &task_key).await.map(Arc::new);
            commit(&slots, &task_key, generation, ttl, &result);
            result
        });

        let fetch: SharedFetch = async move {
            handle
                .await
                .unwrap_or_else(|err| Err(CacheError::Corrupted(format!("cache fetch task failed: {err}")).into()))
        }
        .boxed()
        .shared();

        slot.in_flight = Some(InFlight {
            generation,
            fetch: fetch.clone(),
        });
        fetch
    }
}

fn commit(slots: &Slots, key: &CacheKey, generation: u64, ttl: Duration, result: &FetchResult) {
    let mut slots = lock(slots);
    let id = key.id();
    let Some(slot) = slots.get_mut(&id) else {
        return;
    };
    slot.running = slot.running.saturating_sub(1);
    if slot.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
        slot.in_flight = None;
    }
    match result {
        Ok(_) if generation < slot.floor || generation <= slot.committed => {
            debug!(key = ?id, generation, "discarding stale fetch result");
        }
        Ok(payload) => {
            slot.committed = generation;
            slot.entry = Some(CacheEntry {
                payload: Arc::clone(payload),
                fetched_at: Instant::now(),
                ttl,
            });
        }
        Err(_) => {}
    }
    if slot.is_idle() {
        slots.remove(&id);
    }
}

async fn fetch(provider: &dyn CloudProvider, backoff: Backoff, key: &CacheKey) -> Result<Payload, HatchError> {
    match key {
        CacheKey::Clusters(region) => {
            let raw = backoff.retry(|| provider.list_clusters(region)).await?;
            let mut clusters = raw
                .into_iter()
                .map(|r| Cluster::from_raw(r, region))
                .collect::<Result<Vec<_>, _>>()?;
            clusters.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Payload::Clusters(clusters))
        }
        CacheKey::Services(cluster) => {
            let raw = backoff.retry(|| provider.list_services(cluster)).await?;
            let mut services = Vec::with_capacity(raw.len());
            for record in raw {
                let service = Service::from_raw(record, cluster)?;
                if service.cluster_arn != cluster.arn {
                    warn!(service = %service.name, cluster = %cluster.name, "dropping service from another cluster");
                    continue;
                }
                services.push(service);
            }
            services.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Payload::Services(services))
        }
        CacheKey::Tasks(service) => {
            let raw = backoff.retry(|| provider.list_tasks(service)).await?;
            let mut tasks = Vec::with_capacity(raw.len());
            for record in raw {
                let task = validate_task(record, &service.region)?;
                if task.service_name != service.name || task.cluster_arn != service.cluster_arn {
                    warn!(task = %task.id, service = %service.name, "dropping task that does not belong to service");
                    continue;
                }
                if !task.is_running() {
                    debug!(task = %task.id, status = %task.last_status, "skipping task that is not running");
                    continue;
                }
                tasks.push(task);
            }
            tasks.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(Payload::Tasks(tasks))
        }
        CacheKey::TaskDetail(task) => {
            let raw = backoff.retry(|| provider.describe_task(task)).await?;
            let detail = validate_task(raw, &task.region)?;
            if detail.arn != task.arn {
                return Err(ProviderError::NotFound {
                    operation: "DescribeTasks".to_string(),
                    message: format!("task {} is no longer available", task.id),
                }
                .into());
            }
            Ok(Payload::TaskDetail(detail))
        }
    }
}

/// Validates a task record and drops containers that belong to another task.
fn validate_task(raw: RawTask, region: &str) -> Result<Task, CacheError> {
    let mut task = Task::from_raw(raw, region)?;
    let arn = task.arn.clone();
    task.containers.retain(|c: &Container| {
        let belongs = c.task_arn == arn;
        if !belongs {
            warn!(container = %c.name, task = %task.id, "dropping container from another task");
        }
        belongs
    });
    Ok(task)
}
