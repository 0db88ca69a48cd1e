use crate::message::{NamespaceOp, NamespaceReply, NamespaceRequest, ResponsePayload};
use crate::path_shard_cache::PathShardCache;
use crate::provider::{DirEntry, FileAttributes, ListSink, LocationRelay, NamespaceProvider};
use crate::queue::WorkerQueue;
use cluster_lib::{ClusterError, ClusterResult, EntryId, NsPath, Subject};
use futures::FutureExt;
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker groups, one per namespace partition "bucket". Identity-based
    /// sharding keys the group off the entry's database id.
    pub worker_groups: usize,
    pub workers_per_group: usize,
    /// Dedicated listing pool; listings are unbounded in duration and must
    /// not starve the general workers.
    pub list_workers: usize,
    /// Dedicated cache-location pool; 0 shares the general workers.
    pub location_workers: usize,
    /// Per-queue capacity; 0 is unbounded. Dispatch fast-fails when full.
    pub queue_capacity: usize,
    pub fold_enabled: bool,
    /// Completions slower than this log at warn level; 0 disables.
    pub slow_threshold_millis: u64,
    pub path_cache_capacity: usize,
    pub list_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_groups: 1,
            workers_per_group: 4,
            list_workers: 2,
            location_workers: 0,
            queue_capacity: 0,
            fold_enabled: true,
            slow_threshold_millis: 0,
            path_cache_capacity: 10000,
            list_batch_size: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueKind {
    General,
    List,
    Location,
}

#[derive(Clone, Debug, Default)]
struct OpCounter {
    processed: u64,
    failed: u64,
    folded: u64,
    discarded: u64,
}

/// Routes inbound metadata requests onto per-worker FIFO queues and drains
/// them with one task per queue. Operations on the same entry always land
/// on the same queue, which is what preserves their causal order.
pub struct NamespaceDispatcher {
    config: DispatcherConfig,
    provider: Arc<dyn NamespaceProvider>,
    relay: Option<Arc<dyn LocationRelay>>,
    general: Vec<Arc<WorkerQueue>>,
    list: Vec<Arc<WorkerQueue>>,
    location: Vec<Arc<WorkerQueue>>,
    path_cache: PathShardCache,
    counters: Mutex<HashMap<&'static str, OpCounter>>,
    slow_threshold_millis: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NamespaceDispatcher {
    pub fn new(
        mut config: DispatcherConfig,
        provider: Arc<dyn NamespaceProvider>,
        relay: Option<Arc<dyn LocationRelay>>,
    ) -> Arc<Self> {
        config.worker_groups = config.worker_groups.max(1);
        config.workers_per_group = config.workers_per_group.max(1);
        config.list_workers = config.list_workers.max(1);

        let make_pool = |count: usize| -> Vec<Arc<WorkerQueue>> {
            (0..count)
                .map(|_| Arc::new(WorkerQueue::new(config.queue_capacity)))
                .collect()
        };

        let dispatcher = Arc::new(Self {
            general: make_pool(config.worker_groups * config.workers_per_group),
            list: make_pool(config.list_workers),
            location: make_pool(config.location_workers),
            path_cache: PathShardCache::new(config.path_cache_capacity),
            counters: Mutex::new(HashMap::new()),
            slow_threshold_millis: AtomicU64::new(config.slow_threshold_millis),
            workers: Mutex::new(Vec::new()),
            config,
            provider,
            relay,
        });
        dispatcher.start();
        dispatcher
    }

    fn start(self: &Arc<Self>) {
        let all = self
            .general
            .iter()
            .chain(self.list.iter())
            .chain(self.location.iter())
            .cloned()
            .collect::<Vec<_>>();
        let mut workers = lock(&self.workers);
        for queue in all {
            // Workers keep only a weak handle so dropping the dispatcher
            // still tears the loop down.
            let dispatcher = Arc::downgrade(self);
            workers.push(tokio::spawn(async move {
                info!("namespace worker started");
                loop {
                    let request = queue.pop().await;
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        break;
                    };
                    dispatcher.process(request, &queue).await;
                }
                info!("namespace worker finished");
            }));
        }
    }

    /// Stops all worker tasks. Pending messages are dropped; their reply
    /// channels close.
    pub fn shutdown(&self) {
        for worker in lock(&self.workers).drain(..) {
            worker.abort();
        }
    }

    /// Accepts one request from the transport layer. Never blocks: a full
    /// queue resolves into an immediate resource-exhausted reply.
    pub fn submit(&self, request: NamespaceRequest) -> ClusterResult<()> {
        if let Some(relay) = &self.relay {
            if request.op.is_location_modification() {
                let relay = relay.clone();
                let id = request.id;
                let op = request.op.clone();
                tokio::spawn(async move {
                    relay.relay(id, &op).await;
                });
            }
        }

        let (kind, index) = match self.select_queue(&request) {
            Ok(selection) => selection,
            Err(e) => {
                self.record(request.op.name(), |c| c.failed += 1);
                request.send_reply(NamespaceReply::failed(e.clone()));
                return Err(e);
            }
        };

        let queue = match kind {
            QueueKind::General => &self.general[index],
            QueueKind::List => &self.list[index],
            QueueKind::Location => &self.location[index],
        };

        if let Err(request) = queue.try_push(request) {
            warn!("dispatcher queue limit exceeded for {}", request.op.name());
            self.record(request.op.name(), |c| c.failed += 1);
            request.send_reply(NamespaceReply::failed(ClusterError::ResourceExhausted(
                "dispatcher queue limit exceeded".to_string(),
            )));
        }
        Ok(())
    }

    pub fn set_slow_threshold(&self, millis: u64) {
        self.slow_threshold_millis.store(millis, Ordering::Relaxed);
    }

    pub fn slow_threshold(&self) -> u64 {
        self.slow_threshold_millis.load(Ordering::Relaxed)
    }

    /// Human-readable dump of queue depths and per-operation counters, for
    /// the admin surface.
    pub fn info_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "worker groups {} x {}, list workers {}, location workers {}\n",
            self.config.worker_groups,
            self.config.workers_per_group,
            self.config.list_workers,
            self.config.location_workers
        ));
        let depth = |pool: &[Arc<WorkerQueue>]| -> Vec<usize> { pool.iter().map(|q| q.len()).collect() };
        out.push_str(&format!(
            "queue depths: general {:?}, list {:?}, location {:?}\n",
            depth(&self.general),
            depth(&self.list),
            depth(&self.location)
        ));
        let counters: BTreeMap<&'static str, OpCounter> = lock(&self.counters)
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (name, counter) in counters {
            out.push_str(&format!(
                "{:<24} processed {:>8} failed {:>6} folded {:>6} discarded {:>6}\n",
                name, counter.processed, counter.failed, counter.folded, counter.discarded
            ));
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn folded_count(&self, name: &'static str) -> u64 {
        lock(&self.counters).get(name).map(|c| c.folded).unwrap_or(0)
    }

    // ---- routing -------------------------------------------------------

    pub(crate) fn select_queue(
        &self,
        request: &NamespaceRequest,
    ) -> ClusterResult<(QueueKind, usize)> {
        if request.op.is_listing() {
            let index = match (&request.id, &request.path) {
                (Some(id), _) => hash_of(id) % self.list.len(),
                (None, Some(path)) => hash_of(path) % self.list.len(),
                (None, None) => {
                    return Err(ClusterError::InvalidParam(
                        "missing identifier and path".to_string(),
                    ))
                }
            };
            debug!("using list queue {}", index);
            return Ok((QueueKind::List, index));
        }

        if request.op.is_cache_location_op() && !self.location.is_empty() {
            let index = match &request.id {
                Some(id) => hash_of(id) % self.location.len(),
                // No determinism needed without an id; the entry's identity
                // is unknown until the path resolves anyway.
                None => rand::thread_rng().gen_range(0..self.location.len()),
            };
            debug!("using location queue {}", index);
            return Ok((QueueKind::Location, index));
        }

        let groups = self.config.worker_groups;
        let per_group = self.config.workers_per_group;
        let group = match (&request.id, &request.path) {
            (Some(id), _) => (id.database_id() as usize) % groups,
            (None, Some(path)) => match self.cached_partition(path) {
                Some(db) => (db as usize) % groups,
                None => rand::thread_rng().gen_range(0..groups),
            },
            (None, None) => rand::thread_rng().gen_range(0..groups),
        };
        let worker = match (&request.id, &request.path) {
            (Some(id), _) => hash_of(id) % per_group,
            (None, Some(path)) => hash_of(path) % per_group,
            (None, None) => rand::thread_rng().gen_range(0..per_group),
        };
        Ok((QueueKind::General, group * per_group + worker))
    }

    fn cached_partition(&self, path: &NsPath) -> Option<u32> {
        if self.config.worker_groups <= 1 {
            return None;
        }
        let hit = self.path_cache.lookup(path);
        if hit.is_none() {
            debug!("path cache miss for {}", path);
        }
        hit
    }

    // ---- execution -----------------------------------------------------

    async fn process(&self, request: NamespaceRequest, queue: &Arc<WorkerQueue>) {
        let name = request.op.name();

        // Discard messages whose time to live has effectively run out, but
        // only for retryable reads; a mutation is executed regardless.
        if request.expired() && request.op.discard_early() {
            warn!("discarding {} because its time to live has been exceeded", name);
            self.record(name, |c| c.discarded += 1);
            request.send_reply(NamespaceReply::failed(ClusterError::Timeout(
                "TTL exceeded".to_string(),
            )));
            return;
        }

        let started = Instant::now();
        let result = AssertUnwindSafe(self.execute(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ClusterError::Internal(
                    "unexpected failure in request handler".to_string(),
                ))
            });
        let elapsed_millis = started.elapsed().as_millis() as u64;

        let threshold = self.slow_threshold_millis.load(Ordering::Relaxed);
        if threshold != 0 && elapsed_millis > threshold {
            warn!("{} processed in {} ms", name, elapsed_millis);
        } else {
            debug!("{} processed in {} ms", name, elapsed_millis);
        }

        match result {
            Ok(payload) => {
                self.record(name, |c| c.processed += 1);
                request.send_reply(NamespaceReply::ok(payload.clone()));
                if self.config.fold_enabled && request.op.is_idempotent_read() {
                    let folded = queue.fold(&request, &payload);
                    if folded > 0 {
                        info!("folded {} pending {}", folded, name);
                        self.record(name, |c| c.folded += folded as u64);
                    }
                }
            }
            Err(err) => {
                self.record(name, |c| {
                    c.processed += 1;
                    c.failed += 1;
                });
                if !err.is_not_found() {
                    warn!("{} failed: {}", name, err);
                }
                request.send_reply(NamespaceReply::failed(err));
            }
        }
    }

    async fn execute(&self, request: &NamespaceRequest) -> ClusterResult<ResponsePayload> {
        match &request.op {
            NamespaceOp::CreateEntry { attrs, is_dir } => {
                let path = require_path(request)?;
                let id = self
                    .provider
                    .create_entry(&request.subject, path, attrs, *is_dir)
                    .await?;
                self.update_path_cache(path, &id).await;
                Ok(ResponsePayload::Id(id))
            }
            NamespaceOp::DeleteEntry => {
                if request.id.is_none() && request.path.is_none() {
                    return Err(ClusterError::InvalidParam(
                        "no identifier or path defined".to_string(),
                    ));
                }
                self.provider
                    .delete_entry(&request.subject, request.id.as_ref(), request.path.as_ref())
                    .await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::Rename { new_path, overwrite } => {
                let id = self.resolve_id(request).await?;
                self.provider
                    .rename_entry(&request.subject, &id, new_path, *overwrite)
                    .await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::GetAttributes => {
                let id = self.resolve_id(request).await?;
                let attrs = self
                    .provider
                    .get_file_attributes(&request.subject, &id)
                    .await?;
                Ok(ResponsePayload::Attributes(attrs))
            }
            NamespaceOp::SetAttributes { attrs } => {
                let id = self.resolve_id(request).await?;
                let updated = self
                    .provider
                    .set_file_attributes(&request.subject, &id, attrs)
                    .await?;
                Ok(ResponsePayload::Attributes(updated))
            }
            NamespaceOp::ListDirectory { pattern, range } => {
                self.execute_listing(request, pattern.as_deref(), range.clone())
                    .await
            }
            NamespaceOp::AddCacheLocation { pool } => {
                let id = self.resolve_id(request).await?;
                self.provider.add_cache_location(&id, pool).await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::ClearCacheLocation { pool } => {
                let id = self.resolve_id(request).await?;
                self.provider.clear_cache_location(&id, pool).await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::GetCacheLocations => {
                let id = self.resolve_id(request).await?;
                let locations = self.provider.get_cache_locations(&id).await?;
                Ok(ResponsePayload::Locations(locations))
            }
            NamespaceOp::MapPath => {
                let path = require_path(request)?;
                let id = self.provider.path_to_id(&request.subject, path, true).await?;
                self.update_path_cache(path, &id).await;
                Ok(ResponsePayload::Id(id))
            }
            NamespaceOp::GetParent => {
                let id = self.resolve_id(request).await?;
                let parent = self.provider.get_parent(&request.subject, &id).await?;
                Ok(ResponsePayload::Id(parent))
            }
            NamespaceOp::AddChecksum { checksum } => {
                let id = self.resolve_id(request).await?;
                self.provider.add_checksum(&id, checksum).await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::RemoveChecksum { kind } => {
                let id = self.resolve_id(request).await?;
                self.provider.remove_checksum(&id, kind).await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::GetChecksums => {
                let id = self.resolve_id(request).await?;
                let checksums = self.provider.get_checksums(&id).await?;
                Ok(ResponsePayload::Checksums(checksums))
            }
            NamespaceOp::SetFlag { key, value } => {
                let id = self.resolve_id(request).await?;
                self.provider.set_flag(&id, key, value).await?;
                Ok(ResponsePayload::Empty)
            }
            NamespaceOp::Flush { storage_class } => {
                let id = self.resolve_id(request).await?;
                let attrs = FileAttributes {
                    storage_class: Some(storage_class.clone()),
                    ..FileAttributes::default()
                };
                self.provider
                    .set_file_attributes(&request.subject, &id, &attrs)
                    .await?;
                Ok(ResponsePayload::Empty)
            }
        }
    }

    async fn execute_listing(
        &self,
        request: &NamespaceRequest,
        pattern: Option<&str>,
        range: Option<Range<u64>>,
    ) -> ClusterResult<ResponsePayload> {
        let path = require_path(request)?;
        let mut sink = BatchingSink::new(request, self.config.list_batch_size.max(1));
        self.provider
            .list(&request.subject, path, pattern, range, &mut sink)
            .await?;
        Ok(ResponsePayload::Listing(sink.take_remainder()))
    }

    async fn resolve_id(&self, request: &NamespaceRequest) -> ClusterResult<EntryId> {
        if let Some(id) = request.id {
            return Ok(id);
        }
        let path = request.path.as_ref().ok_or_else(|| {
            ClusterError::InvalidParam("no identifier or path defined".to_string())
        })?;
        let id = self.provider.path_to_id(&request.subject, path, true).await?;
        self.update_path_cache(path, &id).await;
        Ok(id)
    }

    /// Learns which subtree a database owns. Walks from the resolved path
    /// towards the root as long as the ancestors map to the same database
    /// id, then caches the highest such prefix. This amortizes shard
    /// resolution for the whole subtree.
    async fn update_path_cache(&self, path: &NsPath, id: &EntryId) {
        if self.config.worker_groups <= 1 {
            return;
        }
        let db = id.database_id();
        if self.path_cache.lookup(path) == Some(db) {
            return;
        }

        let mut prefix = path.clone();
        loop {
            let Some(parent) = prefix.parent() else {
                break;
            };
            match self.provider.path_to_id(&Subject::root(), &parent, true).await {
                Ok(parent_id) if parent_id.database_id() == db => prefix = parent,
                _ => break,
            }
        }
        debug!("path cache updated: {} -> {}", prefix, db);
        self.path_cache.insert(prefix, db);
    }

    fn record(&self, name: &'static str, update: impl FnOnce(&mut OpCounter)) {
        let mut counters = lock(&self.counters);
        update(counters.entry(name).or_default());
    }
}

impl Drop for NamespaceDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accumulates listing entries and flushes a partial reply whenever the
/// batch fills or half of the remaining adjusted TTL has been spent.
struct BatchingSink<'a> {
    request: &'a NamespaceRequest,
    batch: Vec<DirEntry>,
    batch_size: usize,
    flush_deadline: Instant,
}

impl<'a> BatchingSink<'a> {
    fn new(request: &'a NamespaceRequest, batch_size: usize) -> Self {
        Self {
            request,
            batch: Vec::new(),
            batch_size,
            flush_deadline: Self::next_deadline(request),
        }
    }

    fn next_deadline(request: &NamespaceRequest) -> Instant {
        let remaining = request
            .adjusted_ttl()
            .saturating_sub(request.created_at.elapsed());
        Instant::now() + remaining / 2
    }

    fn take_remainder(&mut self) -> Vec<DirEntry> {
        std::mem::take(&mut self.batch)
    }
}

impl ListSink for BatchingSink<'_> {
    fn accept(&mut self, entry: DirEntry) {
        self.batch.push(entry);
        if self.batch.len() >= self.batch_size || Instant::now() >= self.flush_deadline {
            let batch = std::mem::take(&mut self.batch);
            self.request
                .send_reply(NamespaceReply::partial(ResponsePayload::Listing(batch)));
            self.flush_deadline = Self::next_deadline(self.request);
        }
    }
}

fn require_path(request: &NamespaceRequest) -> ClusterResult<&NsPath> {
    request
        .path
        .as_ref()
        .ok_or_else(|| ClusterError::InvalidParam("no path defined".to_string()))
}

fn hash_of<T: Hash>(value: &T) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish() as usize
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
