use cluster_lib::NsPath;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Default maximum number of cached prefixes.
const DEFAULT_CAPACITY: usize = 10000;

struct CacheInner {
    map: HashMap<NsPath, u32>,
    /// Insertion order for capacity eviction (oldest at the front). A
    /// refreshed prefix keeps its slot; eviction is strictly by insertion
    /// age, not access order.
    order: VecDeque<NsPath>,
    capacity: usize,
}

/// Maps path prefixes to the database (partition) id owning that subtree.
/// Populated lazily as paths resolve; a conflicting id refreshes the
/// existing entry instead of stacking a stale duplicate next to it.
pub struct PathShardCache {
    inner: Mutex<CacheInner>,
}

impl Default for PathShardCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PathShardCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    /// Database id of the longest cached prefix of `path`, if any.
    pub fn lookup(&self, path: &NsPath) -> Option<u32> {
        let inner = self.lock();
        if inner.map.is_empty() {
            return None;
        }

        let mut probe = NsPath::root();
        let mut best = inner.map.get(&probe).copied();
        for component in path.components() {
            probe = probe.join(component);
            if let Some(db) = inner.map.get(&probe) {
                best = Some(*db);
            }
        }
        best
    }

    /// Caches `prefix -> db`. An existing entry is refreshed in place; a
    /// new entry may evict the oldest one when the cache is full.
    pub fn insert(&self, prefix: NsPath, db: u32) {
        let mut inner = self.lock();
        if let Some(existing) = inner.map.get_mut(&prefix) {
            *existing = db;
            return;
        }
        if inner.capacity > 0 && inner.map.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(prefix.clone(), db);
        inner.order.push_back(prefix);
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
