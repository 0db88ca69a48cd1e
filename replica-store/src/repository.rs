use crate::account::{Account, SpaceRecord};
use crate::client::NamespaceClient;
use crate::handle::{ReadHandle, WriteHandle};
use crate::record::ReplicaRecord;
use crate::state::{ReplicaState, StickyRecord};
use cluster_lib::{unix_timestamp_millis, ClusterError, ClusterResult, EntryId};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Extra delay added to sticky expiry tasks to absorb small clock shifts.
const DEFAULT_EXPIRY_CLOCK_SHIFT_MILLIS: u64 = 1000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub pool_name: String,
    /// On volatile pools, clearing the last cache location also deletes the
    /// namespace entry.
    pub volatile: bool,
    pub expiry_clock_shift_millis: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            pool_name: "pool-0".to_string(),
            volatile: false,
            expiry_clock_shift_millis: DEFAULT_EXPIRY_CLOCK_SHIFT_MILLIS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub id: EntryId,
    pub old_state: ReplicaState,
    pub new_state: ReplicaState,
}

/// Observer of repository lifecycle events (sweeper, QoS handler, ...).
/// Called outside the record lock; implementations must not call back into
/// the repository synchronously.
pub trait ReplicaStateListener: Send + Sync {
    fn state_changed(&self, event: &StateChangeEvent);
    fn sticky_changed(&self, id: &EntryId);
}

/// Owns the replica records of one pool together with its space account.
/// Records are individually locked so unrelated replicas never contend; the
/// entries map has its own lock and the two are never held at once.
pub struct ReplicaRepository {
    config: RepositoryConfig,
    account: Arc<Account>,
    client: Arc<dyn NamespaceClient>,
    entries: Mutex<HashMap<EntryId, Arc<Mutex<ReplicaRecord>>>>,
    listeners: Mutex<Vec<Arc<dyn ReplicaStateListener>>>,
    expiry_tasks: Mutex<HashMap<EntryId, JoinHandle<()>>>,
}

impl ReplicaRepository {
    pub fn new(
        config: RepositoryConfig,
        account: Arc<Account>,
        client: Arc<dyn NamespaceClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            account,
            client,
            entries: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            expiry_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    pub(crate) fn client(&self) -> &Arc<dyn NamespaceClient> {
        &self.client
    }

    pub fn pool_name(&self) -> &str {
        &self.config.pool_name
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplicaStateListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn space_record(&self) -> SpaceRecord {
        self.account.space_record()
    }

    pub fn ids(&self) -> Vec<EntryId> {
        lock(&self.entries).keys().copied().collect()
    }

    /// Snapshot of one record, mainly for inspection and tests.
    pub fn entry(&self, id: &EntryId) -> Option<ReplicaRecord> {
        let record = self.get_record(id)?;
        let guard = lock(&record);
        Some(guard.clone())
    }

    /// State query that treats unknown ids as New, so callers can probe
    /// without special-casing missing entries.
    pub fn get_state(&self, id: &EntryId) -> ReplicaState {
        match self.entry(id) {
            Some(record) => record.state,
            None => ReplicaState::New,
        }
    }

    /// Creates a new entry and returns the write handle bound to its
    /// allocation. A duplicate id means somebody upstream thinks we do not
    /// have the file, so the location record is re-registered before the
    /// error surfaces.
    pub async fn create_entry(
        self: &Arc<Self>,
        id: EntryId,
        storage_class: impl Into<String>,
        transfer_state: ReplicaState,
        target_state: ReplicaState,
        sticky: Vec<StickyRecord>,
        initial_allocation: u64,
    ) -> ClusterResult<WriteHandle> {
        if !transfer_state.is_receiving() {
            return Err(ClusterError::InvalidParam(format!(
                "invalid transfer state {}",
                transfer_state
            )));
        }
        if !matches!(
            target_state,
            ReplicaState::Cached | ReplicaState::Precious
        ) {
            return Err(ClusterError::InvalidParam(format!(
                "invalid target state {}",
                target_state
            )));
        }

        if self.get_record(&id).is_some() {
            self.spawn_add_location(id);
            return Err(ClusterError::AlreadyExists(format!(
                "entry already exists: {}",
                id
            )));
        }

        self.account.allocate(initial_allocation).await;

        let now = unix_timestamp_millis();
        let mut record = ReplicaRecord::new(id, storage_class, now);
        record.state = transfer_state;
        record.sticky = sticky;
        let record = Arc::new(Mutex::new(record));

        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(&id) {
                // Lost a creation race; give the space back.
                drop(entries);
                if let Err(e) = self.account.free(initial_allocation) {
                    warn!("failed to release allocation for {}: {}", id, e);
                }
                self.spawn_add_location(id);
                return Err(ClusterError::AlreadyExists(format!(
                    "entry already exists: {}",
                    id
                )));
            }
            entries.insert(id, record);
        }

        info!("created entry {} in state {}", id, transfer_state);
        self.notify_state(&StateChangeEvent {
            id,
            old_state: ReplicaState::New,
            new_state: transfer_state,
        });
        self.reschedule_expiry(&id);

        Ok(WriteHandle::new(
            self.clone(),
            id,
            target_state,
            initial_allocation,
        ))
    }

    /// Registers a replica discovered on disk at pool startup. The bytes
    /// already exist, so total and used grow together instead of going
    /// through allocation.
    pub fn register_existing(
        self: &Arc<Self>,
        id: EntryId,
        storage_class: impl Into<String>,
        state: ReplicaState,
        size: u64,
        sticky: Vec<StickyRecord>,
    ) -> ClusterResult<()> {
        if matches!(state, ReplicaState::New | ReplicaState::Destroyed) {
            return Err(ClusterError::InvalidParam(format!(
                "cannot register inventory in state {}",
                state
            )));
        }
        let now = unix_timestamp_millis();
        let mut record = ReplicaRecord::new(id, storage_class, now);
        record.state = state;
        record.size = size;
        record.sticky = sticky;

        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(&id) {
                return Err(ClusterError::AlreadyExists(format!(
                    "entry already exists: {}",
                    id
                )));
            }
            self.account.grow_total_and_used(size);
            if record.state.counts_as_precious() {
                self.account.adjust_precious(size as i64);
            }
            if record.is_removable_at(now) {
                self.account.adjust_removable(size as i64);
            }
            entries.insert(id, Arc::new(Mutex::new(record)));
        }
        self.reschedule_expiry(&id);
        Ok(())
    }

    /// Opens an entry for reading. Removed entries remain openable until
    /// they are destroyed; in-flight readers must not be starved by a
    /// pending deletion. A missing entry triggers a best-effort clear of
    /// the stale location record upstream before the error surfaces.
    pub fn open_entry(self: &Arc<Self>, id: &EntryId) -> ClusterResult<ReadHandle> {
        let record = match self.get_record(id) {
            Some(record) => record,
            None => {
                self.spawn_clear_location(*id);
                return Err(ClusterError::NotFound(format!("entry not found: {}", id)));
            }
        };

        let now = unix_timestamp_millis();
        {
            let mut guard = lock(&record);
            match guard.state {
                ReplicaState::New
                | ReplicaState::ReceivingFromClient
                | ReplicaState::ReceivingFromStore => {
                    return Err(ClusterError::Locked(format!("file is incomplete: {}", id)));
                }
                ReplicaState::Destroyed => {
                    return Err(ClusterError::NotFound(format!(
                        "entry has been removed: {}",
                        id
                    )));
                }
                ReplicaState::Cached
                | ReplicaState::Precious
                | ReplicaState::SendingToStore
                | ReplicaState::Removed => {}
            }
            if guard.broken {
                return Err(ClusterError::Broken(format!("file is broken: {}", id)));
            }
            guard.link_count += 1;
            guard.touch(now);
        }

        Ok(ReadHandle::new(self.clone(), *id))
    }

    /// Applies one lifecycle transition. Re-entering the current state is a
    /// no-op with zero space delta; illegal transitions surface as typed
    /// errors and never touch the accounting.
    pub fn set_state(self: &Arc<Self>, id: &EntryId, target: ReplicaState) -> ClusterResult<()> {
        let record = match self.get_record(id) {
            Some(record) => record,
            None => {
                if target == ReplicaState::Removed {
                    // File is gone or never existed; that is all removal
                    // wanted anyway.
                    return Ok(());
                }
                return Err(ClusterError::illegal_transition(
                    ReplicaState::New,
                    target,
                    format!("entry not found: {}", id),
                ));
            }
        };

        let now = unix_timestamp_millis();
        let event;
        let mut destroy_now = false;
        {
            let mut guard = lock(&record);
            let source = guard.state;
            if source == target {
                debug!("{}: {} -> {} is a no-op", id, source, target);
                return Ok(());
            }
            if !source.can_transition_to(target) {
                return Err(ClusterError::illegal_transition(
                    source,
                    target,
                    id.to_string(),
                ));
            }

            let size = guard.size as i64;
            let was_precious = source.counts_as_precious();
            let was_removable = guard.is_removable_at(now);
            guard.state = target;
            let is_precious = guard.state.counts_as_precious();
            let is_removable = guard.is_removable_at(now);

            if was_precious != is_precious {
                self.account
                    .adjust_precious(if is_precious { size } else { -size });
            }
            if was_removable != is_removable {
                self.account
                    .adjust_removable(if is_removable { size } else { -size });
            }

            if target == ReplicaState::Removed && guard.link_count == 0 {
                destroy_now = true;
            }
            event = StateChangeEvent {
                id: *id,
                old_state: source,
                new_state: target,
            };
        }

        self.notify_state(&event);

        if target == ReplicaState::Removed {
            info!("remove entry for: {}", id);
            self.cancel_expiry(id);
            self.spawn_clear_location(*id);
            if destroy_now {
                self.destroy_entry(id);
            }
        }

        Ok(())
    }

    /// Sets or clears the orthogonal broken marker. The underlying state is
    /// untouched; returning to Precious later does not clear the flag.
    pub fn set_broken(&self, id: &EntryId, broken: bool) -> ClusterResult<()> {
        let record = self
            .get_record(id)
            .ok_or_else(|| ClusterError::NotFound(format!("entry not found: {}", id)))?;
        let now = unix_timestamp_millis();
        let mut guard = lock(&record);
        if guard.broken == broken {
            return Ok(());
        }
        let was_removable = guard.is_removable_at(now);
        guard.broken = broken;
        let is_removable = guard.is_removable_at(now);
        if was_removable != is_removable {
            let size = guard.size as i64;
            self.account
                .adjust_removable(if is_removable { size } else { -size });
        }
        if broken {
            warn!("marking {} broken in state {}", id, guard.state);
        }
        Ok(())
    }

    /// Sticky marks may be applied as soon as data starts arriving, well
    /// before the replica is Cached; the window where a fresh file could be
    /// collected before anyone pins it must stay closed.
    pub fn set_sticky(
        self: &Arc<Self>,
        id: &EntryId,
        owner: &str,
        expires_at: i64,
        overwrite: bool,
    ) -> ClusterResult<()> {
        if expires_at < -1 {
            return Err(ClusterError::InvalidParam(format!(
                "sticky lifetime must be -1 or non-negative, got {}",
                expires_at
            )));
        }
        let record = match self.get_record(id) {
            Some(record) => record,
            None => {
                self.spawn_clear_location(*id);
                return Err(ClusterError::NotFound(format!("entry not found: {}", id)));
            }
        };

        let now = unix_timestamp_millis();
        {
            let mut guard = lock(&record);
            match guard.state {
                ReplicaState::New => {
                    return Err(ClusterError::Locked(format!("file is incomplete: {}", id)))
                }
                ReplicaState::Removed | ReplicaState::Destroyed => {
                    return Err(ClusterError::NotFound(format!(
                        "entry has been removed: {}",
                        id
                    )))
                }
                _ => {}
            }

            let was_removable = guard.is_removable_at(now);
            if !guard.set_sticky(owner, expires_at, overwrite, now) {
                return Err(ClusterError::AlreadyExists(format!(
                    "sticky record for owner {} already present on {}",
                    owner, id
                )));
            }
            let is_removable = guard.is_removable_at(now);
            if was_removable != is_removable {
                let size = guard.size as i64;
                self.account
                    .adjust_removable(if is_removable { size } else { -size });
            }
        }

        self.reschedule_expiry(id);
        self.notify_sticky(id);
        Ok(())
    }

    pub fn is_sticky(&self, id: &EntryId) -> bool {
        match self.get_record(id) {
            Some(record) => lock(&record).is_sticky_at(unix_timestamp_millis()),
            None => false,
        }
    }

    // ---- internals -----------------------------------------------------

    pub(crate) fn get_record(&self, id: &EntryId) -> Option<Arc<Mutex<ReplicaRecord>>> {
        lock(&self.entries).get(id).cloned()
    }

    pub(crate) fn set_size(&self, id: &EntryId, size: u64) {
        if let Some(record) = self.get_record(id) {
            lock(&record).size = size;
        }
    }

    /// Called when a read handle closes. The last reader of a Removed entry
    /// performs the deferred destruction.
    pub(crate) fn release_read(&self, id: &EntryId) {
        let record = match self.get_record(id) {
            Some(record) => record,
            None => return,
        };
        let destroy = {
            let mut guard = lock(&record);
            guard.link_count = guard.link_count.saturating_sub(1);
            guard.state == ReplicaState::Removed && guard.link_count == 0
        };
        if destroy {
            self.destroy_entry(id);
        }
    }

    /// Abort path for uncommitted writes: release the reservation and mark
    /// the half-written entry Removed so the GC picks it up.
    pub(crate) fn abort_write(self: &Arc<Self>, id: &EntryId, allocated: u64) {
        if allocated > 0 {
            if let Err(e) = self.account.free(allocated) {
                warn!("failed to release aborted allocation for {}: {}", id, e);
            }
        }
        if let Err(e) = self.set_state(id, ReplicaState::Removed) {
            warn!("failed to remove aborted entry {}: {}", id, e);
        }
    }

    fn destroy_entry(&self, id: &EntryId) {
        let record = match self.get_record(id) {
            Some(record) => record,
            None => return,
        };
        let (old_state, size) = {
            let mut guard = lock(&record);
            let old = guard.state;
            guard.state = ReplicaState::Destroyed;
            (old, guard.size)
        };
        lock(&self.entries).remove(id);
        self.cancel_expiry(id);

        // Free after the entry is gone from the map: nothing may exist on
        // disk that the account does not know about.
        if size > 0 {
            if let Err(e) = self.account.free(size) {
                warn!("space accounting diverged while destroying {}: {}", id, e);
            }
        }

        debug!("destroyed entry {}", id);
        self.notify_state(&StateChangeEvent {
            id: *id,
            old_state,
            new_state: ReplicaState::Destroyed,
        });
    }

    fn notify_state(&self, event: &StateChangeEvent) {
        let listeners: Vec<_> = lock(&self.listeners).iter().cloned().collect();
        for listener in listeners {
            listener.state_changed(event);
        }
    }

    fn notify_sticky(&self, id: &EntryId) {
        let listeners: Vec<_> = lock(&self.listeners).iter().cloned().collect();
        for listener in listeners {
            listener.sticky_changed(id);
        }
    }

    /// Re-arms the clock-driven expiry check for the earliest finite sticky
    /// lifetime on the entry. The task fires a little late on purpose to
    /// absorb clock shifts; expiry itself is still decided lazily.
    fn reschedule_expiry(self: &Arc<Self>, id: &EntryId) {
        self.cancel_expiry(id);

        let next = match self.get_record(id) {
            Some(record) => lock(&record).next_sticky_expiry(),
            None => None,
        };
        let Some(expires_at) = next else {
            return;
        };

        let now = unix_timestamp_millis();
        let delay = (expires_at - now).max(0) as u64 + self.config.expiry_clock_shift_millis;
        let repo = self.clone();
        let id = *id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            repo.expire_sticky(&id);
        });
        lock(&self.expiry_tasks).insert(id, task);
    }

    fn expire_sticky(self: &Arc<Self>, id: &EntryId) {
        lock(&self.expiry_tasks).remove(id);
        let record = match self.get_record(id) {
            Some(record) => record,
            None => return,
        };
        let now = unix_timestamp_millis();
        let expired = {
            let mut guard = lock(&record);
            let was_removable = guard.is_removable_at(now);
            let expired = guard.remove_expired_sticky(now);
            let is_removable = guard.is_removable_at(now);
            if was_removable != is_removable {
                let size = guard.size as i64;
                self.account
                    .adjust_removable(if is_removable { size } else { -size });
            }
            expired
        };
        if !expired.is_empty() {
            debug!("expired {} sticky records on {}", expired.len(), id);
            self.notify_sticky(id);
        }
        self.reschedule_expiry(id);
    }

    fn cancel_expiry(&self, id: &EntryId) {
        if let Some(task) = lock(&self.expiry_tasks).remove(id) {
            task.abort();
        }
    }

    pub(crate) fn spawn_clear_location(&self, id: EntryId) {
        let client = self.client.clone();
        let pool = self.config.pool_name.clone();
        let volatile = self.config.volatile;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = client.clear_cache_location(&id, &pool, volatile).await {
                warn!("failed to clear cache location for {}: {}", id, e);
            }
        });
    }

    fn spawn_add_location(&self, id: EntryId) {
        let client = self.client.clone();
        let pool = self.config.pool_name.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = client.add_cache_location(&id, &pool).await {
                warn!("failed to register cache location for {}: {}", id, e);
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
