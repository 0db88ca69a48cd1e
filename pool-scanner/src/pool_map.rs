use crate::operation::{NextAction, PoolScanOperation, ScanState};
use crate::task::PoolScanHandler;
use cluster_lib::{unix_timestamp_millis, ClusterError, PoolHealth, PoolStatusUpdate};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolScannerConfig {
    pub sweep_period_millis: u64,
    /// Dwell time before a DOWN pool is actually scanned.
    pub down_grace_millis: u64,
    /// Dwell time before a restarted (up) pool is scanned.
    pub restart_grace_millis: u64,
    /// Window after startup during which DOWN observations on an
    /// uninitialized pool are suppressed.
    pub initialization_grace_millis: u64,
    pub max_concurrent_running: usize,
    /// Watchdog window: idle pools are rescanned when their last scan is
    /// older than this.
    pub rescan_window_millis: u64,
    /// Running operations without progress for this long are considered
    /// stuck and recycled.
    pub max_running_idle_millis: u64,
    pub watchdog_enabled: bool,
    /// Recovery file preserving the excluded set across restarts.
    pub excluded_pools_file: Option<String>,
}

impl Default for PoolScannerConfig {
    fn default() -> Self {
        Self {
            sweep_period_millis: 60_000,
            down_grace_millis: 3_600_000,
            restart_grace_millis: 1_800_000,
            initialization_grace_millis: 300_000,
            max_concurrent_running: 5,
            rescan_window_millis: 86_400_000,
            max_running_idle_millis: 3_600_000,
            watchdog_enabled: true,
            excluded_pools_file: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Queue {
    Idle,
    Waiting,
    Running,
}

#[derive(Default)]
struct MapState {
    idle: HashMap<String, PoolScanOperation>,
    waiting: HashMap<String, PoolScanOperation>,
    running: HashMap<String, PoolScanOperation>,
}

impl MapState {
    fn take(&mut self, pool: &str) -> Option<(PoolScanOperation, Queue)> {
        if let Some(op) = self.running.remove(pool) {
            return Some((op, Queue::Running));
        }
        if let Some(op) = self.waiting.remove(pool) {
            return Some((op, Queue::Waiting));
        }
        self.idle.remove(pool).map(|op| (op, Queue::Idle))
    }

    fn put(&mut self, pool: String, op: PoolScanOperation, queue: Queue) {
        match queue {
            Queue::Idle => self.idle.insert(pool, op),
            Queue::Waiting => self.waiting.insert(pool, op),
            Queue::Running => self.running.insert(pool, op),
        };
    }

    fn contains(&self, pool: &str) -> bool {
        self.idle.contains_key(pool)
            || self.waiting.contains_key(pool)
            || self.running.contains_key(pool)
    }

    fn pools(&self) -> Vec<String> {
        self.idle
            .keys()
            .chain(self.waiting.keys())
            .chain(self.running.keys())
            .cloned()
            .collect()
    }
}

/// Maintains the idle, waiting and running queues of pool scan operations.
/// A periodic sweep promotes waiting operations as slots free up, recycles
/// stuck ones, and rescans idle pools whose last scan has grown stale. All
/// three queues live under one lock so every transition is atomic.
pub struct PoolScanOperationMap {
    config: PoolScannerConfig,
    state: Mutex<MapState>,
    handler: Arc<dyn PoolScanHandler>,
    run_now: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    completed_scans: AtomicU64,
    failed_scans: AtomicU64,
    cancelled_scans: AtomicU64,
}

impl PoolScanOperationMap {
    pub fn new(config: PoolScannerConfig, handler: Arc<dyn PoolScanHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(MapState::default()),
            handler,
            run_now: Notify::new(),
            sweeper: Mutex::new(None),
            completed_scans: AtomicU64::new(0),
            failed_scans: AtomicU64::new(0),
            cancelled_scans: AtomicU64::new(0),
        })
    }

    /// Starts the periodic sweep. Without it the map still works, driven
    /// by explicit `sweep` calls.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_period_millis.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let notified = async {
                    match weak.upgrade() {
                        Some(map) => map.run_now.notified().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified => {}
                }
                let Some(map) = weak.upgrade() else {
                    break;
                };
                map.sweep();
            }
            info!("pool scan sweeper finished");
        });
        *lock_opt(&self.sweeper) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = lock_opt(&self.sweeper).take() {
            handle.abort();
        }
    }

    /// Wakes the sweeper without waiting for the next tick.
    pub fn run_now(&self) {
        self.run_now.notify_one();
    }

    pub fn add_pool(&self, pool: &str) {
        let mut state = self.lock();
        if state.contains(pool) {
            return;
        }
        let now = unix_timestamp_millis();
        state.idle.insert(
            pool.to_string(),
            PoolScanOperation::new(self.config.initialization_grace_millis as i64, now),
        );
    }

    pub fn remove_pool(&self, pool: &str) {
        let mut state = self.lock();
        if let Some((op, queue)) = state.take(pool) {
            if queue == Queue::Running {
                if let Some(task) = &op.task {
                    task.cancel("pool no longer valid");
                }
            }
        }
    }

    /// Reconciles the map against the cluster's current pool set and
    /// reloads the persisted excluded set. Returns the pools that
    /// disappeared.
    pub fn load_pools(&self, current: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let state = self.lock();
            for pool in state.pools() {
                if !current.iter().any(|p| p == &pool) {
                    removed.push(pool);
                }
            }
        }
        for pool in &removed {
            self.remove_pool(pool);
        }
        for pool in current {
            self.add_pool(pool);
        }

        for pool in self.load_excluded_file() {
            self.set_included(&[pool], false);
        }
        removed
    }

    pub fn handle_pool_status_change(&self, update: &PoolStatusUpdate) {
        if update.status != PoolHealth::Uninitialized {
            self.update_status(update);
        }
    }

    /// Applies a pool status update through the transition table. An
    /// actionable change cancels any running scan for the pool and parks
    /// the operation on the waiting queue for the grace-period check.
    pub fn update_status(&self, update: &PoolStatusUpdate) {
        debug!("update status for {}: {}", update.pool, update.status.as_str());
        let now = unix_timestamp_millis();
        {
            let mut state = self.lock();
            let Some((mut op, queue)) = state.take(&update.pool) else {
                warn!("no entry for {} in any queue; pool is not (yet) registered", update.pool);
                return;
            };

            let action = op.next_action(update.status, now);
            if action == NextAction::Nop {
                state.put(update.pool.clone(), op, queue);
                return;
            }

            if op.state == ScanState::Running {
                if let Some(task) = op.task.take() {
                    task.cancel(&format!("pool {} changed", update.pool));
                }
                self.cancelled_scans.fetch_add(1, Ordering::Relaxed);
                self.handler.scan_cancelled(&update.pool, op.curr_status);
            }

            if op.state == ScanState::Waiting {
                debug!("{} already on the waiting queue", update.pool);
                state.put(update.pool.clone(), op, Queue::Waiting);
            } else {
                op.reset_children();
                op.reset_failed();
                op.last_update = now;
                op.state = ScanState::Waiting;
                op.error = None;
                op.task = None;
                state.put(update.pool.clone(), op, Queue::Waiting);
            }
        }
        self.run_now();
    }

    /// Ad hoc scan request from the admin surface. Ignores the grace
    /// periods (the force flag) but never overrides a running scan, an
    /// excluded pool, or - unless bypassed - a DOWN pool that was already
    /// scanned while down. Returns true when the pool was promoted to
    /// waiting.
    pub fn do_scan(&self, pool: &str, bypass_state_check: bool) -> bool {
        let now = unix_timestamp_millis();
        let mut state = self.lock();

        if state.running.contains_key(pool) {
            debug!("scan of {} is already in progress", pool);
            return false;
        }
        if let Some(op) = state.waiting.get_mut(pool) {
            debug!("scan of {} already waiting; forcing it", pool);
            op.force_scan = true;
            return false;
        }
        let Some(mut op) = state.idle.remove(pool) else {
            warn!("no entry for {} in any queue; pool is not (yet) registered", pool);
            return false;
        };

        if op.curr_status == PoolHealth::Uninitialized {
            info!("cannot scan {} - uninitialized", pool);
            self.reset_into_idle(&mut state, pool.to_string(), op, now);
            return false;
        }
        if op.is_excluded() {
            info!("skipping scan of {} - pool is excluded", pool);
            self.reset_into_idle(&mut state, pool.to_string(), op, now);
            return false;
        }
        if !bypass_state_check
            && op.curr_status == PoolHealth::Down
            && op.last_status == PoolHealth::Down
        {
            info!("skipping scan of {} - pool is down and was already scanned", pool);
            self.reset_into_idle(&mut state, pool.to_string(), op, now);
            return false;
        }

        op.force_scan = true;
        op.last_update = now;
        op.state = ScanState::Waiting;
        op.error = None;
        op.reset_failed();
        op.task = None;
        state.put(pool.to_string(), op, Queue::Waiting);
        true
    }

    /// Cancels matching waiting/running operations. Returns the count.
    pub fn cancel(&self, pools: &[String]) -> usize {
        let now = unix_timestamp_millis();
        let mut cancelled = 0;
        let mut state = self.lock();
        for pool in pools {
            let from_running = state.running.remove(pool.as_str());
            let op = match from_running.or_else(|| state.waiting.remove(pool.as_str())) {
                Some(op) => op,
                None => continue,
            };
            let mut op = op;
            if let Some(task) = op.task.take() {
                task.cancel("admin command");
            }
            op.state = ScanState::Canceled;
            self.cancelled_scans.fetch_add(1, Ordering::Relaxed);
            self.handler.scan_cancelled(pool, op.curr_status);
            self.reset_into_idle(&mut state, pool.clone(), op, now);
            cancelled += 1;
        }
        cancelled
    }

    /// Moves pools in or out of the Excluded state and persists the
    /// excluded set so a restart preserves operator intent. An included
    /// pool re-emerges as Uninitialized; the next status update decides
    /// whether anything is scanned.
    pub fn set_included(&self, pools: &[String], included: bool) -> usize {
        let now = unix_timestamp_millis();
        let mut visited = 0;
        {
            let mut state = self.lock();
            for pool in pools {
                let Some((mut op, queue)) = state.take(pool.as_str()) else {
                    continue;
                };
                if !included {
                    if let Some(task) = op.task.take() {
                        task.cancel("exclude admin command");
                    }
                    if queue == Queue::Running {
                        self.handler.scan_cancelled(pool, op.curr_status);
                    }
                    op.state = ScanState::Excluded;
                    op.force_scan = false;
                    op.reset_children();
                    op.last_update = now;
                    state.put(pool.clone(), op, Queue::Idle);
                    self.handler.pool_excluded(pool);
                    visited += 1;
                } else if op.is_excluded() {
                    op.state = ScanState::Idle;
                    op.curr_status = PoolHealth::Uninitialized;
                    op.last_status = PoolHealth::Uninitialized;
                    op.last_update = now;
                    state.put(pool.clone(), op, Queue::Idle);
                    self.handler.pool_included(pool);
                    visited += 1;
                } else {
                    state.put(pool.clone(), op, queue);
                }
            }
        }
        self.run_now();
        visited
    }

    /// Persists the excluded set to the recovery file. Called by the admin
    /// surface and at shutdown.
    pub fn save_excluded(&self) {
        self.save_excluded_file();
    }

    /// Progress report from a scan task: the number of child operations
    /// it spawned, or the error that ended it.
    pub fn update_children(&self, pool: &str, children: u32, error: Option<ClusterError>) {
        debug!("pool {} operation update, children {}", pool, children);
        let now = unix_timestamp_millis();
        let mut state = self.lock();
        let Some((mut op, queue)) = state.take(pool) else {
            return;
        };
        op.error = error;
        op.set_children(children);
        op.last_update = now;
        if children == 0 || op.is_complete() || op.error.is_some() {
            self.terminate(&mut state, pool.to_string(), op);
        } else {
            state.put(pool.to_string(), op, queue);
        }
    }

    /// Completion report for one child operation.
    pub fn update_completed(&self, pool: &str, failed: bool) {
        debug!("parent {}, child operation has completed", pool);
        let now = unix_timestamp_millis();
        let mut state = self.lock();
        let Some((mut op, queue)) = state.take(pool) else {
            return;
        };
        op.increment_completed(failed, now);
        if op.is_complete() {
            self.terminate(&mut state, pool.to_string(), op);
        } else {
            state.put(pool.to_string(), op, queue);
        }
    }

    /// One pass over the three queues: idle watchdog, waiting promotion,
    /// stuck running recovery.
    pub fn sweep(&self) {
        let now = unix_timestamp_millis();
        let mut state = self.lock();
        self.sweep_idle(&mut state, now);
        self.sweep_waiting(&mut state, now);
        self.sweep_running(&mut state, now);
    }

    pub fn state_of(&self, pool: &str) -> Option<ScanState> {
        let state = self.lock();
        state
            .running
            .get(pool)
            .or_else(|| state.waiting.get(pool))
            .or_else(|| state.idle.get(pool))
            .map(|op| op.state)
    }

    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.idle.len(), state.waiting.len(), state.running.len())
    }

    /// Admin listing of every operation, running first.
    pub fn list_operations(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for (label, queue) in [
            ("running", &state.running),
            ("waiting", &state.waiting),
            ("idle", &state.idle),
        ] {
            let mut pools: Vec<_> = queue.keys().collect();
            pools.sort();
            for pool in pools {
                out.push_str(&format!("{}\t{}\t{}\n", label, pool, queue[pool]));
            }
        }
        if out.is_empty() {
            out.push_str("NO OPERATIONS.\n");
        }
        out
    }

    pub fn config_settings(&self) -> String {
        format!(
            "down grace period {} ms\nrestart grace period {} ms\nmax concurrent operations {}\nrescan window {} ms\nsweep period {} ms\n",
            self.config.down_grace_millis,
            self.config.restart_grace_millis,
            self.config.max_concurrent_running,
            self.config.rescan_window_millis,
            self.config.sweep_period_millis
        )
    }

    // ---- internals -----------------------------------------------------

    fn sweep_idle(&self, state: &mut MapState, now: i64) {
        if !self.config.watchdog_enabled {
            return;
        }
        let window = self.config.rescan_window_millis as i64;
        let due: Vec<String> = state
            .idle
            .iter()
            .filter(|(_, op)| {
                !op.is_excluded()
                    && op.curr_status != PoolHealth::Uninitialized
                    && !(op.curr_status == PoolHealth::Down && op.last_status == PoolHealth::Down)
                    && now - op.last_scan >= window
            })
            .map(|(pool, _)| pool.clone())
            .collect();
        for pool in due {
            if let Some(mut op) = state.idle.remove(&pool) {
                op.force_scan = true;
                op.state = ScanState::Waiting;
                op.reset_failed();
                op.error = None;
                op.last_update = now;
                state.put(pool, op, Queue::Waiting);
            }
        }
    }

    fn sweep_waiting(&self, state: &mut MapState, now: i64) {
        let down_grace = self.config.down_grace_millis as i64;
        let restart_grace = self.config.restart_grace_millis as i64;
        let due: Vec<String> = state
            .waiting
            .iter()
            .filter(|(_, op)| {
                let grace = if op.curr_status == PoolHealth::Down {
                    down_grace
                } else {
                    restart_grace
                };
                op.force_scan || now - op.last_update >= grace
            })
            .map(|(pool, _)| pool.clone())
            .collect();

        for pool in due {
            if state.running.len() >= self.config.max_concurrent_running {
                break;
            }
            let Some(mut op) = state.waiting.remove(&pool) else {
                continue;
            };
            debug!(
                "promoting {}, lapsed {} ms, running {}",
                pool,
                now - op.last_update,
                state.running.len()
            );
            op.task = Some(self.handler.launch_scan(&pool, op.curr_status, op.force_scan));
            op.state = ScanState::Running;
            op.last_update = now;
            op.last_status = op.curr_status;
            state.put(pool, op, Queue::Running);
        }
    }

    fn sweep_running(&self, state: &mut MapState, now: i64) {
        let max_idle = self.config.max_running_idle_millis as i64;
        let stuck: Vec<String> = state
            .running
            .iter()
            .filter(|(_, op)| now - op.last_update >= max_idle)
            .map(|(pool, _)| pool.clone())
            .collect();
        for pool in stuck {
            let Some(mut op) = state.running.remove(&pool) else {
                continue;
            };
            warn!("scan of {} made no progress for {} ms, recycling", pool, max_idle);
            if let Some(task) = op.task.take() {
                task.cancel("no progress");
            }
            op.state = ScanState::Canceled;
            self.cancelled_scans.fetch_add(1, Ordering::Relaxed);
            self.handler.scan_cancelled(&pool, op.curr_status);
            self.reset_into_idle(state, pool, op, now);
        }
    }

    fn terminate(&self, state: &mut MapState, pool: String, mut op: PoolScanOperation) {
        debug!("terminate, pool {}, {}", pool, op);
        if op.error.is_some() {
            op.state = ScanState::Failed;
            self.failed_scans.fetch_add(1, Ordering::Relaxed);
            error!(
                "scan of {} failed: {}",
                pool,
                op.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
            );
        } else {
            op.state = ScanState::Idle;
            self.completed_scans.fetch_add(1, Ordering::Relaxed);
        }
        op.task = None;
        op.last_scan = op.last_update;
        let now = unix_timestamp_millis();
        self.reset_into_idle(state, pool, op, now);
    }

    fn reset_into_idle(&self, state: &mut MapState, pool: String, mut op: PoolScanOperation, now: i64) {
        op.last_update = now;
        op.force_scan = false;
        op.reset_children();
        op.task = None;
        state.put(pool, op, Queue::Idle);
    }

    fn save_excluded_file(&self) {
        let Some(path) = &self.config.excluded_pools_file else {
            return;
        };
        let excluded: Vec<String> = {
            let state = self.lock();
            state
                .idle
                .iter()
                .filter(|(_, op)| op.is_excluded())
                .map(|(pool, _)| pool.clone())
                .collect()
        };
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(path)?;
            for pool in &excluded {
                writeln!(file, "{}", pool)?;
            }
            Ok(())
        };
        if let Err(e) = write() {
            error!("unable to save excluded pools file {}: {}", path, e);
        }
    }

    /// Reads the persisted excluded set, deleting the file afterwards.
    fn load_excluded_file(&self) -> Vec<String> {
        let Some(path) = &self.config.excluded_pools_file else {
            return Vec::new();
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!("unable to reload excluded pools file {}: {}", path, e);
                return Vec::new();
            }
        };
        if let Err(e) = std::fs::remove_file(path) {
            error!("unable to delete {}: {}", path, e);
        }
        content
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MapState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn lock_opt<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ScanTaskHandle;
    use std::sync::atomic::AtomicUsize;

    struct MockHandler {
        launches: AtomicUsize,
        cancels: AtomicUsize,
        excluded: Mutex<Vec<String>>,
        included: Mutex<Vec<String>>,
    }

    impl MockHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                excluded: Mutex::new(Vec::new()),
                included: Mutex::new(Vec::new()),
            })
        }
    }

    impl PoolScanHandler for MockHandler {
        fn launch_scan(&self, _pool: &str, _status: PoolHealth, _force: bool) -> ScanTaskHandle {
            self.launches.fetch_add(1, Ordering::SeqCst);
            ScanTaskHandle::spawn(|flag| async move {
                while !flag.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        }

        fn scan_cancelled(&self, _pool: &str, _status: PoolHealth) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn pool_excluded(&self, pool: &str) {
            self.excluded.lock().unwrap().push(pool.to_string());
        }

        fn pool_included(&self, pool: &str) {
            self.included.lock().unwrap().push(pool.to_string());
        }
    }

    fn test_config() -> PoolScannerConfig {
        PoolScannerConfig {
            sweep_period_millis: 3_600_000,
            down_grace_millis: 0,
            restart_grace_millis: 0,
            initialization_grace_millis: 0,
            max_concurrent_running: 5,
            rescan_window_millis: 86_400_000,
            max_running_idle_millis: 3_600_000,
            watchdog_enabled: true,
            excluded_pools_file: None,
        }
    }

    fn bring_up(map: &Arc<PoolScanOperationMap>, pool: &str) {
        map.add_pool(pool);
        map.update_status(&PoolStatusUpdate::new(pool, PoolHealth::Enabled));
    }

    #[tokio::test]
    async fn test_down_promotes_through_waiting_to_running() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        bring_up(&map, "pool-a");
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Idle));

        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Waiting));

        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));
        assert_eq!(handler.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_concurrent_running_bounds_promotion() {
        // Scenario: two pools go waiting at once, one slot available.
        let handler = MockHandler::new();
        let config = PoolScannerConfig {
            max_concurrent_running: 1,
            ..test_config()
        };
        let map = PoolScanOperationMap::new(config, handler.clone());

        bring_up(&map, "pool-a");
        bring_up(&map, "pool-b");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.update_status(&PoolStatusUpdate::new("pool-b", PoolHealth::Down));

        map.sweep();
        let (_, waiting, running) = map.queue_lengths();
        assert_eq!(running, 1);
        assert_eq!(waiting, 1);

        // Completing the running scan frees the slot.
        let running_pool = if map.state_of("pool-a") == Some(ScanState::Running) {
            "pool-a"
        } else {
            "pool-b"
        };
        map.update_children(running_pool, 1, None);
        map.update_completed(running_pool, false);

        map.sweep();
        let (_, waiting, running) = map.queue_lengths();
        assert_eq!(running, 1);
        assert_eq!(waiting, 0);
        assert_eq!(handler.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flapping_pool_scans_once() {
        // ENABLED -> DOWN -> ENABLED inside the grace period must produce
        // at most one promoted scan.
        let handler = MockHandler::new();
        let config = PoolScannerConfig {
            down_grace_millis: 3_600_000,
            restart_grace_millis: 0,
            ..test_config()
        };
        let map = PoolScanOperationMap::new(config, handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Enabled));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Waiting));

        map.sweep();
        map.sweep();
        assert_eq!(handler.launches.load(Ordering::SeqCst), 1);
        let (_, waiting, running) = map.queue_lengths();
        assert_eq!(running, 1);
        assert_eq!(waiting, 0);
    }

    #[tokio::test]
    async fn test_status_change_cancels_running_scan() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));

        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Enabled));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Waiting));
        assert_eq!(handler.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_failure_records_error() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.sweep();

        map.update_children(
            "pool-a",
            3,
            Some(ClusterError::Timeout("pool did not answer".to_string())),
        );
        // Back to idle via the Failed terminal bookkeeping.
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Failed));
        assert_eq!(map.failed_scans.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stuck_running_scan_is_recycled() {
        let handler = MockHandler::new();
        let config = PoolScannerConfig {
            max_running_idle_millis: 100,
            ..test_config()
        };
        let map = PoolScanOperationMap::new(config, handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));

        // The next sweep finds the scan has made no progress at all.
        tokio::time::sleep(Duration::from_millis(150)).await;
        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Canceled));
        assert_eq!(handler.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_do_scan_force_and_refusals() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        map.add_pool("pool-a");
        // Uninitialized pools are never force-scanned.
        assert!(!map.do_scan("pool-a", false));

        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Enabled));
        assert!(map.do_scan("pool-a", false));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Waiting));

        // Already waiting: only the force flag is touched.
        assert!(!map.do_scan("pool-a", false));

        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));
        // Running scans are not restarted.
        assert!(!map.do_scan("pool-a", false));

        // Unregistered pools are refused.
        assert!(!map.do_scan("nope", true));
    }

    #[tokio::test]
    async fn test_down_pool_not_rescanned_without_bypass() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.sweep();
        map.update_children("pool-a", 1, None);
        map.update_completed("pool-a", false);
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Idle));

        // Still down, already scanned down: refused without bypass.
        assert!(!map.do_scan("pool-a", false));
        assert!(map.do_scan("pool-a", true));
    }

    #[tokio::test]
    async fn test_exclude_include_cycle() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());

        bring_up(&map, "pool-a");
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));

        assert_eq!(map.set_included(&["pool-a".to_string()], false), 1);
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Excluded));
        assert_eq!(handler.excluded.lock().unwrap().len(), 1);

        // Status updates are recorded but never acted upon while excluded.
        map.update_status(&PoolStatusUpdate::new("pool-a", PoolHealth::Down));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Excluded));

        assert_eq!(map.set_included(&["pool-a".to_string()], true), 1);
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Idle));
        assert_eq!(handler.included.lock().unwrap().len(), 1);
        // Re-emerges uninitialized: nothing is scanned until a status
        // update arrives.
        map.sweep();
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Idle));
    }

    #[tokio::test]
    async fn test_excluded_set_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir
            .path()
            .join("excluded")
            .to_string_lossy()
            .to_string();
        let config = PoolScannerConfig {
            excluded_pools_file: Some(file.clone()),
            ..test_config()
        };

        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(config.clone(), handler.clone());
        map.add_pool("pool-a");
        map.add_pool("pool-b");
        map.set_included(&["pool-b".to_string()], false);
        map.save_excluded();
        drop(map);

        // A fresh map (restart) reloads the excluded set from the file.
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(config, handler.clone());
        let removed = map.load_pools(&["pool-a".to_string(), "pool-b".to_string()]);
        assert!(removed.is_empty());
        assert_eq!(map.state_of("pool-b"), Some(ScanState::Excluded));
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Idle));
        // The recovery file is consumed on load.
        assert!(!std::path::Path::new(&file).exists());
    }

    #[tokio::test]
    async fn test_load_pools_reports_removed() {
        let handler = MockHandler::new();
        let map = PoolScanOperationMap::new(test_config(), handler.clone());
        map.add_pool("old-pool");
        let removed = map.load_pools(&["new-pool".to_string()]);
        assert_eq!(removed, vec!["old-pool".to_string()]);
        assert_eq!(map.state_of("old-pool"), None);
        assert_eq!(map.state_of("new-pool"), Some(ScanState::Idle));
    }

    #[tokio::test]
    async fn test_idle_watchdog_rescans_stale_pools() {
        let handler = MockHandler::new();
        let config = PoolScannerConfig {
            rescan_window_millis: 0,
            ..test_config()
        };
        let map = PoolScanOperationMap::new(config, handler.clone());

        bring_up(&map, "pool-a");
        map.sweep();
        // The idle pass promoted and the waiting pass launched in the same
        // sweep (force flag set by the watchdog).
        assert_eq!(map.state_of("pool-a"), Some(ScanState::Running));
        assert_eq!(handler.launches.load(Ordering::SeqCst), 1);
    }
}
