use crate::operation::SystemScanOperation;
use crate::task::SystemScanHandler;
use cluster_lib::{unix_timestamp_millis, ClusterError, ClusterResult};
use log::{info, warn};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SystemScannerConfig {
    pub sweep_period_millis: u64,
    pub online_batch_size: u64,
    pub nearline_batch_size: u64,
    /// Concurrent shards per category; also the stride when advancing to
    /// the next shard range.
    pub max_concurrent_running: usize,
    pub online_rescan_window_millis: u64,
    pub nearline_rescan_window_millis: u64,
    /// Nearline scanning walks the entire tape-backed namespace, which is
    /// far larger and slower than the online subset, so it is opt-in.
    pub nearline_enabled: bool,
    pub history_capacity: usize,
}

impl Default for SystemScannerConfig {
    fn default() -> Self {
        Self {
            sweep_period_millis: 60_000,
            online_batch_size: 200_000,
            nearline_batch_size: 500_000,
            max_concurrent_running: 3,
            online_rescan_window_millis: 86_400_000,
            nearline_rescan_window_millis: 172_800_000,
            nearline_enabled: false,
            history_capacity: 100,
        }
    }
}

struct SysState {
    online: HashMap<String, SystemScanOperation>,
    nearline: HashMap<String, SystemScanOperation>,
    online_running: bool,
    nearline_running: bool,
    last_online_start: i64,
    last_online_end: i64,
    last_nearline_start: i64,
    last_nearline_end: i64,
    history: VecDeque<String>,
}

/// Shards the namespace index space into fixed-size batches and keeps up to
/// `max_concurrent_running` shards per category in flight, advancing each
/// completed shard by the full stride until the end of the index space.
/// A category does not restart until its rescan window has passed since the
/// previous pass ended.
pub struct SystemScanOperationMap {
    config: SystemScannerConfig,
    state: Mutex<SysState>,
    handler: Arc<dyn SystemScanHandler>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SystemScanOperationMap {
    pub fn new(config: SystemScannerConfig, handler: Arc<dyn SystemScanHandler>) -> Arc<Self> {
        let now = unix_timestamp_millis();
        Arc::new(Self {
            config,
            state: Mutex::new(SysState {
                online: HashMap::new(),
                nearline: HashMap::new(),
                online_running: false,
                nearline_running: false,
                last_online_start: now,
                last_online_end: now,
                last_nearline_start: now,
                last_nearline_end: now,
                history: VecDeque::new(),
            }),
            handler,
            sweeper: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_period_millis.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(map) = weak.upgrade() else {
                    break;
                };
                map.run_scans().await;
            }
            info!("system scan sweeper finished");
        });
        *lock_opt(&self.sweeper) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = lock_opt(&self.sweeper).take() {
            handle.abort();
        }
    }

    /// Periodic entry point: starts whichever categories are idle and past
    /// their rescan window.
    pub async fn run_scans(&self) {
        let now = unix_timestamp_millis();
        let (online_due, nearline_due) = {
            let state = self.lock();
            (
                !state.online_running
                    && now - state.last_online_end >= self.config.online_rescan_window_millis as i64,
                self.config.nearline_enabled
                    && !state.nearline_running
                    && now - state.last_nearline_end
                        >= self.config.nearline_rescan_window_millis as i64,
            )
        };

        if nearline_due {
            info!("run_scans: starting nearline system scan");
            if let Err(e) = self.start_category(true).await {
                warn!("nearline scan failed to start: {}", e);
            }
        }
        if online_due {
            info!("run_scans: starting online system scan");
            if let Err(e) = self.start_category(false).await {
                warn!("online scan failed to start: {}", e);
            }
        }
    }

    /// Admin entry point; refuses to stack a second pass on a running one.
    pub async fn start_scan(&self, nearline: bool) -> ClusterResult<()> {
        {
            let state = self.lock();
            let running = if nearline {
                state.nearline_running
            } else {
                state.online_running
            };
            if running {
                return Err(ClusterError::PermissionDenied(format!(
                    "{} scans are already running; cancel and then call start again",
                    category(nearline)
                )));
            }
        }
        self.start_category(nearline).await
    }

    /// Progress report from a shard task: the number of entries in its
    /// range, or the error that ended it.
    pub fn update_children(&self, id: &str, children: u64, error: Option<ClusterError>) {
        let mut state = self.lock();
        let Some(op) = get_mut(&mut state, id) else {
            return;
        };
        op.children = children;
        op.error = error;
        if children == 0 || op.is_complete() || op.error.is_some() {
            self.handle_done(&mut state, id);
        }
    }

    pub fn update_completed(&self, id: &str, failed: bool) {
        let mut state = self.lock();
        let Some(op) = get_mut(&mut state, id) else {
            return;
        };
        op.increment_completed(failed);
        if op.is_complete() {
            self.handle_done(&mut state, id);
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        let now = unix_timestamp_millis();
        let mut state = self.lock();
        let Some(mut op) = state.online.remove(id).or_else(|| state.nearline.remove(id)) else {
            return false;
        };
        op.canceled = true;
        if let Some(task) = op.task.take() {
            task.cancel("admin command");
        }
        self.push_history(&mut state, &op);
        self.handler.scan_cancelled(id);
        mark_drained(&mut state, op.nearline, now);
        true
    }

    pub fn cancel_all(&self, nearline: bool) -> usize {
        let now = unix_timestamp_millis();
        let mut state = self.lock();
        let drained: Vec<SystemScanOperation> = if nearline {
            state.nearline.drain().map(|(_, op)| op).collect()
        } else {
            state.online.drain().map(|(_, op)| op).collect()
        };
        let count = drained.len();
        for mut op in drained {
            op.canceled = true;
            if let Some(task) = op.task.take() {
                task.cancel("admin command");
            }
            self.push_history(&mut state, &op);
            self.handler.scan_cancelled(&op.id);
        }
        if nearline {
            state.nearline_running = false;
            state.last_nearline_end = now;
        } else {
            state.online_running = false;
            state.last_online_end = now;
        }
        count
    }

    pub fn is_running(&self, nearline: bool) -> bool {
        let state = self.lock();
        if nearline {
            state.nearline_running
        } else {
            state.online_running
        }
    }

    pub fn running_ids(&self, nearline: bool) -> Vec<String> {
        let state = self.lock();
        let map = if nearline { &state.nearline } else { &state.online };
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn status_string(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for op in state.online.values() {
            out.push_str(&format!("{}\n", op));
        }
        if !state.online.is_empty() && !state.nearline.is_empty() {
            out.push_str("------------------------------------------------\n");
        }
        for op in state.nearline.values() {
            out.push_str(&format!("{}\n", op));
        }
        out.push_str(&format!(
            "online running {} (last start {} last end {})\nnearline running {} (last start {} last end {})\n",
            state.online_running,
            state.last_online_start,
            state.last_online_end,
            state.nearline_running,
            state.last_nearline_start,
            state.last_nearline_end
        ));
        out
    }

    // ---- internals -----------------------------------------------------

    async fn start_category(&self, nearline: bool) -> ClusterResult<()> {
        let (min, max) = self.handler.min_max_indices(nearline).await?;
        if min >= max {
            info!("start: no {} entries to scan", category(nearline));
            return Ok(());
        }

        let now = unix_timestamp_millis();
        let batch = self.batch_size(nearline);
        let mut state = self.lock();
        let running = if nearline {
            state.nearline_running
        } else {
            state.online_running
        };
        if running {
            return Ok(());
        }

        for i in 0..self.config.max_concurrent_running as u64 {
            let start = min + i * batch;
            if start >= max {
                break;
            }
            let end = (start + batch).min(max);
            self.submit(&mut state, start, end, (min, max), nearline, now);
        }

        if nearline {
            state.nearline_running = true;
            state.last_nearline_start = now;
        } else {
            state.online_running = true;
            state.last_online_start = now;
        }
        Ok(())
    }

    fn submit(
        &self,
        state: &mut SysState,
        from: u64,
        to: u64,
        minmax: (u64, u64),
        nearline: bool,
        now: i64,
    ) {
        let mut op = SystemScanOperation::new(from, to, minmax.0, minmax.1, nearline, now);
        info!(
            "submitting system scan {} for indices [{}, {})",
            op.id, from, to
        );
        op.task = Some(self.handler.launch_scan(&op.id, from, to, nearline));
        let id = op.id.clone();
        if nearline {
            state.nearline.insert(id, op);
        } else {
            state.online.insert(id, op);
        }
    }

    /// Terminal bookkeeping for one shard: record it in the history and
    /// either submit the next shard range (one full stride ahead) or, when
    /// the category has drained, stamp the end of the pass.
    fn handle_done(&self, state: &mut SysState, id: &str) {
        let now = unix_timestamp_millis();
        let Some(op) = state.online.remove(id).or_else(|| state.nearline.remove(id)) else {
            return;
        };
        self.push_history(state, &op);

        if !op.canceled && op.error.is_none() && !op.is_final() {
            let stride = self.config.max_concurrent_running as u64 * self.batch_size(op.nearline);
            let start = op.from + stride;
            if start < op.max_index {
                let end = (start + self.batch_size(op.nearline)).min(op.max_index);
                self.submit(
                    state,
                    start,
                    end,
                    (op.min_index, op.max_index),
                    op.nearline,
                    now,
                );
                return;
            }
        }

        mark_drained(state, op.nearline, now);
    }

    fn push_history(&self, state: &mut SysState, op: &SystemScanOperation) {
        state.history.push_back(op.to_string());
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
    }

    fn batch_size(&self, nearline: bool) -> u64 {
        let batch = if nearline {
            self.config.nearline_batch_size
        } else {
            self.config.online_batch_size
        };
        batch.max(1)
    }

    fn lock(&self) -> MutexGuard<'_, SysState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn category(nearline: bool) -> &'static str {
    if nearline {
        "nearline"
    } else {
        "online"
    }
}

fn get_mut<'a>(state: &'a mut SysState, id: &str) -> Option<&'a mut SystemScanOperation> {
    if state.online.contains_key(id) {
        state.online.get_mut(id)
    } else {
        state.nearline.get_mut(id)
    }
}

fn mark_drained(state: &mut SysState, nearline: bool, now: i64) {
    if nearline {
        if state.nearline.is_empty() && state.nearline_running {
            state.nearline_running = false;
            state.last_nearline_end = now;
        }
    } else if state.online.is_empty() && state.online_running {
        state.online_running = false;
        state.last_online_end = now;
    }
}

fn lock_opt<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
