use async_trait::async_trait;
use cluster_lib::{ClusterResult, PoolHealth};
use log::info;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Cooperative cancellation marker shared with a running scan task. The
/// task is expected to poll it between units of work.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Handle to one in-flight scan task. Cancellation sets the cooperative
/// flag and aborts the backing task.
pub struct ScanTaskHandle {
    flag: CancelFlag,
    join: JoinHandle<()>,
}

impl ScanTaskHandle {
    /// Spawns the task produced by `factory`, handing it the cancel flag.
    pub fn spawn<F, Fut>(factory: F) -> Self
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let flag = CancelFlag::new();
        let join = tokio::spawn(factory(flag.clone()));
        Self { flag, join }
    }

    pub fn cancel(&self, reason: &str) {
        info!("cancelling scan task: {}", reason);
        self.flag.set();
        self.join.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

/// Collaborator driving the actual pool scans. `launch_scan` must return
/// promptly (spawning its own work); completion and per-file progress are
/// reported back through the map's update methods. Callbacks are invoked
/// from inside the map and must not call back into it synchronously.
pub trait PoolScanHandler: Send + Sync {
    fn launch_scan(&self, pool: &str, status: PoolHealth, force: bool) -> ScanTaskHandle;

    fn scan_cancelled(&self, pool: &str, status: PoolHealth);

    fn pool_excluded(&self, _pool: &str) {}

    fn pool_included(&self, _pool: &str) {}
}

/// Collaborator for the system-wide namespace scans.
#[async_trait]
pub trait SystemScanHandler: Send + Sync {
    /// `[min, max)` bounds of the namespace index space for the category.
    async fn min_max_indices(&self, nearline: bool) -> ClusterResult<(u64, u64)>;

    fn launch_scan(&self, id: &str, from: u64, to: u64, nearline: bool) -> ScanTaskHandle;

    fn scan_cancelled(&self, _id: &str) {}
}
