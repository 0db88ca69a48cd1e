use crate::task::ScanTaskHandle;
use cluster_lib::{ClusterError, PoolHealth};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Waiting,
    Running,
    Canceled,
    Failed,
    Excluded,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "IDLE",
            ScanState::Waiting => "WAITING",
            ScanState::Running => "RUNNING",
            ScanState::Canceled => "CANCELED",
            ScanState::Failed => "FAILED",
            ScanState::Excluded => "EXCLUDED",
        }
    }
}

/// What a pool status update means for the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextAction {
    Nop,
    UpToDown,
    DownToUp,
}

/// Scheduling placeholder for one pool. The owning queue (idle, waiting or
/// running) mirrors the `state` field; membership changes only inside the
/// map's lock.
pub struct PoolScanOperation {
    pub state: ScanState,
    pub curr_status: PoolHealth,
    pub last_status: PoolHealth,
    pub force_scan: bool,
    pub children: u32,
    pub completed: u32,
    pub failed: u32,
    pub last_update: i64,
    pub last_scan: i64,
    pub error: Option<ClusterError>,
    pub(crate) task: Option<ScanTaskHandle>,
    init_grace_millis: i64,
}

impl PoolScanOperation {
    pub fn new(init_grace_millis: i64, now: i64) -> Self {
        Self {
            state: ScanState::Idle,
            curr_status: PoolHealth::Uninitialized,
            last_status: PoolHealth::Uninitialized,
            force_scan: false,
            children: 0,
            completed: 0,
            failed: 0,
            last_update: now,
            last_scan: now,
            error: None,
            task: None,
            init_grace_millis,
        }
    }

    /// Applies an externally observed status and decides what the map
    /// should do about it. The transition acts on up/down categories;
    /// moves within a category are recorded without action. A DOWN seen
    /// while still Uninitialized is suppressed during the initialization
    /// grace window, so startup races do not trigger spurious scans.
    pub fn next_action(&mut self, incoming: PoolHealth, now: i64) -> NextAction {
        if self.state == ScanState::Excluded {
            self.last_status = self.curr_status;
            self.curr_status = incoming;
            return NextAction::Nop;
        }
        if incoming == self.curr_status || incoming == PoolHealth::Uninitialized {
            return NextAction::Nop;
        }

        match (self.curr_status, incoming) {
            (PoolHealth::Uninitialized, PoolHealth::Down) => {
                if now - self.last_update < self.init_grace_millis {
                    // Status stays Uninitialized until the grace runs out.
                    return NextAction::Nop;
                }
                self.record_status(incoming);
                NextAction::UpToDown
            }
            (PoolHealth::Uninitialized, _) => {
                self.record_status(incoming);
                NextAction::Nop
            }
            (PoolHealth::Down, status) if status.is_up() => {
                self.record_status(incoming);
                NextAction::DownToUp
            }
            (status, PoolHealth::Down) if status.is_up() => {
                self.record_status(incoming);
                NextAction::UpToDown
            }
            // ReadOnly <-> Enabled.
            _ => {
                self.record_status(incoming);
                NextAction::Nop
            }
        }
    }

    fn record_status(&mut self, incoming: PoolHealth) {
        self.last_status = self.curr_status;
        self.curr_status = incoming;
    }

    pub fn set_children(&mut self, children: u32) {
        self.children = children;
    }

    pub fn increment_completed(&mut self, failed: bool, now: i64) {
        self.completed += 1;
        if failed {
            self.failed += 1;
        }
        self.last_update = now;
    }

    pub fn reset_children(&mut self) {
        self.children = 0;
        self.completed = 0;
    }

    pub fn reset_failed(&mut self) {
        self.failed = 0;
    }

    pub fn is_complete(&self) -> bool {
        self.children > 0 && self.children == self.completed
    }

    pub fn is_excluded(&self) -> bool {
        self.state == ScanState::Excluded
    }
}

impl fmt::Display for PoolScanOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (status {} prev {}){}{} children {} completed {} failed {}",
            self.state.as_str(),
            self.curr_status.as_str(),
            self.last_status.as_str(),
            if self.force_scan { " forced" } else { "" },
            match &self.error {
                Some(e) => format!(" error: {}", e),
                None => String::new(),
            },
            self.children,
            self.completed,
            self.failed
        )
    }
}

/// One shard of a system-wide namespace scan over the index range
/// `[from, to)` within the category bounds `[min_index, max_index)`.
pub struct SystemScanOperation {
    pub id: String,
    pub from: u64,
    pub to: u64,
    pub nearline: bool,
    pub min_index: u64,
    pub max_index: u64,
    pub children: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: bool,
    pub last_scan: i64,
    pub error: Option<ClusterError>,
    pub(crate) task: Option<ScanTaskHandle>,
}

impl SystemScanOperation {
    pub fn new(from: u64, to: u64, min_index: u64, max_index: u64, nearline: bool, now: i64) -> Self {
        let id = format!(
            "{}-{}-{}",
            if nearline { "nearline" } else { "online" },
            from,
            to
        );
        Self {
            id,
            from,
            to,
            nearline,
            min_index,
            max_index,
            children: 0,
            completed: 0,
            failed: 0,
            canceled: false,
            last_scan: now,
            error: None,
            task: None,
        }
    }

    /// The last shard of the pass: nothing beyond `to` remains.
    pub fn is_final(&self) -> bool {
        self.to >= self.max_index
    }

    pub fn is_complete(&self) -> bool {
        self.children > 0 && self.children == self.completed
    }

    pub fn increment_completed(&mut self, failed: bool) {
        self.completed += 1;
        if failed {
            self.failed += 1;
        }
    }
}

impl fmt::Display for SystemScanOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}..{}) {} completed {} failed {}{}",
            self.id,
            self.from,
            self.to,
            if self.canceled { "canceled" } else { "" },
            self.completed,
            self.failed,
            match &self.error {
                Some(e) => format!(" error: {}", e),
                None => String::new(),
            }
        )
    }
}
