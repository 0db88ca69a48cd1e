use cluster_lib::{ClusterError, ClusterResult};
use log::warn;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Snapshot of the pool's space bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceRecord {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
}

#[derive(Debug, Default)]
struct AccountState {
    total: u64,
    used: u64,
    precious: u64,
    removable: u64,
}

/// The single point of contention for space bookkeeping on a pool. All
/// mutations go through one mutex; the lock is never held across I/O.
///
/// Sizes are unsigned, so the negative-allocation checks of older
/// implementations are enforced by the type system instead of at runtime.
pub struct Account {
    state: Mutex<AccountState>,
    released: Notify,
}

impl Account {
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(AccountState {
                total,
                ..AccountState::default()
            }),
            released: Notify::new(),
        }
    }

    /// Non-blocking reservation. Returns false when the pool cannot hold
    /// `size` more bytes right now; the ledger is left untouched in that
    /// case.
    pub fn allocate_now(&self, size: u64) -> bool {
        let mut state = self.lock();
        if state.used.saturating_add(size) > state.total {
            return false;
        }
        state.used += size;
        true
    }

    /// Blocking reservation: waits until enough space has been freed (or
    /// the total grown). Cancelling the future abandons the wait without
    /// touching the ledger.
    pub async fn allocate(&self, size: u64) {
        loop {
            let released = self.released.notified();
            if self.allocate_now(size) {
                return;
            }
            released.await;
        }
    }

    /// Returns a reservation to the pool. Freeing more than is currently
    /// used means the caller's bookkeeping has diverged from ours, which is
    /// an invariant violation.
    pub fn free(&self, size: u64) -> ClusterResult<()> {
        {
            let mut state = self.lock();
            if size > state.used {
                return Err(ClusterError::Internal(format!(
                    "freeing {} bytes but only {} are in use",
                    size, state.used
                )));
            }
            state.used -= size;
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Changes the pool capacity. Shrinking below the bytes already in use
    /// is rejected.
    pub fn set_total(&self, new_total: u64) -> ClusterResult<()> {
        let grew = {
            let mut state = self.lock();
            if new_total < state.used {
                return Err(ClusterError::InvalidParam(format!(
                    "new total {} is below used {}",
                    new_total, state.used
                )));
            }
            let grew = new_total > state.total;
            state.total = new_total;
            grew
        };
        if grew {
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Startup adjustment for replicas discovered already on disk: they
    /// consume space that was never reserved, so both sides of the ledger
    /// grow together.
    pub fn grow_total_and_used(&self, size: u64) {
        let mut state = self.lock();
        state.total += size;
        state.used += size;
    }

    pub fn adjust_precious(&self, delta: i64) {
        let mut state = self.lock();
        state.precious = Self::apply_delta(state.precious, delta, "precious");
    }

    pub fn adjust_removable(&self, delta: i64) {
        let mut state = self.lock();
        state.removable = Self::apply_delta(state.removable, delta, "removable");
    }

    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn used(&self) -> u64 {
        self.lock().used
    }

    pub fn space_record(&self) -> SpaceRecord {
        let state = self.lock();
        SpaceRecord {
            total: state.total,
            used: state.used,
            free: state.total - state.used,
            precious: state.precious,
            removable: state.removable,
        }
    }

    fn apply_delta(value: u64, delta: i64, what: &str) -> u64 {
        if delta >= 0 {
            value + delta as u64
        } else {
            let dec = delta.unsigned_abs();
            if dec > value {
                warn!("{} counter underflow: {} - {}", what, value, dec);
                0
            } else {
                value - dec
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AccountState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // All writers keep the state consistent before unwinding.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
