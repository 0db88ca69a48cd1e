use crate::state::{ReplicaState, StickyRecord};
use cluster_lib::EntryId;

/// Mutable state of one replica. Owned exclusively by the repository behind
/// a per-record mutex; all mutation happens through repository operations
/// while that lock is held.
#[derive(Clone, Debug)]
pub struct ReplicaRecord {
    pub id: EntryId,
    pub state: ReplicaState,
    /// Orthogonal error marker; cleared only explicitly.
    pub broken: bool,
    pub size: u64,
    pub storage_class: String,
    pub created_at: i64,
    pub last_access: i64,
    /// Open read handles. The record is destroyed only once this reaches
    /// zero in the Removed state.
    pub link_count: u32,
    pub sticky: Vec<StickyRecord>,
}

impl ReplicaRecord {
    pub fn new(id: EntryId, storage_class: impl Into<String>, now: i64) -> Self {
        Self {
            id,
            state: ReplicaState::New,
            broken: false,
            size: 0,
            storage_class: storage_class.into(),
            created_at: now,
            last_access: now,
            link_count: 0,
            sticky: Vec::new(),
        }
    }

    pub fn touch(&mut self, now: i64) {
        self.last_access = now;
    }

    pub fn is_sticky_at(&self, now: i64) -> bool {
        self.sticky.iter().any(|r| r.is_valid_at(now))
    }

    /// Adds or refreshes the sticky record for `owner`. With
    /// `overwrite = false` an existing unexpired record for the same owner
    /// wins and the call returns false.
    pub fn set_sticky(&mut self, owner: &str, expires_at: i64, overwrite: bool, now: i64) -> bool {
        if let Some(existing) = self.sticky.iter_mut().find(|r| r.owner == owner) {
            if !overwrite && existing.is_valid_at(now) {
                return false;
            }
            existing.expires_at = expires_at;
            return true;
        }
        self.sticky.push(StickyRecord::new(owner, expires_at));
        true
    }

    /// Drops expired records, returning what was removed.
    pub fn remove_expired_sticky(&mut self, now: i64) -> Vec<StickyRecord> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.sticky.drain(..).partition(|r| !r.is_valid_at(now));
        self.sticky = live;
        expired
    }

    /// Earliest finite expiry among the live sticky records, for scheduling
    /// the clock-driven expiry check.
    pub fn next_sticky_expiry(&self) -> Option<i64> {
        self.sticky
            .iter()
            .filter(|r| r.expires_at >= 0)
            .map(|r| r.expires_at)
            .min()
    }

    /// A replica is garbage-collectable when it is plain cached data:
    /// not pinned, not precious, not broken.
    pub fn is_removable_at(&self, now: i64) -> bool {
        self.state == ReplicaState::Cached && !self.broken && !self.is_sticky_at(now)
    }
}
