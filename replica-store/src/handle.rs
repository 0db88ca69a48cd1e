use crate::repository::ReplicaRepository;
use crate::state::ReplicaState;
use cluster_lib::{ClusterError, ClusterResult, EntryId};
use log::warn;
use std::sync::Arc;

/// Handle for writing a new replica, bound to the space reservation made at
/// creation. Committing finalizes the size, publishes the attributes
/// upstream and moves the entry to its target state; closing without a
/// commit aborts the transfer and garbage-collects the half-written entry.
pub struct WriteHandle {
    repo: Arc<ReplicaRepository>,
    id: EntryId,
    target_state: ReplicaState,
    allocated: u64,
    done: bool,
}

impl WriteHandle {
    pub(crate) fn new(
        repo: Arc<ReplicaRepository>,
        id: EntryId,
        target_state: ReplicaState,
        allocated: u64,
    ) -> Self {
        Self {
            repo,
            id,
            target_state,
            allocated,
            done: false,
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Grows the reservation, blocking until the pool has room.
    pub async fn allocate(&mut self, size: u64) -> ClusterResult<()> {
        if self.done {
            return Err(ClusterError::Internal(format!(
                "write handle for {} is closed",
                self.id
            )));
        }
        self.repo.account().allocate(size).await;
        self.allocated += size;
        Ok(())
    }

    /// Non-blocking variant; false leaves the reservation unchanged.
    pub fn allocate_now(&mut self, size: u64) -> ClusterResult<bool> {
        if self.done {
            return Err(ClusterError::Internal(format!(
                "write handle for {} is closed",
                self.id
            )));
        }
        if self.repo.account().allocate_now(size) {
            self.allocated += size;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Finalizes the transfer. Over-allocation is returned to the pool, the
    /// entry moves to its target state, and the final size and storage
    /// class are pushed to the namespace. A failure of that external call
    /// marks the entry broken instead of rolling anything back.
    pub async fn commit(&mut self, actual_size: u64) -> ClusterResult<()> {
        if self.done {
            return Err(ClusterError::Internal(format!(
                "write handle for {} is closed",
                self.id
            )));
        }
        if actual_size > self.allocated {
            return Err(ClusterError::InvalidParam(format!(
                "file size {} exceeds the {} bytes allocated for {}",
                actual_size, self.allocated, self.id
            )));
        }

        let over = self.allocated - actual_size;
        if over > 0 {
            self.repo.account().free(over)?;
            self.allocated = actual_size;
        }
        self.repo.set_size(&self.id, actual_size);
        self.repo.set_state(&self.id, self.target_state)?;
        self.done = true;

        let storage_class = self
            .repo
            .entry(&self.id)
            .map(|r| r.storage_class)
            .unwrap_or_default();
        let persist = async {
            self.repo
                .client()
                .set_file_attributes(&self.id, actual_size, &storage_class)
                .await?;
            self.repo
                .client()
                .add_cache_location(&self.id, self.repo.pool_name())
                .await
        };
        if let Err(e) = persist.await {
            warn!("failed to register {} in the namespace: {}", self.id, e);
            if let Err(mark) = self.repo.set_broken(&self.id, true) {
                warn!("failed to mark {} broken: {}", self.id, mark);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Aborts an uncommitted transfer explicitly. Idempotent.
    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.repo.abort_write(&self.id, self.allocated);
        }
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("id", &self.id)
            .field("target_state", &self.target_state)
            .field("allocated", &self.allocated)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.done {
            warn!("write handle for {} dropped without commit", self.id);
            self.done = true;
            self.repo.abort_write(&self.id, self.allocated);
        }
    }
}

/// Read lease on a replica. Holding one keeps even a Removed entry alive;
/// the last handle to close performs the deferred destruction.
pub struct ReadHandle {
    repo: Arc<ReplicaRepository>,
    id: EntryId,
    done: bool,
}

impl ReadHandle {
    pub(crate) fn new(repo: Arc<ReplicaRepository>, id: EntryId) -> Self {
        Self {
            repo,
            id,
            done: false,
        }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.repo.release_read(&self.id);
        }
    }
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.close();
    }
}
