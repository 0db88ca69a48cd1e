use async_trait::async_trait;
use cluster_lib::{ClusterResult, EntryId};

/// Pool-side client of the namespace service. The repository uses it to
/// keep cache-location records honest and to publish the final size and
/// storage class of a committed replica. Injected by constructor.
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    async fn add_cache_location(&self, id: &EntryId, pool: &str) -> ClusterResult<()>;

    /// `remove_if_last` marks volatile pools: dropping the last known
    /// replica should delete the namespace entry too.
    async fn clear_cache_location(
        &self,
        id: &EntryId,
        pool: &str,
        remove_if_last: bool,
    ) -> ClusterResult<()>;

    async fn set_file_attributes(
        &self,
        id: &EntryId,
        size: u64,
        storage_class: &str,
    ) -> ClusterResult<()>;
}
