use async_trait::async_trait;
use cluster_lib::{ClusterResult, EntryId, NsPath, Subject};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: String,
    pub value: String,
}

/// The attribute bag exchanged with the namespace backend. Only the fields
/// a request asked for (or an update touches) are populated.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub storage_class: Option<String>,
    pub is_dir: Option<bool>,
    pub locations: Option<Vec<String>>,
    pub checksums: Option<Vec<Checksum>>,
    pub flags: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub id: EntryId,
    pub attrs: FileAttributes,
}

/// Streaming consumer for directory listings; large directories are never
/// buffered in full on the provider side.
pub trait ListSink: Send {
    fn accept(&mut self, entry: DirEntry);
}

/// The namespace backend the dispatcher drives. All calls are synchronous
/// from the worker's point of view and fail with the shared error taxonomy
/// (not-found, invalid-param, permission-denied, internal).
#[async_trait]
pub trait NamespaceProvider: Send + Sync {
    async fn create_entry(
        &self,
        subject: &Subject,
        path: &NsPath,
        attrs: &FileAttributes,
        is_dir: bool,
    ) -> ClusterResult<EntryId>;

    async fn delete_entry(
        &self,
        subject: &Subject,
        id: Option<&EntryId>,
        path: Option<&NsPath>,
    ) -> ClusterResult<()>;

    async fn rename_entry(
        &self,
        subject: &Subject,
        id: &EntryId,
        new_path: &NsPath,
        overwrite: bool,
    ) -> ClusterResult<()>;

    async fn get_file_attributes(
        &self,
        subject: &Subject,
        id: &EntryId,
    ) -> ClusterResult<FileAttributes>;

    async fn set_file_attributes(
        &self,
        subject: &Subject,
        id: &EntryId,
        attrs: &FileAttributes,
    ) -> ClusterResult<FileAttributes>;

    async fn list(
        &self,
        subject: &Subject,
        path: &NsPath,
        pattern: Option<&str>,
        range: Option<Range<u64>>,
        sink: &mut (dyn ListSink + '_),
    ) -> ClusterResult<()>;

    async fn path_to_id(
        &self,
        subject: &Subject,
        path: &NsPath,
        resolve_links: bool,
    ) -> ClusterResult<EntryId>;

    async fn id_to_path(&self, subject: &Subject, id: &EntryId) -> ClusterResult<NsPath>;

    async fn get_parent(&self, subject: &Subject, id: &EntryId) -> ClusterResult<EntryId>;

    async fn add_cache_location(&self, id: &EntryId, pool: &str) -> ClusterResult<()>;

    async fn clear_cache_location(&self, id: &EntryId, pool: &str) -> ClusterResult<()>;

    async fn get_cache_locations(&self, id: &EntryId) -> ClusterResult<Vec<String>>;

    async fn add_checksum(&self, id: &EntryId, checksum: &Checksum) -> ClusterResult<()>;

    async fn remove_checksum(&self, id: &EntryId, kind: &str) -> ClusterResult<()>;

    async fn get_checksums(&self, id: &EntryId) -> ClusterResult<Vec<Checksum>>;

    async fn set_flag(&self, id: &EntryId, key: &str, value: &str) -> ClusterResult<()>;
}

/// Downstream consumer of cache-location changes. Forwarding is
/// fire-and-forget: a lost relay never fails the originating request.
#[async_trait]
pub trait LocationRelay: Send + Sync {
    async fn relay(&self, id: Option<EntryId>, op: &crate::message::NamespaceOp);
}
