use crate::provider::{Checksum, DirEntry, FileAttributes};
use cluster_lib::{ClusterError, ClusterResult, EntryId, NsPath, Subject};
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Cap on the slack subtracted from a message's TTL before the early
/// discard check.
const MAX_TTL_SLACK: Duration = Duration::from_secs(10);

/// One namespace metadata operation. The target (id and/or path) travels on
/// the request envelope, not in the variant.
#[derive(Clone, Debug, PartialEq)]
pub enum NamespaceOp {
    CreateEntry { attrs: FileAttributes, is_dir: bool },
    DeleteEntry,
    Rename { new_path: NsPath, overwrite: bool },
    GetAttributes,
    SetAttributes { attrs: FileAttributes },
    ListDirectory { pattern: Option<String>, range: Option<Range<u64>> },
    AddCacheLocation { pool: String },
    ClearCacheLocation { pool: String },
    GetCacheLocations,
    MapPath,
    GetParent,
    AddChecksum { checksum: Checksum },
    RemoveChecksum { kind: String },
    GetChecksums,
    SetFlag { key: String, value: String },
    Flush { storage_class: String },
}

impl NamespaceOp {
    pub fn name(&self) -> &'static str {
        match self {
            NamespaceOp::CreateEntry { is_dir: false, .. } => "create-entry",
            NamespaceOp::CreateEntry { is_dir: true, .. } => "create-directory",
            NamespaceOp::DeleteEntry => "delete-entry",
            NamespaceOp::Rename { .. } => "rename",
            NamespaceOp::GetAttributes => "get-attributes",
            NamespaceOp::SetAttributes { .. } => "set-attributes",
            NamespaceOp::ListDirectory { .. } => "list-directory",
            NamespaceOp::AddCacheLocation { .. } => "add-cache-location",
            NamespaceOp::ClearCacheLocation { .. } => "clear-cache-location",
            NamespaceOp::GetCacheLocations => "get-cache-locations",
            NamespaceOp::MapPath => "map-path",
            NamespaceOp::GetParent => "get-parent",
            NamespaceOp::AddChecksum { .. } => "add-checksum",
            NamespaceOp::RemoveChecksum { .. } => "remove-checksum",
            NamespaceOp::GetChecksums => "get-checksums",
            NamespaceOp::SetFlag { .. } => "set-flag",
            NamespaceOp::Flush { .. } => "flush",
        }
    }

    pub fn is_listing(&self) -> bool {
        matches!(self, NamespaceOp::ListDirectory { .. })
    }

    pub fn is_cache_location_op(&self) -> bool {
        matches!(
            self,
            NamespaceOp::AddCacheLocation { .. }
                | NamespaceOp::ClearCacheLocation { .. }
                | NamespaceOp::GetCacheLocations
        )
    }

    pub fn is_location_modification(&self) -> bool {
        matches!(
            self,
            NamespaceOp::AddCacheLocation { .. } | NamespaceOp::ClearCacheLocation { .. }
        )
    }

    /// Read-mostly, retryable operations that may be dropped when their TTL
    /// has effectively run out. Mutations never qualify: their side effects
    /// must not be silently skipped.
    pub fn discard_early(&self) -> bool {
        matches!(
            self,
            NamespaceOp::GetAttributes
                | NamespaceOp::GetCacheLocations
                | NamespaceOp::GetParent
                | NamespaceOp::GetChecksums
                | NamespaceOp::MapPath
                | NamespaceOp::ListDirectory { .. }
                | NamespaceOp::CreateEntry { .. }
        )
    }

    /// Reads whose reply can stand in for an identical pending read.
    pub fn is_idempotent_read(&self) -> bool {
        matches!(
            self,
            NamespaceOp::GetAttributes
                | NamespaceOp::GetCacheLocations
                | NamespaceOp::GetParent
                | NamespaceOp::GetChecksums
                | NamespaceOp::MapPath
        )
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            NamespaceOp::CreateEntry { .. }
                | NamespaceOp::DeleteEntry
                | NamespaceOp::Rename { .. }
                | NamespaceOp::SetAttributes { .. }
                | NamespaceOp::AddCacheLocation { .. }
                | NamespaceOp::ClearCacheLocation { .. }
                | NamespaceOp::AddChecksum { .. }
                | NamespaceOp::RemoveChecksum { .. }
                | NamespaceOp::SetFlag { .. }
                | NamespaceOp::Flush { .. }
        )
    }

    /// Same variant, payload ignored: good enough because the foldable ops
    /// carry no request payload beyond the target.
    fn same_kind(&self, other: &NamespaceOp) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponsePayload {
    Empty,
    Id(EntryId),
    Path(NsPath),
    Attributes(FileAttributes),
    Locations(Vec<String>),
    Checksums(Vec<Checksum>),
    Listing(Vec<DirEntry>),
}

#[derive(Clone, Debug)]
pub struct NamespaceReply {
    pub result: ClusterResult<ResponsePayload>,
    /// False only for the partial batches of a streamed listing.
    pub is_final: bool,
}

impl NamespaceReply {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self {
            result: Ok(payload),
            is_final: true,
        }
    }

    pub fn failed(err: ClusterError) -> Self {
        Self {
            result: Err(err),
            is_final: true,
        }
    }

    pub fn partial(payload: ResponsePayload) -> Self {
        Self {
            result: Ok(payload),
            is_final: false,
        }
    }
}

/// One in-flight metadata request. Created by the transport layer, consumed
/// by exactly one worker; after dispatch it is never shared across queues.
#[derive(Debug)]
pub struct NamespaceRequest {
    pub op: NamespaceOp,
    pub id: Option<EntryId>,
    pub path: Option<NsPath>,
    pub subject: Subject,
    pub created_at: Instant,
    pub ttl: Duration,
    pub reply_required: bool,
    reply: mpsc::UnboundedSender<NamespaceReply>,
}

impl NamespaceRequest {
    pub fn new(
        op: NamespaceOp,
        subject: Subject,
        ttl: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<NamespaceReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                op,
                id: None,
                path: None,
                subject,
                created_at: Instant::now(),
                ttl,
                reply_required: true,
                reply: tx,
            },
            rx,
        )
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_path(mut self, path: NsPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.reply_required = false;
        self
    }

    /// Deadline minus a slack of 10% of the TTL, capped at 10 seconds.
    pub fn adjusted_ttl(&self) -> Duration {
        let slack = (self.ttl / 10).min(MAX_TTL_SLACK);
        self.ttl.saturating_sub(slack)
    }

    /// True once the local age of the message exceeds the adjusted TTL.
    pub fn expired(&self) -> bool {
        self.created_at.elapsed() > self.adjusted_ttl()
    }

    /// Target identity used for folding decisions: prefer ids, fall back to
    /// paths; messages without any target never match.
    fn same_target(&self, other: &NamespaceRequest) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.path, &other.path) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Would executing `self` invalidate the completed message's result for
    /// anything queued behind it? Mutations on the same target do.
    pub fn invalidates(&self, completed: &NamespaceRequest) -> bool {
        self.op.is_mutation() && self.same_target(completed)
    }

    /// Can this pending message be answered with the completed one's reply?
    pub fn subsumed_by(&self, completed: &NamespaceRequest) -> bool {
        self.op.is_idempotent_read()
            && self.op.same_kind(&completed.op)
            && self.same_target(completed)
    }

    pub fn send_reply(&self, reply: NamespaceReply) {
        if !self.reply_required {
            return;
        }
        // A receiver that went away is not our problem.
        let _ = self.reply.send(reply);
    }
}
