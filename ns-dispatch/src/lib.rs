mod dispatcher;
mod message;
mod path_shard_cache;
mod provider;
mod queue;

pub use dispatcher::{DispatcherConfig, NamespaceDispatcher};
pub use message::{NamespaceOp, NamespaceReply, NamespaceRequest, ResponsePayload};
pub use path_shard_cache::PathShardCache;
pub use provider::{Checksum, DirEntry, FileAttributes, ListSink, LocationRelay, NamespaceProvider};

#[cfg(test)]
mod dispatcher_tests;
