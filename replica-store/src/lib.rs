mod account;
mod client;
mod handle;
mod record;
mod repository;
mod state;

pub use account::{Account, SpaceRecord};
pub use client::NamespaceClient;
pub use handle::{ReadHandle, WriteHandle};
pub use record::ReplicaRecord;
pub use repository::{
    ReplicaRepository, ReplicaStateListener, RepositoryConfig, StateChangeEvent,
};
pub use state::{ReplicaState, StickyRecord, STICKY_FOREVER};
