use serde::{Deserialize, Serialize};
use std::fmt;

/// Sticky lifetime meaning "never expires".
pub const STICKY_FOREVER: i64 = -1;

/// Lifecycle state of one replica. The broken flag is deliberately *not* a
/// state: it is an orthogonal marker on the record that survives
/// Cached/Precious moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    New,
    ReceivingFromClient,
    ReceivingFromStore,
    Cached,
    Precious,
    SendingToStore,
    Removed,
    Destroyed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::New => "NEW",
            ReplicaState::ReceivingFromClient => "RECEIVING_FROM_CLIENT",
            ReplicaState::ReceivingFromStore => "RECEIVING_FROM_STORE",
            ReplicaState::Cached => "CACHED",
            ReplicaState::Precious => "PRECIOUS",
            ReplicaState::SendingToStore => "SENDING_TO_STORE",
            ReplicaState::Removed => "REMOVED",
            ReplicaState::Destroyed => "DESTROYED",
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(
            self,
            ReplicaState::ReceivingFromClient | ReplicaState::ReceivingFromStore
        )
    }

    /// A replica in one of these states holds bytes that must not be
    /// evicted before they are safe on the backing store.
    pub fn counts_as_precious(&self) -> bool {
        matches!(self, ReplicaState::Precious | ReplicaState::SendingToStore)
    }

    /// Transition legality table. Destroyed is reachable only through the
    /// repository's internal destruction path, never as an explicit target;
    /// the same goes for New. Re-entering the current state is legal and
    /// must be a no-op for the caller.
    pub fn can_transition_to(&self, target: ReplicaState) -> bool {
        use ReplicaState::*;
        if target == New || target == Destroyed {
            return false;
        }
        if *self == target {
            return true;
        }
        match self {
            New => matches!(target, ReceivingFromClient | ReceivingFromStore | Removed),
            ReceivingFromClient | ReceivingFromStore => {
                matches!(target, Cached | Precious | Removed)
            }
            Cached => matches!(target, Precious | SendingToStore | Removed),
            Precious => matches!(target, Cached | SendingToStore | Removed),
            SendingToStore => matches!(target, Cached | Precious | Removed),
            Removed => false,
            Destroyed => false,
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sticky mark: `owner` wants this replica pinned until `expires_at`
/// (epoch millis), or forever when the lifetime is [`STICKY_FOREVER`].
/// Expiry is evaluated lazily on read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    pub expires_at: i64,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expires_at: i64) -> Self {
        Self {
            owner: owner.into(),
            expires_at,
        }
    }

    pub fn forever(owner: impl Into<String>) -> Self {
        Self::new(owner, STICKY_FOREVER)
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        self.expires_at == STICKY_FOREVER || self.expires_at > now
    }
}
