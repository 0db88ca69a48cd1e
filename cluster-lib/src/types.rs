use serde::{Deserialize, Serialize};

/// Caller identity attached to every namespace request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user: String,
    pub groups: Vec<String>,
}

impl Subject {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new("root")
    }

    pub fn is_root(&self) -> bool {
        self.user == "root"
    }
}

/// Externally observed mode of a storage pool, as reported by the pool
/// monitor. Drives the scan scheduler's transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolHealth {
    Down,
    ReadOnly,
    Enabled,
    Uninitialized,
}

impl PoolHealth {
    pub fn is_up(&self) -> bool {
        matches!(self, PoolHealth::ReadOnly | PoolHealth::Enabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealth::Down => "DOWN",
            PoolHealth::ReadOnly => "READ_ONLY",
            PoolHealth::Enabled => "ENABLED",
            PoolHealth::Uninitialized => "UNINITIALIZED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatusUpdate {
    pub pool: String,
    pub status: PoolHealth,
}

impl PoolStatusUpdate {
    pub fn new(pool: impl Into<String>, status: PoolHealth) -> Self {
        Self {
            pool: pool.into(),
            status,
        }
    }
}
