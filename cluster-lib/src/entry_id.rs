use crate::{ClusterError, ClusterResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of the printable form: 4 hex digits of database id followed by
/// 20 hex digits of serial number.
pub const ENTRY_ID_LENGTH: usize = 24;

const DB_ID_DIGITS: usize = 4;

/// Globally unique identifier of one namespace entry. The leading digits
/// carry the id of the database (partition) the entry lives in, which is
/// what the dispatcher shards on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    db_id: u16,
    serial: u128,
}

impl EntryId {
    pub fn new(db_id: u16, serial: u128) -> Self {
        // 20 hex digits of serial
        Self {
            db_id,
            serial: serial & 0xFFFF_FFFF_FFFF_FFFF_FFFF,
        }
    }

    pub fn database_id(&self) -> u32 {
        self.db_id as u32
    }

    pub fn serial(&self) -> u128 {
        self.serial
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}{:020X}", self.db_id, self.serial)
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self)
    }
}

impl FromStr for EntryId {
    type Err = ClusterError;

    fn from_str(s: &str) -> ClusterResult<Self> {
        if s.len() != ENTRY_ID_LENGTH {
            return Err(ClusterError::InvalidParam(format!(
                "entry id must be {} hex digits, got {:?}",
                ENTRY_ID_LENGTH, s
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ClusterError::InvalidParam(format!(
                "entry id contains non-hex characters: {:?}",
                s
            )));
        }
        let db_id = u16::from_str_radix(&s[..DB_ID_DIGITS], 16)
            .map_err(|e| ClusterError::InvalidParam(format!("bad database id: {}", e)))?;
        let serial = u128::from_str_radix(&s[DB_ID_DIGITS..], 16)
            .map_err(|e| ClusterError::InvalidParam(format!("bad serial: {}", e)))?;
        Ok(EntryId { db_id, serial })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EntryId::from_str(&s).map_err(D::Error::custom)
    }
}
