use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

/// Logical creation stamp of an operation. Ordering only; carries no
/// wall-clock meaning.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Seq(u64);

impl Seq {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidData(format!("seq must be 8 bytes, got {}", bytes.len())))?;
        Ok(Self(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Serialize for Seq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Seq::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Hands out strictly increasing sequence numbers for one editing session.
#[derive(Debug)]
pub struct SeqClock {
    last: u64,
}

impl SeqClock {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Generate the next sequence number.
    pub fn tick(&mut self) -> Seq {
        self.last += 1;
        Seq(self.last)
    }

    /// Advance past a sequence number seen elsewhere (e.g. restored operations)
    /// so later ticks still sort after it.
    pub fn observe(&mut self, seen: Seq) {
        self.last = self.last.max(seen.0);
    }
}

impl Default for SeqClock {
    fn default() -> Self {
        Self::new()
    }
}
