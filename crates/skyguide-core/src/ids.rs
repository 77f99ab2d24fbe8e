use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable handle for one accepted connection.
///
/// Handles are never reused within a process; the session registry is the
/// only owner of the session behind a handle, everything else refers to it
/// by id and must tolerate the session being gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cli_{}", self.0)
    }
}

/// Monotonic source of [`ClientId`]s.
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let id = ClientId::from_raw(7);
        assert_eq!(id.to_string(), "cli_7");
    }

    #[test]
    fn allocator_is_monotonic() {
        let alloc = ClientIdAllocator::new();
        let ids: Vec<ClientId> = (0..100).map(|_| alloc.next_id()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn serde_is_transparent() {
        let id = ClientId::from_raw(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let parsed: ClientId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, id);
    }
}
