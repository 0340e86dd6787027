//! Per-server status word shared with the routing plane.
//!
//! Role and health flags for one server live in a single `u64`. The monitor
//! is the only writer; routers and diagnostics read the word lock-free. A
//! release store pairs with acquire loads so a reader always sees a word the
//! monitor actually published.

use std::sync::atomic::{AtomicU64, Ordering};

/// The server accepted a connection on the last attempt.
pub const RUNNING: u64 = 1 << 0;
/// The server is the replication master of the monitored cluster.
pub const MASTER: u64 = 1 << 1;
/// The server replicates, directly or through relays, from the master.
pub const SLAVE: u64 = 1 << 2;
/// The server replicates from a master outside the monitored set.
pub const SLAVE_OF_EXT_MASTER: u64 = 1 << 3;
/// The server is both a slave and a master of further slaves.
pub const RELAY_MASTER: u64 = 1 << 4;
/// The monitor user failed a permission probe on this server.
pub const AUTH_ERROR: u64 = 1 << 5;
/// The server is low on disk space. Written by the embedding daemon.
pub const DISK_SPACE_EXHAUSTED: u64 = 1 << 6;
/// Operator put the server in maintenance; roles are frozen.
pub const MAINTENANCE: u64 = 1 << 7;

/// Role bits recomputed from scratch on every topology pass.
pub const ROLE_BITS: u64 = MASTER | SLAVE | SLAVE_OF_EXT_MASTER | RELAY_MASTER;

/// Lock-free status word of one server.
#[derive(Debug, Default)]
pub struct StatusWord(AtomicU64);

impl StatusWord {
    pub fn new(bits: u64) -> Self {
        Self(AtomicU64::new(bits))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, bits: u64) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear(&self, bits: u64) {
        self.0.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Replace the role bits while leaving health and maintenance flags as
    /// they are.
    pub fn store_roles(&self, roles: u64) {
        debug_assert_eq!(roles & !ROLE_BITS, 0);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (current & !ROLE_BITS) | roles;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn has(&self, bits: u64) -> bool {
        self.load() & bits == bits
    }
}

/// Human form of a status word, e.g. `Master, Running`.
pub fn describe(bits: u64) -> String {
    const NAMES: [(u64, &str); 8] = [
        (MASTER, "Master"),
        (SLAVE, "Slave"),
        (RELAY_MASTER, "Relay Master"),
        (SLAVE_OF_EXT_MASTER, "Slave of External Server"),
        (MAINTENANCE, "Maintenance"),
        (AUTH_ERROR, "Auth Error"),
        (DISK_SPACE_EXHAUSTED, "Disk Space Low"),
        (RUNNING, "Running"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "Down".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_roles_preserves_other_bits() {
        let word = StatusWord::new(RUNNING | MAINTENANCE | MASTER);
        word.store_roles(SLAVE);
        assert_eq!(word.load(), RUNNING | MAINTENANCE | SLAVE);
        word.store_roles(0);
        assert_eq!(word.load(), RUNNING | MAINTENANCE);
    }

    #[test]
    fn test_set_and_clear() {
        let word = StatusWord::default();
        word.set(RUNNING | SLAVE);
        assert!(word.has(RUNNING));
        assert!(word.has(SLAVE));
        word.clear(SLAVE);
        assert!(!word.has(SLAVE));
        assert!(word.has(RUNNING));
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(0), "Down");
        assert_eq!(describe(MASTER | RUNNING), "Master, Running");
        assert_eq!(describe(SLAVE | RUNNING), "Slave, Running");
    }
}
