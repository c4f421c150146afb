/// Data-port allocation for transfer workers.
///
/// Ports are drawn uniformly among the free ports of a fixed range. A port
/// stays reserved for as long as its `PortLease` lives, so two concurrent
/// transfers never get the same port from one pool.
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

pub struct PortPool {
    range: RangeInclusive<u16>,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// Pool over `range`. An empty range yields a pool that never leases.
    pub fn new(range: RangeInclusive<u16>) -> Arc<Self> {
        Arc::new(Self {
            range,
            in_use: Mutex::new(HashSet::new()),
        })
    }

    /// Reserve a random free port, or `None` if all are taken.
    pub fn lease(self: &Arc<Self>) -> Option<PortLease> {
        let mut in_use = self.lock();
        let total = self.range.clone().count();
        let free = total.saturating_sub(in_use.len());
        if free == 0 {
            return None;
        }

        let pick = rand::rng().random_range(0..free);
        let port = self
            .range
            .clone()
            .filter(|p| !in_use.contains(p))
            .nth(pick)?;
        in_use.insert(port);

        Some(PortLease {
            pool: Arc::clone(self),
            port,
        })
    }

    /// Number of ports currently leased.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // The set stays consistent even if a holder panicked.
        self.in_use.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reserved data port, returned to its pool on drop.
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}
