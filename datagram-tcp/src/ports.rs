//! Local port bookkeeping.
//!
//! A listening connection hands every accepted peer to a new connection on a
//! fresh local port.  [`PortAllocator`] is the process-wide registry of ports
//! in use; it is shared through an `Arc` and injected into every connection.
//! Ports are handed out as [`PortLease`]s which give the port back on drop.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

/// Default range for ports handed out by [`PortAllocator::allocate`].
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} is already in use")]
    InUse(u16),
    #[error("no free port left in the allocator range")]
    Exhausted,
}

#[derive(Debug)]
struct Registry {
    used: BTreeSet<u16>,
    /// Next candidate for `allocate`; wraps within the range.
    cursor: u16,
}

/// Registry of local ports in use.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    registry: Mutex<Registry>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(EPHEMERAL_PORTS)
    }
}

impl PortAllocator {
    /// Allocator that hands out ports from `range`.  An inverted range is
    /// taken end-first, so `60000..=50000` covers the same ports as
    /// `50000..=60000`.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let (a, b) = range.into_inner();
        let (start, end) = (a.min(b), a.max(b));
        Self {
            range: start..=end,
            registry: Mutex::new(Registry {
                used: BTreeSet::new(),
                cursor: start,
            }),
        }
    }

    /// Claim a specific port, e.g. a well-known listening port.
    pub fn reserve(self: &Arc<Self>, port: u16) -> Result<PortLease, PortError> {
        let mut reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !reg.used.insert(port) {
            return Err(PortError::InUse(port));
        }
        Ok(PortLease {
            port,
            allocator: Arc::clone(self),
        })
    }

    /// Claim the next free port in the allocator range.
    pub fn allocate(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let mut reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let (start, end) = (*self.range.start(), *self.range.end());
        let span = u32::from(end - start) + 1;

        for _ in 0..span {
            let candidate = reg.cursor;
            reg.cursor = if candidate >= end { start } else { candidate + 1 };
            if reg.used.insert(candidate) {
                return Ok(PortLease {
                    port: candidate,
                    allocator: Arc::clone(self),
                });
            }
        }
        Err(PortError::Exhausted)
    }

    /// `true` while some lease holds `port`.
    pub fn is_used(&self, port: u16) -> bool {
        let reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        reg.used.contains(&port)
    }

    /// Number of ports currently leased.
    pub fn in_use(&self) -> usize {
        let reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        reg.used.len()
    }

    fn release(&self, port: u16) {
        let mut reg = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        reg.used.remove(&port);
    }
}

/// A claimed local port.  Dropping the lease frees the port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
        log::trace!("[ports] released {}", self.port);
    }
}
