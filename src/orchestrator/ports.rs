//! Instance port allocation.

use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Hands out ports from a configured range. A port stays reserved until it
/// is explicitly released on stop, delete, or crash.
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// `start..end`, end exclusive.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// First port in the range that is neither reserved by us nor held by
    /// another listener on the host.
    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.allocated.lock();
        for port in self.start..self.end {
            if allocated.contains(&port) {
                continue;
            }
            // Probe the host: something outside our registry may hold it.
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(Error::ResourceAllocation(format!(
            "no free port in range {}..{}",
            self.start, self.end
        )))
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    /// Re-reserve a specific port, e.g. for startup recovery of a persisted
    /// assignment. Falls back to scanning when the port is taken.
    pub fn reserve_or_allocate(&self, preferred: Option<u16>) -> Result<u16> {
        if let Some(port) = preferred {
            let mut allocated = self.allocated.lock();
            if port >= self.start
                && port < self.end
                && !allocated.contains(&port)
                && TcpListener::bind(("0.0.0.0", port)).is_ok()
            {
                allocated.insert(port);
                return Ok(port);
            }
        }
        self.allocate()
    }
}
