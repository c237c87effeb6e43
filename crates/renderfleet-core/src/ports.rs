use crate::error::FleetError;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bounded pool of control-channel ports `[base, base + capacity)`
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    capacity: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, capacity: u16) -> Result<Self, FleetError> {
        if base.checked_add(capacity).is_none() {
            return Err(FleetError::ConfigurationError(format!(
                "port range {base}+{capacity} overflows u16"
            )));
        }
        Ok(Self {
            base,
            capacity,
            allocated: Mutex::new(BTreeSet::new()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        // The set is never left half-updated, so a poisoned guard is still usable
        self.allocated.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand out the lowest free port
    pub fn allocate(&self) -> Result<u16, FleetError> {
        let mut allocated = self.slots();
        let port = (self.base..self.base + self.capacity)
            .find(|port| !allocated.contains(port))
            .ok_or_else(|| {
                FleetError::ResourceExhausted(format!(
                    "all {} ports from {} are in use",
                    self.capacity, self.base
                ))
            })?;
        allocated.insert(port);
        Ok(port)
    }

    /// Return a port to the pool. Unknown or already free ports are ignored.
    pub fn release(&self, port: u16) {
        if self.slots().remove(&port) {
            tracing::debug!(port, "Released port");
        }
    }

    /// Allocate a port wrapped in a guard that releases it exactly once
    pub fn lease(self: &Arc<Self>) -> Result<PortLease, FleetError> {
        let port = self.allocate()?;
        Ok(PortLease {
            pool: Arc::clone(self),
            port,
            released: false,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        self.slots().len()
    }

    pub fn available(&self) -> usize {
        self.capacity as usize - self.allocated()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.slots().contains(&port)
    }
}

/// Exclusive ownership of one allocated port
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortAllocator>,
    port: u16,
    released: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.port);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_once();
    }
}
