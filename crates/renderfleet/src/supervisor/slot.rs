use renderfleet_core::{PortLease, ProcessRecord, SessionStatus};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

/// Mutable state of one session, only touched under the slot's state mutex
pub(crate) struct SlotState<H> {
    pub record: ProcessRecord,
    pub instance: u64,
    pub last_active: Instant,
    pub ended_at: Option<Instant>,
    pub lease: Option<PortLease>,
    pub handle: Option<H>,
}

impl<H> SlotState<H> {
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_active {
            self.last_active = now;
        }
        self.record.touch(SystemTime::now());
    }

    /// Drop the port and mark the moment the record went terminal
    pub fn end(&mut self, now: Instant) {
        self.lease.take();
        self.ended_at = Some(now);
    }
}

/// Registry entry for one session id.
///
/// `ops` serializes create/terminate/crash handling for this id; `state`
/// is a short-lived lock for reads and small updates and is never held
/// across an await point.
pub(crate) struct SessionSlot<H> {
    ops: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SlotState<H>>,
}

impl<H> SessionSlot<H> {
    pub fn new(record: ProcessRecord, instance: u64, lease: PortLease) -> Self {
        Self {
            ops: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SlotState {
                record,
                instance,
                last_active: Instant::now(),
                ended_at: None,
                lease: Some(lease),
                handle: None,
            }),
        }
    }

    pub async fn lock_ops(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.ops).lock_owned().await
    }

    pub fn try_lock_ops(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.ops).try_lock_owned().ok()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SlotState<H>) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn snapshot(&self) -> ProcessRecord {
        self.with_state(|s| s.record.clone())
    }

    pub fn status(&self) -> SessionStatus {
        self.with_state(|s| s.record.status)
    }
}
