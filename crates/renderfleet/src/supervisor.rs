mod dispatcher;
mod events;
mod slot;

use crate::reaper::IdleReaper;
use backon::{ExponentialBuilder, Retryable};
use renderfleet_core::{
    ChannelError, ControlChannel, FleetConfig, FleetError, LaunchProfile, PortAllocator,
    ProcessHandle, ProcessManager, ProcessRecord, RenderingCapabilities, SessionStatus,
};
use slot::SessionSlot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Handle<M> = <M as renderfleet_core::ProcessLifecycle>::Handle;
type Sessions<M> = HashMap<String, Arc<SessionSlot<Handle<M>>>>;

/// Owns the session-id → engine process registry.
///
/// Operations on one session id are strictly ordered through that session's
/// own lock; operations on different ids never wait on each other. The
/// supervisor is cheap to clone and every clone shares the same registry.
pub struct EngineSupervisor<M: ProcessManager + 'static, C: ControlChannel + 'static> {
    shared: Arc<Shared<M, C>>,
}

impl<M: ProcessManager + 'static, C: ControlChannel + 'static> Clone for EngineSupervisor<M, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct Shared<M: ProcessManager + 'static, C: ControlChannel + 'static> {
    config: FleetConfig,
    manager: Arc<M>,
    channel: Arc<C>,
    ports: Arc<PortAllocator>,
    profile: RwLock<Arc<LaunchProfile>>,
    sessions: Mutex<Sessions<M>>,
    events: renderfleet_core::ProcessEventSender,
    next_instance: AtomicU64,
    shutdown: CancellationToken,
}

impl<M: ProcessManager + 'static, C: ControlChannel + 'static> Drop for Shared<M, C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Reservation<H> {
    /// A record already exists under this id
    Existing(Arc<SessionSlot<H>>),
    /// A new `starting` record was inserted; its operation lock is held
    Fresh(Arc<SessionSlot<H>>, OwnedMutexGuard<()>),
}

#[derive(Debug, thiserror::Error)]
enum ReadinessError {
    #[error("engine {0} before becoming ready")]
    Exited(String),
    #[error("control channel never became ready: {0}")]
    NotReady(#[from] ChannelError),
}

impl ReadinessError {
    fn is_retryable(&self) -> bool {
        matches!(self, ReadinessError::NotReady(_))
    }
}

impl<M: ProcessManager + 'static, C: ControlChannel + 'static> EngineSupervisor<M, C> {
    /// Build a supervisor and start its lifecycle event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: FleetConfig,
        manager: Arc<M>,
        channel: Arc<C>,
        capabilities: RenderingCapabilities,
    ) -> Result<Self, FleetError> {
        config.validate()?;

        let ports = Arc::new(PortAllocator::new(config.base_port, config.max_instances)?);
        let profile = Arc::new(LaunchProfile::resolve(&config, capabilities));
        let (events, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        info!(
            base_port = config.base_port,
            max_instances = ports.capacity(),
            backend = %profile.backend,
            "Starting engine supervisor for {}",
            config.executable
        );

        let shared = Arc::new(Shared {
            config,
            manager,
            channel,
            ports,
            profile: RwLock::new(profile),
            sessions: Mutex::new(HashMap::new()),
            events,
            next_instance: AtomicU64::new(1),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(events::run(Arc::downgrade(&shared), receiver, shutdown));

        Ok(Self { shared })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.shared.config
    }

    /// Rendering capabilities new engines are launched with
    pub fn capabilities(&self) -> RenderingCapabilities {
        self.shared.profile().capabilities
    }

    /// Swap the launch profile; only engines created afterwards see it
    pub fn set_capabilities(&self, capabilities: RenderingCapabilities) {
        let profile = Arc::new(LaunchProfile::resolve(&self.shared.config, capabilities));
        info!(backend = %profile.backend, "Updated rendering launch profile");
        *self
            .shared
            .profile
            .write()
            .unwrap_or_else(|e| e.into_inner()) = profile;
    }

    /// Ports currently free for new engines
    pub fn available_ports(&self) -> usize {
        self.shared.ports.available()
    }

    /// Start an engine for `session_id` (or a generated id) and wait until
    /// its control channel answers.
    ///
    /// A live record under the same id is returned as is. On any startup
    /// failure the process is killed, the port released and no record kept.
    pub async fn create(&self, session_id: Option<&str>) -> Result<ProcessRecord, FleetError> {
        let id = match session_id {
            Some(id) if id.trim().is_empty() => {
                return Err(FleetError::ConfigurationError(
                    "session id must not be empty".to_string(),
                ));
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let (slot, _ops) = loop {
            match self.shared.reserve(&id)? {
                Reservation::Fresh(slot, ops) => break (slot, ops),
                Reservation::Existing(slot) => {
                    let _ops = slot.lock_ops().await;
                    if !self.shared.is_current(&id, &slot) {
                        continue;
                    }
                    if slot.status().is_live() {
                        debug!(session = %id, "Engine already exists, reusing it");
                        return Ok(slot.snapshot());
                    }
                    // A retained error record gives way to a fresh engine
                    self.shared.purge(&id, &slot).await;
                }
            }
        };

        self.shared.start_engine(&id, &slot).await
    }

    /// Current record for `session_id`, including retained `error` records
    pub fn get(&self, session_id: &str) -> Option<ProcessRecord> {
        self.shared.slot(session_id).map(|slot| slot.snapshot())
    }

    /// Point-in-time snapshot of every record
    pub fn list_all(&self) -> Vec<ProcessRecord> {
        let slots: Vec<_> = self.shared.sessions().values().cloned().collect();
        let mut records: Vec<_> = slots.iter().map(|slot| slot.snapshot()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Stop the engine for `session_id`.
    ///
    /// Returns `Ok(true)` when a running engine was stopped. A retained
    /// `error` record is purged and reported as `Ok(false)`.
    pub async fn terminate(&self, session_id: &str) -> Result<bool, FleetError> {
        self.shared.terminate_where(session_id, |_, _| true).await
    }

    /// Terminate every running engine idle for at least `idle_timeout`
    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        IdleReaper::sweep(self, idle_timeout, Instant::now()).await
    }

    /// Ids of running sessions idle for at least `idle_timeout` at `now`
    pub(crate) fn idle_sessions(&self, idle_timeout: Duration, now: Instant) -> Vec<String> {
        let slots: Vec<_> = self
            .shared
            .sessions()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| slot.with_state(|s| is_idle(s, idle_timeout, now)))
            .map(|(id, _)| id)
            .collect()
    }

    /// Terminate `session_id` if it is still idle once its lock is held
    pub(crate) async fn terminate_idle(
        &self,
        session_id: &str,
        idle_timeout: Duration,
        now: Instant,
    ) -> Result<bool, FleetError> {
        self.shared
            .terminate_where(session_id, |status, last_active| {
                status == SessionStatus::Running
                    && now.saturating_duration_since(last_active) >= idle_timeout
            })
            .await
    }

    /// Drop `error` records that ended at least `retention` before `now`
    pub async fn prune_terminal(&self, retention: Duration, now: Instant) -> usize {
        let expired: Vec<_> = self
            .shared
            .sessions()
            .iter()
            .filter(|(_, slot)| {
                slot.with_state(|s| {
                    s.record.status.is_terminal()
                        && s.ended_at
                            .is_some_and(|ended| now.saturating_duration_since(ended) >= retention)
                })
            })
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut pruned = 0;
        for (id, slot) in expired {
            // Busy slots are picked up on a later sweep
            let Some(_ops) = slot.try_lock_ops() else {
                continue;
            };
            if self.shared.is_current(&id, &slot) && slot.status().is_terminal() {
                self.shared.purge(&id, &slot).await;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!("Pruned {} terminal session records", pruned);
        }
        pruned
    }

    /// Stop every engine and the event loop
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        info!("Shutting down engine supervisor");
        let ids: Vec<String> = self.shared.sessions().keys().cloned().collect();

        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                warn!(session = %id, "Error terminating engine during shutdown: {}", e);
                failures.push(id);
            }
        }

        self.shared.manager.cleanup().await?;
        self.shared.shutdown.cancel();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Other(anyhow::anyhow!(
                "failed to stop engines for sessions: {}",
                failures.join(", ")
            )))
        }
    }
}

fn is_idle<H>(state: &slot::SlotState<H>, idle_timeout: Duration, now: Instant) -> bool {
    state.record.status == SessionStatus::Running
        && now.saturating_duration_since(state.last_active) >= idle_timeout
}

impl<M: ProcessManager + 'static, C: ControlChannel + 'static> Shared<M, C> {
    fn sessions(&self) -> MutexGuard<'_, Sessions<M>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn profile(&self) -> Arc<LaunchProfile> {
        Arc::clone(&self.profile.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot<Handle<M>>>> {
        self.sessions().get(session_id).cloned()
    }

    /// Whether `slot` is still the registered entry for `session_id`
    fn is_current(&self, session_id: &str, slot: &Arc<SessionSlot<Handle<M>>>) -> bool {
        self.sessions()
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn remove_if_current(&self, session_id: &str, slot: &Arc<SessionSlot<Handle<M>>>) {
        let mut sessions = self.sessions();
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(session_id);
        }
    }

    /// Find the existing record or insert a `starting` one, all under the
    /// registry lock so the instance limit and port pool stay consistent.
    fn reserve(&self, session_id: &str) -> Result<Reservation<Handle<M>>, FleetError> {
        let mut sessions = self.sessions();
        if let Some(slot) = sessions.get(session_id) {
            return Ok(Reservation::Existing(Arc::clone(slot)));
        }

        let live = sessions
            .values()
            .filter(|slot| slot.status().is_live())
            .count();
        if live >= self.config.max_instances as usize {
            warn!(session = %session_id, live, "Refusing new engine: instance limit reached");
            return Err(FleetError::ResourceExhausted(format!(
                "maximum of {} engine instances reached",
                self.config.max_instances
            )));
        }

        let lease = self.ports.lease()?;
        let port = lease.port();
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let record = ProcessRecord::new(session_id, port, self.profile().backend);
        let slot = Arc::new(SessionSlot::new(record, instance, lease));
        let ops = slot.try_lock_ops().ok_or_else(|| {
            FleetError::Other(anyhow::anyhow!("fresh session slot was already locked"))
        })?;

        sessions.insert(session_id.to_string(), Arc::clone(&slot));
        Ok(Reservation::Fresh(slot, ops))
    }

    async fn start_engine(
        &self,
        session_id: &str,
        slot: &Arc<SessionSlot<Handle<M>>>,
    ) -> Result<ProcessRecord, FleetError> {
        let profile = self.profile();
        let spec = slot.with_state(|s| profile.launch_spec(session_id, s.instance, s.record.port));

        info!(session = %session_id, port = spec.port, "Starting engine");

        let handle = match self.manager.spawn_process(&spec, self.events.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                return Err(self
                    .rollback(session_id, slot, None, format!("{e:#}"))
                    .await);
            }
        };
        let pid = handle.get_pid();
        slot.with_state(|s| s.record.pid = pid.map(|p| p.0));
        debug!(session = %session_id, pid = ?pid, "Spawned {}", handle.get_command());

        if let Err(e) = self.await_readiness(&handle, spec.port).await {
            return Err(self
                .rollback(session_id, slot, Some(handle), e)
                .await);
        }

        let record = slot.with_state(|s| {
            s.record.transition(SessionStatus::Running)?;
            s.touch(Instant::now());
            s.handle = Some(handle);
            Ok::<_, FleetError>(s.record.clone())
        })?;

        info!(session = %session_id, port = spec.port, pid = ?pid, "Engine is ready");
        Ok(record)
    }

    async fn await_readiness(&self, handle: &Handle<M>, port: u16) -> Result<(), String> {
        let readiness = &self.config.readiness;
        let poll = ExponentialBuilder::default()
            .with_factor(1.0)
            .with_min_delay(readiness.poll_interval())
            .with_max_delay(readiness.poll_interval())
            .with_max_times(readiness.max_attempts as usize);

        let channel = &self.channel;
        let attempt = || async move {
            match handle.try_wait().await {
                Ok(Some(outcome)) => return Err(ReadinessError::Exited(outcome.to_string())),
                Ok(None) => {}
                Err(e) => return Err(ReadinessError::Exited(format!("could not be polled ({e:#})"))),
            }
            channel.probe(port).await.map_err(ReadinessError::from)
        };

        let startup_timeout = self.config.startup_timeout();
        match tokio::time::timeout(
            startup_timeout,
            attempt.retry(poll).when(ReadinessError::is_retryable),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "engine not ready within {}ms",
                startup_timeout.as_millis()
            )),
        }
    }

    /// Undo a failed start: kill the process, free the port, forget the record
    async fn rollback(
        &self,
        session_id: &str,
        slot: &Arc<SessionSlot<Handle<M>>>,
        handle: Option<Handle<M>>,
        reason: String,
    ) -> FleetError {
        if let Some(mut handle) = handle {
            let result = self.manager.force_kill(&mut handle).await;
            if !result.is_gone() {
                warn!(session = %session_id, "Failed to kill engine after startup failure: {:?}", result);
            }
            let grace = Some(self.config.termination_grace());
            if self.manager.wait_for_exit(&mut handle, grace).await.is_err() {
                warn!(session = %session_id, "Engine did not exit after startup failure");
            }
        }

        slot.with_state(|s| {
            if let Err(e) = s.record.fail(reason.clone()) {
                debug!(session = %session_id, "{}", e);
            }
            s.end(Instant::now());
        });
        self.remove_if_current(session_id, slot);

        warn!(session = %session_id, "Engine failed to start: {}", reason);
        FleetError::SpawnFailure(reason)
    }

    /// Remove a record, killing any process it still holds. Caller holds
    /// the slot's operation lock.
    async fn purge(&self, session_id: &str, slot: &Arc<SessionSlot<Handle<M>>>) {
        let handle = slot.with_state(|s| {
            s.end(Instant::now());
            s.handle.take()
        });
        if let Some(mut handle) = handle {
            if handle.is_running().await {
                let result = self.manager.force_kill(&mut handle).await;
                debug!(session = %session_id, "Killed leftover engine: {:?}", result);
            }
        }
        self.remove_if_current(session_id, slot);
        debug!(session = %session_id, "Purged session record");
    }

    /// Terminate `session_id` if `should_stop(status, last_active)` holds once
    /// its operation lock is acquired. A retained `error` record is purged
    /// only when `should_stop` accepts it.
    async fn terminate_where(
        &self,
        session_id: &str,
        should_stop: impl Fn(SessionStatus, Instant) -> bool,
    ) -> Result<bool, FleetError> {
        let Some(slot) = self.slot(session_id) else {
            return Ok(false);
        };
        let _ops = slot.lock_ops().await;
        if !self.is_current(session_id, &slot) {
            return Ok(false);
        }

        let (status, last_active) = slot.with_state(|s| (s.record.status, s.last_active));
        if !should_stop(status, last_active) {
            return Ok(false);
        }
        if status != SessionStatus::Running {
            // Starting cannot be observed here: create holds the lock until
            // it settles. Only retained error records remain.
            self.purge(session_id, &slot).await;
            return Ok(false);
        }

        let handle = slot.with_state(|s| s.handle.take());
        let (result, handle) = match handle {
            Some(mut handle) => {
                let result = self
                    .manager
                    .terminate_completely(&mut handle, self.config.termination_grace())
                    .await;
                (result, Some(handle))
            }
            None => (renderfleet_core::TerminationResult::Success, None),
        };

        if result.is_gone() {
            slot.with_state(|s| {
                s.record.transition(SessionStatus::Terminated)?;
                s.end(Instant::now());
                Ok::<_, FleetError>(())
            })?;
            self.remove_if_current(session_id, &slot);
            info!(session = %session_id, "Engine terminated");
            return Ok(true);
        }

        // Keep the port leased: the process may still be bound to it
        let message = format!("termination failed: {result:?}");
        slot.with_state(|s| {
            let _ = s.record.fail(message.clone());
            s.ended_at = Some(Instant::now());
            s.handle = handle;
        });
        warn!(session = %session_id, "{}", message);
        Err(FleetError::Other(anyhow::anyhow!(
            "failed to stop engine for session {session_id}: {message}"
        )))
    }
}
