#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use renderfleet::{
    ChannelError, CommandRequest, ControlChannel, EngineReply, EngineSupervisor, ExitOutcome,
    FleetConfig, LaunchSpec, ProcessEvent, ProcessEventKind, ProcessEventSender, ProcessHandle,
    ProcessId, ProcessLifecycle, ProcessManager, ProcessTermination, RENDERING_UNAVAILABLE,
    RenderingCapabilities, TerminationResult,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// How a fake engine behaves once spawned
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Startup {
    Ready,
    NeverReady,
    ExitImmediately(i32),
    SpawnError,
    /// Ready, but survives every signal
    Unkillable,
}

struct LiveEngine {
    session_id: String,
    instance: u64,
    port: u16,
    ready: bool,
    unkillable: bool,
    exit: watch::Sender<Option<ExitOutcome>>,
    events: ProcessEventSender,
}

#[derive(Default)]
struct EnginesState {
    default_startup: Option<Startup>,
    startup: HashMap<String, Startup>,
    live: HashMap<u32, LiveEngine>,
    spawned: Vec<LaunchSpec>,
    commands: Vec<(u16, CommandRequest)>,
    next_pid: u32,
}

/// Shared world of simulated engine processes
#[derive(Default)]
pub struct FakeEngines {
    state: Mutex<EnginesState>,
}

impl FakeEngines {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EnginesState> {
        self.state.lock().unwrap()
    }

    pub fn set_default_startup(&self, startup: Startup) {
        self.state().default_startup = Some(startup);
    }

    pub fn set_startup(&self, session_id: &str, startup: Startup) {
        self.state().startup.insert(session_id.to_string(), startup);
    }

    pub fn spawned(&self) -> Vec<LaunchSpec> {
        self.state().spawned.clone()
    }

    pub fn spawn_count(&self, session_id: &str) -> usize {
        self.state()
            .spawned
            .iter()
            .filter(|spec| spec.session_id == session_id)
            .count()
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_live(&self, pid: u32) -> bool {
        self.state().live.contains_key(&pid)
    }

    pub fn commands(&self) -> Vec<(u16, CommandRequest)> {
        self.state().commands.clone()
    }

    fn is_ready(&self, port: u16) -> bool {
        self.state()
            .live
            .values()
            .any(|engine| engine.port == port && engine.ready)
    }

    /// Simulate the engine of `session_id` dying on its own
    pub fn crash(&self, session_id: &str, code: i32) {
        let pid = self
            .state()
            .live
            .iter()
            .find(|(_, engine)| engine.session_id == session_id)
            .map(|(pid, _)| *pid);
        if let Some(pid) = pid {
            self.exit(pid, ExitOutcome::code(code));
        }
    }

    fn exit(&self, pid: u32, outcome: ExitOutcome) -> bool {
        let Some(engine) = self.state().live.remove(&pid) else {
            return false;
        };
        engine.exit.send_replace(Some(outcome));
        let _ = engine.events.send(ProcessEvent {
            session_id: engine.session_id,
            instance: engine.instance,
            pid: Some(ProcessId(pid)),
            kind: ProcessEventKind::Exited(outcome),
        });
        true
    }

    fn signal(&self, pid: u32, signal: i32) -> TerminationResult {
        let unkillable = match self.state().live.get(&pid) {
            Some(engine) => engine.unkillable,
            None => return TerminationResult::ProcessNotFound,
        };
        if !unkillable {
            self.exit(pid, ExitOutcome::signal(signal));
        }
        TerminationResult::Success
    }
}

pub struct FakeHandle {
    pid: u32,
    command: String,
    exit: watch::Receiver<Option<ExitOutcome>>,
    engines: Arc<FakeEngines>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        Some(ProcessId(self.pid))
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    async fn try_wait(&self) -> Result<Option<ExitOutcome>> {
        Ok(*self.exit.borrow())
    }

    async fn wait(&mut self) -> Result<ExitOutcome> {
        let outcome = *self
            .exit
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| anyhow!("engine watch closed"))?;
        outcome.ok_or_else(|| anyhow!("engine exit missing"))
    }

    async fn kill(&mut self) -> Result<()> {
        self.engines.signal(self.pid, 9);
        Ok(())
    }
}

/// Process manager that simulates engines instead of spawning them
pub struct FakeProcessManager {
    engines: Arc<FakeEngines>,
}

impl FakeProcessManager {
    pub fn with_engines(engines: Arc<FakeEngines>) -> Self {
        Self { engines }
    }
}

#[async_trait]
impl ProcessLifecycle for FakeProcessManager {
    type Handle = FakeHandle;

    async fn spawn_process(&self, spec: &LaunchSpec, events: ProcessEventSender) -> Result<FakeHandle> {
        let mut state = self.engines.state();
        state.spawned.push(spec.clone());
        let startup = state
            .startup
            .get(&spec.session_id)
            .copied()
            .or(state.default_startup)
            .unwrap_or(Startup::Ready);

        if startup == Startup::SpawnError {
            return Err(anyhow!("No such file or directory: {}", spec.command));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (exit_tx, exit_rx) = watch::channel(None);
        state.live.insert(
            pid,
            LiveEngine {
                session_id: spec.session_id.clone(),
                instance: spec.instance,
                port: spec.port,
                ready: matches!(startup, Startup::Ready | Startup::Unkillable),
                unkillable: startup == Startup::Unkillable,
                exit: exit_tx,
                events,
            },
        );
        drop(state);

        if let Startup::ExitImmediately(code) = startup {
            self.engines.exit(pid, ExitOutcome::code(code));
        }

        Ok(FakeHandle {
            pid,
            command: spec.command.clone(),
            exit: exit_rx,
            engines: Arc::clone(&self.engines),
        })
    }
}

#[async_trait]
impl ProcessTermination for FakeProcessManager {
    async fn terminate_gracefully(&self, handle: &mut FakeHandle) -> TerminationResult {
        self.engines.signal(handle.pid, 15)
    }

    async fn force_kill(&self, handle: &mut FakeHandle) -> TerminationResult {
        self.engines.signal(handle.pid, 9)
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    fn new() -> Self {
        Self::with_engines(FakeEngines::new())
    }
}

/// Control channel answering on behalf of the fake engines
pub struct FakeChannel {
    engines: Arc<FakeEngines>,
    delay: Mutex<Duration>,
}

impl FakeChannel {
    pub fn new(engines: Arc<FakeEngines>) -> Self {
        Self {
            engines,
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every command take `delay` before the engine answers
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn probe(&self, port: u16) -> Result<(), ChannelError> {
        if self.engines.is_ready(port) {
            Ok(())
        } else {
            Err(ChannelError::Connect("connection refused".to_string()))
        }
    }

    async fn execute(&self, port: u16, request: &CommandRequest) -> Result<EngineReply, ChannelError> {
        self.engines
            .state()
            .commands
            .push((port, request.clone()));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.engines.is_ready(port) {
            return Err(ChannelError::Connect("connection refused".to_string()));
        }

        Ok(match request.command.as_str() {
            "fail" => EngineReply::failed("engine blew up"),
            "render" => EngineReply {
                error_kind: Some(RENDERING_UNAVAILABLE.to_string()),
                ..EngineReply::failed("no rendering backend")
            },
            command => EngineReply::ok(Some(json!({ "echo": command }))),
        })
    }
}

pub type TestSupervisor = EngineSupervisor<FakeProcessManager, FakeChannel>;

pub struct Harness {
    pub supervisor: TestSupervisor,
    pub engines: Arc<FakeEngines>,
    pub channel: Arc<FakeChannel>,
}

pub fn config(base_port: u16, max_instances: u16) -> FleetConfig {
    FleetConfig::builder()
        .executable("/opt/engine/bin/engine")
        .args(["-q"])
        .base_port(base_port)
        .max_instances(max_instances)
        .startup_timeout_ms(2_000u64)
        .termination_grace_ms(200u64)
        .readiness(renderfleet::ReadinessConfig::eager())
        .build()
        .unwrap()
}

pub fn harness_with(config: FleetConfig, capabilities: RenderingCapabilities) -> Harness {
    init_tracing();
    let engines = FakeEngines::new();
    let manager = Arc::new(FakeProcessManager::with_engines(Arc::clone(&engines)));
    let channel = Arc::new(FakeChannel::new(Arc::clone(&engines)));
    let supervisor =
        EngineSupervisor::new(config, manager, Arc::clone(&channel), capabilities).unwrap();
    Harness {
        supervisor,
        engines,
        channel,
    }
}

pub fn harness(base_port: u16, max_instances: u16) -> Harness {
    harness_with(
        config(base_port, max_instances),
        RenderingCapabilities::new(true, false),
    )
}

/// Poll `check` until it holds, advancing time as needed
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
