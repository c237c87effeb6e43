use anyhow::Result;
use async_trait::async_trait;
use renderfleet_core::{
    ExitOutcome, LaunchSpec, ProcessEventSender, ProcessHandle, ProcessId, ProcessLifecycle,
    ProcessManager, ProcessTermination, TerminationResult,
};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use crate::output::{PumpTarget, pump};
    use anyhow::Context;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use renderfleet_core::{OutputStream, ProcessEvent, ProcessEventKind};
    use std::collections::HashMap;
    use std::process::Stdio;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use sysinfo::System;
    use tokio::process::Command;
    use tokio::sync::watch;
    use tracing::{info, warn};

    type ActiveProcesses = Arc<Mutex<HashMap<ProcessId, String>>>;

    /// Unix-specific process handle.
    ///
    /// The child itself is owned by a watcher task that reaps it and publishes
    /// the exit outcome, so the handle only needs the pid and a watch receiver.
    pub struct UnixProcessHandle {
        pid: Option<ProcessId>,
        command: String,
        exit: watch::Receiver<Option<ExitOutcome>>,
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.pid
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        async fn try_wait(&self) -> Result<Option<ExitOutcome>> {
            Ok(*self.exit.borrow())
        }

        async fn wait(&mut self) -> Result<ExitOutcome> {
            let outcome = *self.exit.wait_for(Option::is_some).await?;
            outcome.ok_or_else(|| anyhow::anyhow!("Process watcher ended without an exit status"))
        }

        async fn kill(&mut self) -> Result<()> {
            if self.exit.borrow().is_some() {
                return Ok(());
            }
            let pid = self
                .pid
                .ok_or_else(|| anyhow::anyhow!("Process has no PID"))?;
            match signal::kill(NixPid::from_raw(pid.0 as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(anyhow::anyhow!("Failed to kill process {}: {}", pid, e)),
            }
        }
    }

    /// Unix-specific process manager with process group and tree termination
    pub struct UnixProcessManager {
        system: Mutex<System>,
        active: ActiveProcesses,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            <Self as ProcessManager>::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            spec: &LaunchSpec,
            events: ProcessEventSender,
        ) -> Result<UnixProcessHandle> {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }
            for (key, value) in &spec.env {
                cmd.env(key, value);
            }

            // Own process group so the engine and its helpers stop together
            cmd.process_group(0);

            let mut child = cmd
                .spawn()
                .with_context(|| format!("Failed to start engine command: {}", spec.command))?;
            let pid = child.id().map(ProcessId::from);

            info!(
                session = %spec.session_id,
                port = spec.port,
                pid = ?pid,
                "Spawned Unix process: {} with args: {:?}",
                spec.command,
                spec.args
            );

            let target = PumpTarget {
                session_id: spec.session_id.clone(),
                instance: spec.instance,
                pid,
                events: events.clone(),
            };
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump(stdout, OutputStream::Stdout, target.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump(stderr, OutputStream::Stderr, target));
            }

            if let Some(pid) = pid {
                let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                active.insert(pid, format!("{}:{}", spec.session_id, spec.command));
            }

            let (exit_tx, exit_rx) = watch::channel(None);
            let active = Arc::clone(&self.active);
            let session_id = spec.session_id.clone();
            let instance = spec.instance;
            tokio::spawn(async move {
                let outcome = match child.wait().await {
                    Ok(status) => ExitOutcome::from(status),
                    Err(e) => {
                        warn!(session = %session_id, "Error waiting for engine process: {}", e);
                        ExitOutcome {
                            code: None,
                            signal: None,
                        }
                    }
                };
                if let Some(pid) = pid {
                    active.lock().unwrap_or_else(|e| e.into_inner()).remove(&pid);
                }
                info!(session = %session_id, pid = ?pid, "Engine process {}", outcome);

                exit_tx.send_replace(Some(outcome));
                let _ = events.send(ProcessEvent {
                    session_id,
                    instance,
                    pid,
                    kind: ProcessEventKind::Exited(outcome),
                });
            });

            Ok(UnixProcessHandle {
                pid,
                command: spec.command.clone(),
                exit: exit_rx,
            })
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut UnixProcessHandle) -> TerminationResult {
            match handle.get_pid() {
                Some(pid) => Self::signal_group(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut UnixProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };
            let result = Self::signal_group(pid, Signal::SIGKILL);
            if let Err(e) = handle.kill().await {
                warn!("Handle kill cleanup failed: {}", e);
            }
            result
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            info!("Terminating process tree for root PID {}", root_pid);

            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Failed to find child processes for PID {}: {}", root_pid, e);
                    return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
                }
            };

            if !children.is_empty() {
                info!("Found {} child processes to terminate", children.len());

                // Deepest descendants first
                for child_pid in &children {
                    match Self::terminate_single_process(*child_pid).await {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!("Failed to terminate child process {}: {:?}", child_pid, result);
                        }
                    }
                }
            }

            Self::terminate_single_process(root_pid).await
        }
    }

    impl UnixProcessManager {
        /// Signal the process group led by `pid`, falling back to the process itself
        fn signal_group(pid: ProcessId, sig: Signal) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            let result = match signal::killpg(nix_pid, sig) {
                Err(nix::errno::Errno::ESRCH) => signal::kill(nix_pid, sig),
                other => other,
            };

            match result {
                Ok(()) => {
                    info!("Sent {} to process group {}", sig, pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to signal process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send {} to process {}: {}", sig, pid, e);
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }

        /// Terminate a single process by PID with escalation
        async fn terminate_single_process(pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            match signal::kill(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    match signal::kill(nix_pid, Signal::SIGKILL) {
                        Ok(()) | Err(nix::errno::Errno::ESRCH) => TerminationResult::Success,
                        Err(e) => {
                            warn!("Failed to kill process {}: {}", pid, e);
                            TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to terminate process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        /// Recursively find all descendants, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }

        fn active_pids(&self) -> Vec<ProcessId> {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().copied().collect()
        }

        /// Number of spawned processes that have not exited yet
        pub fn active_count(&self) -> usize {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    #[async_trait]
    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: Mutex::new(System::new()),
                active: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        async fn cleanup(&self) -> Result<()> {
            for pid in self.active_pids() {
                match self.terminate_process_tree(pid).await {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {
                        info!("Terminated process tree for PID {}", pid);
                    }
                    other => warn!("Failed to terminate process {}: {:?}", pid, other),
                }
            }
            self.active.lock().unwrap_or_else(|e| e.into_inner()).clear();
            Ok(())
        }
    }

    impl Drop for UnixProcessManager {
        fn drop(&mut self) {
            let active_processes = self.active_pids();
            if active_processes.is_empty() {
                return;
            }

            warn!(
                "Emergency cleanup: killing {} engine processes during drop",
                active_processes.len()
            );
            for pid in active_processes {
                let nix_pid = NixPid::from_raw(pid.0 as i32);
                if let Err(e) = signal::killpg(nix_pid, Signal::SIGKILL) {
                    if let Err(e2) = signal::kill(nix_pid, Signal::SIGKILL) {
                        tracing::error!(
                            "Failed to kill process {} during drop: {} / {}",
                            pid,
                            e,
                            e2
                        );
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};
