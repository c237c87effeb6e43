use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Operating system process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to start one engine process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub session_id: String,
    /// Unique per spawn, so events from an earlier process under the same
    /// session id can be told apart
    pub instance: u64,
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("exited with unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Lifecycle event emitted by a platform process wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub session_id: String,
    pub instance: u64,
    pub pid: Option<ProcessId>,
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEventKind {
    Output { stream: OutputStream, line: String },
    Exited(ExitOutcome),
}

pub type ProcessEventSender = mpsc::UnboundedSender<ProcessEvent>;
pub type ProcessEventReceiver = mpsc::UnboundedReceiver<ProcessEvent>;

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Process outlived every signal within the allotted time
    Timeout,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// The process is gone either way
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Trait representing a handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if the OS never reported one)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool {
        matches!(self.try_wait().await, Ok(None))
    }

    /// Try to get the exit outcome without blocking
    async fn try_wait(&self) -> Result<Option<ExitOutcome>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ExitOutcome>;

    /// Kill the process immediately
    async fn kill(&mut self) -> Result<()>;
}

/// Process spawning and health
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn a process for `spec`; output and exit are reported on `events`
    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        events: ProcessEventSender,
    ) -> Result<Self::Handle>;

    /// Wait for a process to exit with optional timeout
    async fn wait_for_exit(
        &self,
        handle: &mut Self::Handle,
        timeout: Option<Duration>,
    ) -> Result<ExitOutcome> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| anyhow::anyhow!("Timeout waiting for process exit"))?,
            None => handle.wait().await,
        }
    }
}

/// Process termination including process trees
#[async_trait]
pub trait ProcessTermination: ProcessLifecycle {
    /// Ask a process to stop (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut Self::Handle) -> TerminationResult;

    /// Force kill a process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut Self::Handle) -> TerminationResult;

    /// Find all descendants of a given process
    async fn find_child_processes(&self, _pid: ProcessId) -> Result<Vec<ProcessId>> {
        Ok(Vec::new())
    }

    /// Terminate an entire process tree (parent and all descendants)
    async fn terminate_process_tree(&self, _root_pid: ProcessId) -> TerminationResult {
        TerminationResult::ProcessNotFound
    }

    /// Graceful stop, bounded wait, then escalation to a forced kill
    async fn terminate_completely(
        &self,
        handle: &mut Self::Handle,
        grace: Duration,
    ) -> TerminationResult {
        if !handle.is_running().await {
            return TerminationResult::Success;
        }

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                if self.wait_for_exit(handle, Some(grace)).await.is_ok() {
                    return TerminationResult::Success;
                }
                tracing::warn!(
                    pid = ?handle.get_pid(),
                    "Process ignored graceful stop for {:?}, escalating",
                    grace
                );
            }
            TerminationResult::ProcessNotFound => return TerminationResult::Success,
            other => {
                tracing::warn!(pid = ?handle.get_pid(), "Graceful stop failed: {:?}", other);
            }
        }

        // Descendants that left the process group would otherwise survive
        if let Some(pid) = handle.get_pid() {
            let result = self.terminate_process_tree(pid).await;
            if !result.is_gone() {
                tracing::warn!(%pid, "Process tree termination incomplete: {:?}", result);
            }
        }

        match self.force_kill(handle).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                match self.wait_for_exit(handle, Some(grace)).await {
                    Ok(_) => TerminationResult::Success,
                    Err(_) => TerminationResult::Timeout,
                }
            }
            other => other,
        }
    }
}

/// Process manager combining lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Cleanup any resources held by the process manager
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager + 'static;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
