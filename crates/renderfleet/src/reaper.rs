use crate::supervisor::EngineSupervisor;
use renderfleet_core::{ControlChannel, ProcessManager};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically reclaims idle engines and expired `error` records
pub struct IdleReaper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IdleReaper {
    /// Terminate every running session idle for at least `idle_timeout` at
    /// `now`, returning how many were stopped.
    ///
    /// Idleness is re-checked under each session's lock, so a command that
    /// lands mid-sweep keeps its engine alive.
    pub async fn sweep<M: ProcessManager + 'static, C: ControlChannel + 'static>(
        supervisor: &EngineSupervisor<M, C>,
        idle_timeout: Duration,
        now: Instant,
    ) -> usize {
        let candidates = supervisor.idle_sessions(idle_timeout, now);
        if candidates.is_empty() {
            return 0;
        }

        let mut reaped = 0;
        for session_id in candidates {
            match supervisor.terminate_idle(&session_id, idle_timeout, now).await {
                Ok(true) => {
                    info!(session = %session_id, "Reaped idle engine");
                    reaped += 1;
                }
                Ok(false) => debug!(session = %session_id, "Session no longer idle, skipping"),
                Err(e) => warn!(session = %session_id, "Failed to reap idle engine: {}", e),
            }
        }
        reaped
    }

    /// Start the background sweep loop
    pub fn spawn<M: ProcessManager + 'static, C: ControlChannel + 'static>(
        supervisor: EngineSupervisor<M, C>,
        interval: Duration,
        idle_timeout: Duration,
        retention: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let reaped = Self::sweep(&supervisor, idle_timeout, now).await;
                        let pruned = supervisor.prune_terminal(retention, now).await;
                        if reaped > 0 || pruned > 0 {
                            debug!(reaped, pruned, "Idle sweep finished");
                        }
                    }
                }
            }
            info!("Idle reaper stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Idle reaper task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
