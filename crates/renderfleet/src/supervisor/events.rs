use super::Shared;
use renderfleet_core::{
    ControlChannel, ExitOutcome, OutputStream, ProcessEvent, ProcessEventKind,
    ProcessEventReceiver, ProcessManager, SessionStatus,
};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Consume process lifecycle events until the supervisor goes away
pub(super) async fn run<M: ProcessManager + 'static, C: ControlChannel + 'static>(
    shared: Weak<Shared<M, C>>,
    mut events: ProcessEventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let ProcessEvent {
            session_id,
            instance,
            pid,
            kind,
        } = event;

        match kind {
            ProcessEventKind::Output { stream, line } => match stream {
                OutputStream::Stdout => debug!(session = %session_id, pid = ?pid, "engine: {}", line),
                OutputStream::Stderr => debug!(session = %session_id, pid = ?pid, "engine stderr: {}", line),
            },
            ProcessEventKind::Exited(outcome) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                // The slot's lock may be held by a long create or terminate
                tokio::spawn(handle_exit(shared, session_id, instance, outcome));
            }
        }
    }
    debug!("Engine event loop stopped");
}

/// Flip a running record to `error` when its process exits on its own
async fn handle_exit<M: ProcessManager + 'static, C: ControlChannel + 'static>(
    shared: Arc<Shared<M, C>>,
    session_id: String,
    instance: u64,
    outcome: ExitOutcome,
) {
    let Some(slot) = shared.slot(&session_id) else {
        return;
    };
    let _ops = slot.lock_ops().await;
    if !shared.is_current(&session_id, &slot) {
        return;
    }

    let crashed = slot.with_state(|s| {
        if s.instance != instance || s.record.status != SessionStatus::Running {
            return false;
        }
        if let Err(e) = s.record.fail(format!("engine {outcome}")) {
            debug!(session = %session_id, "{}", e);
            return false;
        }
        s.end(Instant::now());
        s.handle.take();
        true
    });

    if crashed {
        warn!(session = %session_id, "Engine {} unexpectedly", outcome);
    }
}
