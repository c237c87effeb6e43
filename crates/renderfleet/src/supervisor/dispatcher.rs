use super::EngineSupervisor;
use renderfleet_core::{
    CommandOptions, CommandOutput, CommandRequest, ControlChannel, FleetError, ProcessManager,
    SessionStatus,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

impl<M: ProcessManager + 'static, C: ControlChannel + 'static> EngineSupervisor<M, C> {
    /// Relay `command` to the engine of `session_id` and wait for its reply.
    ///
    /// Only `running` sessions accept commands. A timeout leaves the engine
    /// running; the late reply is discarded.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<CommandOutput, FleetError> {
        let slot = self
            .shared
            .slot(session_id)
            .ok_or_else(|| FleetError::not_found(session_id))?;

        let port = slot.with_state(|s| {
            if s.record.status != SessionStatus::Running {
                return None;
            }
            s.touch(Instant::now());
            Some(s.record.port)
        });
        let Some(port) = port else {
            return Err(FleetError::not_found(session_id));
        };

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.shared.config.command_timeout());
        let request = CommandRequest {
            command: command.to_string(),
            background: options.background,
            silent: options.silent,
        };

        if options.silent {
            trace!(session = %session_id, port, "Sending command: {}", command);
        } else {
            info!(session = %session_id, port, "Sending command: {}", command);
        }

        let started = Instant::now();
        let reply = match tokio::time::timeout(timeout, self.shared.channel.execute(port, &request))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(session = %session_id, port, "Command transport failed: {}", e);
                return Err(FleetError::CommandExecutionError(e.to_string()));
            }
            Err(_) => {
                warn!(
                    session = %session_id,
                    port,
                    "Command timed out after {}ms",
                    timeout.as_millis()
                );
                return Err(FleetError::CommandTimeout(timeout.as_millis()));
            }
        };

        if !options.silent {
            debug!(
                session = %session_id,
                success = reply.success,
                "Command finished in {}ms",
                started.elapsed().as_millis()
            );
        }
        reply.into_result()
    }
}
