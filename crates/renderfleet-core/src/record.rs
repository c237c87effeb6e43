use crate::capabilities::RenderingBackend;
use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Lifecycle status of a session's engine process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Error,
    Terminated,
}

impl SessionStatus {
    /// `Starting` and `Running` records own a port and a process
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Running) | (Starting, Error) | (Running, Error) | (Running, Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one session's engine process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub last_active: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub backend: RenderingBackend,
}

impl ProcessRecord {
    pub fn new(id: impl Into<String>, port: u16, backend: RenderingBackend) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            port,
            pid: None,
            status: SessionStatus::Starting,
            created_at: now,
            last_active: now,
            error: None,
            backend,
        }
    }

    /// Move to `next`, rejecting edges outside the lifecycle DAG
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), FleetError> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next != SessionStatus::Error {
            self.error = None;
        }
        Ok(())
    }

    /// Transition to `Error` carrying a diagnostic message
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), FleetError> {
        self.transition(SessionStatus::Error)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Record activity; never moves `last_active` backwards
    pub fn touch(&mut self, at: SystemTime) {
        if at > self.last_active {
            self.last_active = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record() -> ProcessRecord {
        ProcessRecord::new("s1", 6100, RenderingBackend::Offscreen)
    }

    #[test]
    fn test_lifecycle_dag() {
        use SessionStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Error));
        assert!(Running.can_transition_to(Terminated));

        assert!(!Starting.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Starting));
        for terminal in [Error, Terminated] {
            for next in [Starting, Running, Error, Terminated] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_rejects_terminal_exit() {
        let mut record = record();
        record.transition(SessionStatus::Running).unwrap();
        record.transition(SessionStatus::Terminated).unwrap();

        let err = record.transition(SessionStatus::Running).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        assert_eq!(record.status, SessionStatus::Terminated);
    }

    #[test]
    fn test_fail_sets_error_message() {
        let mut record = record();
        record.fail("engine exited with code 3").unwrap();
        assert_eq!(record.status, SessionStatus::Error);
        assert_eq!(record.error.as_deref(), Some("engine exited with code 3"));
        assert!(record.fail("again").is_err());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = record();
        let later = record.last_active + Duration::from_secs(5);
        record.touch(later);
        record.touch(later - Duration::from_secs(3));
        assert_eq!(record.last_active, later);
    }

    #[test]
    fn test_serialization_shape() {
        let record = record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["backend"], "offscreen");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastActive").is_some());
        assert!(json.get("error").is_none());
    }
}
