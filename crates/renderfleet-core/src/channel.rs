use crate::error::FleetError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Engine-reported error kind meaning neither rendering backend works
pub const RENDERING_UNAVAILABLE: &str = "rendering_unavailable";

/// Failure to talk to an engine's control channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Engine answered with HTTP status {0}")]
    Status(u16),
    #[error("Malformed engine reply: {0}")]
    Protocol(String),
}

/// Per-call dispatch options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    /// Falls back to the fleet's configured command timeout
    pub timeout: Option<Duration>,
    pub background: bool,
    pub silent: bool,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Body of a command sent to an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub silent: bool,
}

/// Structured result returned by an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl EngineReply {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Split into the payload or the typed error the engine reported
    pub fn into_result(self) -> Result<CommandOutput, FleetError> {
        if self.success {
            return Ok(CommandOutput { data: self.data });
        }
        let message = self
            .error
            .unwrap_or_else(|| "engine reported failure without a message".to_string());
        match self.error_kind.as_deref() {
            Some(RENDERING_UNAVAILABLE) => Err(FleetError::RenderingUnavailable(message)),
            _ => Err(FleetError::CommandExecutionError(message)),
        }
    }
}

/// Successful command payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub data: Option<Value>,
}

/// `{success, data?, error?}` view for collaborators relaying results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn from_result(result: Result<CommandOutput, FleetError>) -> Self {
        match result {
            Ok(output) => Self {
                success: true,
                data: output.data,
                error: None,
            },
            Err(e) => Self {
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Local command endpoint exposed by each engine process
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Succeeds once the engine on `port` accepts commands
    async fn probe(&self, port: u16) -> Result<(), ChannelError>;

    /// Submit one command and wait for the engine's reply
    async fn execute(&self, port: u16, request: &CommandRequest)
    -> Result<EngineReply, ChannelError>;
}
