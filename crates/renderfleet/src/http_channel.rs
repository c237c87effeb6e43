use async_trait::async_trait;
use renderfleet_core::{ChannelError, CommandRequest, ControlChannel, EngineReply, FleetError};
use std::time::Duration;
use tracing::trace;

/// Single readiness probe; readiness polling retries on top of this
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Talks to each engine's local HTTP command endpoint
#[derive(Debug, Clone)]
pub struct HttpControlChannel {
    client: reqwest::Client,
    host: String,
}

impl HttpControlChannel {
    pub fn new(host: impl Into<String>) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| FleetError::ConfigurationError(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }
}

fn transport_error(e: reqwest::Error) -> ChannelError {
    if let Some(status) = e.status() {
        ChannelError::Status(status.as_u16())
    } else if e.is_decode() {
        ChannelError::Protocol(e.to_string())
    } else {
        ChannelError::Connect(e.to_string())
    }
}

#[async_trait]
impl ControlChannel for HttpControlChannel {
    async fn probe(&self, port: u16) -> Result<(), ChannelError> {
        let response = self
            .client
            .get(self.url(port, "/health"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        trace!(port, %status, "Health probe answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(ChannelError::Status(status.as_u16()))
        }
    }

    async fn execute(
        &self,
        port: u16,
        request: &CommandRequest,
    ) -> Result<EngineReply, ChannelError> {
        let response = self
            .client
            .post(self.url(port, "/command"))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        // Engines report command failures in the body, often with a 4xx/5xx
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        match serde_json::from_slice::<EngineReply>(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(ChannelError::Status(status.as_u16())),
            Err(e) => Err(ChannelError::Protocol(e.to_string())),
        }
    }
}
