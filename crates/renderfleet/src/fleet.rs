use crate::detector::CapabilityDetector;
use crate::factory::{PlatformProcessManager, PlatformProcessManagerFactory};
use crate::http_channel::HttpControlChannel;
use crate::reaper::IdleReaper;
use crate::supervisor::EngineSupervisor;
use renderfleet_core::{
    CommandOptions, CommandOutput, FleetConfig, FleetError, ProcessManagerFactory, ProcessRecord,
    RenderingCapabilities,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub type PlatformSupervisor = EngineSupervisor<PlatformProcessManager, HttpControlChannel>;

/// Ready-to-use engine fleet: platform process manager, HTTP control
/// channel, detected rendering backend and a background idle reaper
pub struct EngineFleet {
    supervisor: PlatformSupervisor,
    detector: CapabilityDetector,
    reaper: Mutex<Option<IdleReaper>>,
}

impl EngineFleet {
    /// Probe rendering support and start supervising engines
    pub async fn start(config: FleetConfig) -> Result<Self, FleetError> {
        config.validate()?;

        let detector = CapabilityDetector::new(&config);
        let capabilities = detector.detect().await;

        let channel = Arc::new(HttpControlChannel::new(config.control_host.clone())?);
        let manager = Arc::new(PlatformProcessManagerFactory::create_process_manager());
        info!(
            "Using {} process manager",
            PlatformProcessManagerFactory::platform_name()
        );

        let supervisor = EngineSupervisor::new(config.clone(), manager, channel, capabilities)?;
        let reaper = IdleReaper::spawn(
            supervisor.clone(),
            config.reap_interval(),
            config.idle_timeout(),
            config.terminal_retention(),
        );

        Ok(Self {
            supervisor,
            detector,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn supervisor(&self) -> &PlatformSupervisor {
        &self.supervisor
    }

    pub async fn create(&self, session_id: Option<&str>) -> Result<ProcessRecord, FleetError> {
        self.supervisor.create(session_id).await
    }

    pub fn get(&self, session_id: &str) -> Option<ProcessRecord> {
        self.supervisor.get(session_id)
    }

    pub async fn terminate(&self, session_id: &str) -> Result<bool, FleetError> {
        self.supervisor.terminate(session_id).await
    }

    pub async fn send_command(
        &self,
        session_id: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<CommandOutput, FleetError> {
        self.supervisor
            .send_command(session_id, command, options)
            .await
    }

    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        self.supervisor.cleanup_idle(idle_timeout).await
    }

    pub fn list_all(&self) -> Vec<ProcessRecord> {
        self.supervisor.list_all()
    }

    pub fn capabilities(&self) -> RenderingCapabilities {
        self.supervisor.capabilities()
    }

    /// Probe again; running engines keep the backend they started with
    pub async fn refresh_capabilities(&self) -> RenderingCapabilities {
        let capabilities = self.detector.redetect().await;
        self.supervisor.set_capabilities(capabilities);
        capabilities
    }

    /// Stop the reaper, then every engine
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.stop().await;
        }
        self.supervisor.shutdown().await
    }
}
