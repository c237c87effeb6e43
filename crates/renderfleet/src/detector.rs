use renderfleet_core::{FleetConfig, ProbeConfig, RenderingCapabilities};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Probes which rendering backends work on this host, once
pub struct CapabilityDetector {
    config: FleetConfig,
    display: Option<String>,
    cache: RwLock<Option<RenderingCapabilities>>,
}

impl CapabilityDetector {
    pub fn new(config: &FleetConfig) -> Self {
        Self::with_display(config, std::env::var("DISPLAY").ok())
    }

    /// Use `display` instead of the process's `DISPLAY` variable
    pub fn with_display(config: &FleetConfig, display: Option<String>) -> Self {
        Self {
            config: config.clone(),
            display: display.filter(|d| !d.trim().is_empty()),
            cache: RwLock::new(None),
        }
    }

    /// Detected capabilities, probing on first use only
    pub async fn detect(&self) -> RenderingCapabilities {
        if let Some(capabilities) = *self.cache.read().await {
            return capabilities;
        }

        let mut cache = self.cache.write().await;
        if let Some(capabilities) = *cache {
            return capabilities;
        }
        let capabilities = self.probe().await;
        *cache = Some(capabilities);
        capabilities
    }

    /// Probe again and replace the cached result
    pub async fn redetect(&self) -> RenderingCapabilities {
        let mut cache = self.cache.write().await;
        let capabilities = self.probe().await;
        *cache = Some(capabilities);
        capabilities
    }

    pub async fn cached(&self) -> Option<RenderingCapabilities> {
        *self.cache.read().await
    }

    async fn probe(&self) -> RenderingCapabilities {
        if let Some(fixed) = RenderingCapabilities::from_override(self.config.rendering_backend) {
            info!(
                backend = %fixed.preferred_backend(),
                "Rendering backend fixed by configuration, skipping probes"
            );
            return fixed;
        }

        let probe = &self.config.probe;
        let (offscreen_available, virtual_display_available) = tokio::join!(
            self.probe_offscreen(probe),
            self.probe_virtual_display(probe)
        );
        let capabilities = RenderingCapabilities::new(offscreen_available, virtual_display_available);

        info!(
            offscreen = offscreen_available,
            virtual_display = virtual_display_available,
            backend = %capabilities.preferred_backend(),
            "Detected rendering capabilities"
        );
        if !offscreen_available && !virtual_display_available {
            warn!("No rendering backend available; engines will start without rendering");
        }
        capabilities
    }

    async fn probe_offscreen(&self, probe: &ProbeConfig) -> bool {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&probe.offscreen_probe_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Offscreen probe could not start {}: {}", self.config.executable, e);
                return false;
            }
        };

        match tokio::time::timeout(probe.probe_timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Offscreen probe {}", status);
                status.success()
            }
            Ok(Err(e)) => {
                debug!("Offscreen probe failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Offscreen probe did not finish within {}ms",
                    probe.probe_timeout_ms
                );
                false
            }
        }
    }

    async fn probe_virtual_display(&self, probe: &ProbeConfig) -> bool {
        if let Some(current) = &self.display {
            debug!("Display {} already available", current);
            return true;
        }

        let mut command = Command::new(&probe.virtual_display_command);
        command
            .arg("-help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match command.spawn() {
            Ok(mut child) => {
                // Only the ability to start matters; reap it either way
                if tokio::time::timeout(probe.probe_timeout(), child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.kill().await;
                }
                true
            }
            Err(e) => {
                debug!(
                    "Virtual display command {} unavailable: {}",
                    probe.virtual_display_command, e
                );
                false
            }
        }
    }
}
