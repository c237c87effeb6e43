use crate::error::FleetError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Readiness polling performed while a new engine is `starting`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Delay between two probes of the control channel (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on probes; the startup timeout still applies on top
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReadinessConfig {
    /// Probe every few milliseconds, useful against in-process engines
    pub fn eager() -> Self {
        Self {
            poll_interval_ms: 5,
            max_attempts: 400,
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.poll_interval_ms == 0 {
            return Err(FleetError::ConfigurationError(
                "readiness poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(FleetError::ConfigurationError(
                "readiness max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Operator override for the rendering backend; `Auto` means probe the host
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderingBackendOverride {
    #[default]
    Auto,
    Offscreen,
    VirtualDisplay,
    Disabled,
}

impl FromStr for RenderingBackendOverride {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "offscreen" | "osmesa" | "egl" => Ok(Self::Offscreen),
            "virtual-display" | "xvfb" => Ok(Self::VirtualDisplay),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(FleetError::ConfigurationError(format!(
                "unknown rendering backend: {other}"
            ))),
        }
    }
}

/// How chatty spawned engines should be
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Quiet,
    Normal,
    Verbose,
}

/// Command-line flags understood by the engine executable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchFlags {
    pub port_flag: String,
    pub offscreen_flag: String,
    pub virtual_display_flag: String,
    pub quiet_flag: String,
    pub verbose_flag: String,
}

impl Default for LaunchFlags {
    fn default() -> Self {
        Self {
            port_flag: "--port".to_string(),
            offscreen_flag: "--offscreen".to_string(),
            virtual_display_flag: "--virtual-display".to_string(),
            quiet_flag: "--quiet".to_string(),
            verbose_flag: "--verbose".to_string(),
        }
    }
}

/// Commands used to probe rendering support at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    /// Arguments passed to the engine executable for the offscreen probe
    pub offscreen_probe_args: Vec<String>,
    pub virtual_display_command: String,
    pub probe_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            offscreen_probe_args: vec!["--probe-offscreen".to_string()],
            virtual_display_command: "Xvfb".to_string(),
            probe_timeout_ms: 10_000,
        }
    }
}

impl ProbeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Process-wide fleet configuration, fixed at startup
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub executable: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default = "default_control_host()")]
    #[serde(default = "default_control_host")]
    pub control_host: String,
    #[builder(default = "default_base_port()")]
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[builder(default = "default_max_instances()")]
    #[serde(default = "default_max_instances")]
    pub max_instances: u16,
    #[builder(default = "default_idle_timeout_ms()")]
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[builder(default = "default_command_timeout_ms()")]
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[builder(default = "default_startup_timeout_ms()")]
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[builder(default = "default_termination_grace_ms()")]
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    #[builder(default = "default_reap_interval_ms()")]
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[builder(default = "default_terminal_retention_ms()")]
    #[serde(default = "default_terminal_retention_ms")]
    pub terminal_retention_ms: u64,
    #[builder(default)]
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[builder(default)]
    #[serde(default)]
    pub rendering_backend: RenderingBackendOverride,
    #[builder(default)]
    #[serde(default)]
    pub verbosity: Verbosity,
    #[builder(default)]
    #[serde(default)]
    pub launch_flags: LaunchFlags,
    #[builder(default)]
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl FleetConfig {
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.executable.trim().is_empty() {
            return Err(FleetError::ConfigurationError(
                "executable must not be empty".to_string(),
            ));
        }
        if self.max_instances == 0 {
            return Err(FleetError::ConfigurationError(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.base_port.checked_add(self.max_instances).is_none() {
            return Err(FleetError::ConfigurationError(format!(
                "port range {}+{} overflows the port space",
                self.base_port, self.max_instances
            )));
        }
        if self.startup_timeout_ms == 0 {
            return Err(FleetError::ConfigurationError(
                "startup_timeout_ms must be positive".to_string(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(FleetError::ConfigurationError(
                "reap_interval_ms must be positive".to_string(),
            ));
        }
        self.readiness.validate()
    }

    /// Overlay `RENDERFLEET_*` environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), FleetError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), FleetError> {
        if let Some(executable) = lookup("RENDERFLEET_EXECUTABLE") {
            self.executable = executable;
        }
        if let Some(value) = lookup("RENDERFLEET_BASE_PORT") {
            self.base_port = parse_var("RENDERFLEET_BASE_PORT", &value)?;
        }
        if let Some(value) = lookup("RENDERFLEET_MAX_INSTANCES") {
            self.max_instances = parse_var("RENDERFLEET_MAX_INSTANCES", &value)?;
        }
        if let Some(value) = lookup("RENDERFLEET_IDLE_TIMEOUT_MS") {
            self.idle_timeout_ms = parse_var("RENDERFLEET_IDLE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("RENDERFLEET_COMMAND_TIMEOUT_MS") {
            self.command_timeout_ms = parse_var("RENDERFLEET_COMMAND_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("RENDERFLEET_RENDERING_BACKEND") {
            self.rendering_backend = value.parse()?;
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }
}

impl FleetConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, FleetError> {
    value
        .trim()
        .parse()
        .map_err(|_| FleetError::ConfigurationError(format!("invalid value for {key}: {value}")))
}

// Default value functions for serde and the builder
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_max_attempts() -> u32 {
    120
}
fn default_control_host() -> String {
    "127.0.0.1".to_string()
}
fn default_base_port() -> u16 {
    9123
}
fn default_max_instances() -> u16 {
    10
}
fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_startup_timeout_ms() -> u64 {
    30_000
}
fn default_termination_grace_ms() -> u64 {
    5_000
}
fn default_reap_interval_ms() -> u64 {
    60_000
}
fn default_terminal_retention_ms() -> u64 {
    5 * 60 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FleetConfig {
        FleetConfig::builder()
            .executable("engine")
            .args(["-x", "-y"])
            .env("LANG", "C")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.args, vec!["-x", "-y"]);
        assert_eq!(config.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.base_port, 9123);
        assert_eq!(config.max_instances, 10);
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.rendering_backend, RenderingBackendOverride::Auto);
        assert_eq!(config.launch_flags.port_flag, "--port");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = config();
        config.max_instances = 0;
        assert!(config.validate().is_err());

        config.max_instances = 10;
        config.base_port = u16::MAX - 3;
        assert!(config.validate().is_err());

        config.base_port = 6100;
        config.readiness.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        config.readiness = ReadinessConfig::eager();
        config.executable = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = config();
        let vars: HashMap<&str, &str> = [
            ("RENDERFLEET_BASE_PORT", "6100"),
            ("RENDERFLEET_MAX_INSTANCES", "2"),
            ("RENDERFLEET_RENDERING_BACKEND", "xvfb"),
        ]
        .into_iter()
        .collect();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.base_port, 6100);
        assert_eq!(config.max_instances, 2);
        assert_eq!(
            config.rendering_backend,
            RenderingBackendOverride::VirtualDisplay
        );
        assert_eq!(config.executable, "engine");
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let mut config = config();
        let err = config
            .apply_vars(|key| (key == "RENDERFLEET_BASE_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(format!("{err}").contains("RENDERFLEET_BASE_PORT"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"executable":"/opt/engine/bin/engine","maxInstances":2,"renderingBackend":"virtual-display"}"#;
        let config: FleetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_instances, 2);
        assert_eq!(config.base_port, 9123);
        assert_eq!(
            config.rendering_backend,
            RenderingBackendOverride::VirtualDisplay
        );
        assert_eq!(config.readiness, ReadinessConfig::default());
        assert!(config.validate().is_ok());
    }
}
