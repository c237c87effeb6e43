use crate::config::{FleetConfig, RenderingBackendOverride, Verbosity};
use crate::process::LaunchSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rendering support discovered on this host
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingCapabilities {
    pub offscreen_available: bool,
    pub virtual_display_available: bool,
}

impl RenderingCapabilities {
    pub fn new(offscreen_available: bool, virtual_display_available: bool) -> Self {
        Self {
            offscreen_available,
            virtual_display_available,
        }
    }

    /// Fixed capabilities implied by an operator override, `None` for `Auto`
    pub fn from_override(backend: RenderingBackendOverride) -> Option<Self> {
        match backend {
            RenderingBackendOverride::Auto => None,
            RenderingBackendOverride::Offscreen => Some(Self::new(true, false)),
            RenderingBackendOverride::VirtualDisplay => Some(Self::new(false, true)),
            RenderingBackendOverride::Disabled => Some(Self::new(false, false)),
        }
    }

    /// Offscreen beats a virtual display, which beats nothing at all
    pub fn preferred_backend(&self) -> RenderingBackend {
        if self.offscreen_available {
            RenderingBackend::Offscreen
        } else if self.virtual_display_available {
            RenderingBackend::VirtualDisplay
        } else {
            RenderingBackend::None
        }
    }
}

/// Backend an engine process is launched with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderingBackend {
    Offscreen,
    VirtualDisplay,
    None,
}

impl RenderingBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderingBackend::Offscreen => "offscreen",
            RenderingBackend::VirtualDisplay => "virtual-display",
            RenderingBackend::None => "none",
        }
    }
}

impl fmt::Display for RenderingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch configuration resolved once from config and detected capabilities.
///
/// Every `create` reads the same profile; platform branching never happens
/// per request.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchProfile {
    pub capabilities: RenderingCapabilities,
    pub backend: RenderingBackend,
    command: String,
    base_args: Vec<String>,
    backend_flag: Option<String>,
    fallback_flag: Option<String>,
    verbosity_flag: Option<String>,
    port_flag: String,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
}

impl LaunchProfile {
    pub fn resolve(config: &FleetConfig, capabilities: RenderingCapabilities) -> Self {
        let backend = capabilities.preferred_backend();
        let flags = &config.launch_flags;
        let backend_flag = match backend {
            RenderingBackend::Offscreen => Some(flags.offscreen_flag.clone()),
            RenderingBackend::VirtualDisplay => Some(flags.virtual_display_flag.clone()),
            RenderingBackend::None => None,
        };
        // Offscreen engines can fall back to the virtual display when both work
        let fallback_flag = (backend == RenderingBackend::Offscreen
            && capabilities.virtual_display_available)
            .then(|| flags.virtual_display_flag.clone());
        let verbosity_flag = match config.verbosity {
            Verbosity::Quiet => Some(flags.quiet_flag.clone()),
            Verbosity::Normal => None,
            Verbosity::Verbose => Some(flags.verbose_flag.clone()),
        };

        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.push(("RENDERFLEET_BACKEND".to_string(), backend.as_str().to_string()));

        Self {
            capabilities,
            backend,
            command: config.executable.clone(),
            base_args: config.args.clone(),
            backend_flag: backend_flag.filter(|f| !f.is_empty()),
            fallback_flag: fallback_flag.filter(|f| !f.is_empty()),
            verbosity_flag: verbosity_flag.filter(|f| !f.is_empty()),
            port_flag: flags.port_flag.clone(),
            env,
            working_dir: config
                .working_directory
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }

    /// Build the concrete launch for one session on one port
    pub fn launch_spec(&self, session_id: &str, instance: u64, port: u16) -> LaunchSpec {
        let mut args = self.base_args.clone();
        args.push(self.port_flag.clone());
        args.push(port.to_string());
        args.extend(self.backend_flag.iter().cloned());
        args.extend(self.fallback_flag.iter().cloned());
        args.extend(self.verbosity_flag.iter().cloned());

        let mut env = self.env.clone();
        env.push(("RENDERFLEET_SESSION".to_string(), session_id.to_string()));

        LaunchSpec {
            session_id: session_id.to_string(),
            instance,
            port,
            command: self.command.clone(),
            args,
            env,
            working_dir: self.working_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(verbosity: Verbosity) -> FleetConfig {
        FleetConfig::builder()
            .executable("engine")
            .args(["-c"])
            .verbosity(verbosity)
            .build()
            .unwrap()
    }

    #[test]
    fn test_backend_preference() {
        assert_eq!(
            RenderingCapabilities::new(true, true).preferred_backend(),
            RenderingBackend::Offscreen
        );
        assert_eq!(
            RenderingCapabilities::new(false, true).preferred_backend(),
            RenderingBackend::VirtualDisplay
        );
        assert_eq!(
            RenderingCapabilities::new(false, false).preferred_backend(),
            RenderingBackend::None
        );
    }

    #[test]
    fn test_override_skips_probe() {
        assert_eq!(
            RenderingCapabilities::from_override(RenderingBackendOverride::Auto),
            None
        );
        let caps =
            RenderingCapabilities::from_override(RenderingBackendOverride::VirtualDisplay).unwrap();
        assert_eq!(caps.preferred_backend(), RenderingBackend::VirtualDisplay);
    }

    #[test]
    fn test_launch_spec_offscreen_quiet() {
        let profile =
            LaunchProfile::resolve(&config(Verbosity::Quiet), RenderingCapabilities::new(true, true));
        let spec = profile.launch_spec("s1", 7, 6100);

        assert_eq!(spec.command, "engine");
        assert_eq!(
            spec.args,
            vec!["-c", "--port", "6100", "--offscreen", "--virtual-display", "--quiet"]
        );
        assert_eq!(spec.instance, 7);
        assert!(
            spec.env
                .contains(&("RENDERFLEET_BACKEND".to_string(), "offscreen".to_string()))
        );
        assert!(
            spec.env
                .contains(&("RENDERFLEET_SESSION".to_string(), "s1".to_string()))
        );
    }

    #[test]
    fn test_offscreen_only_has_no_fallback() {
        let profile = LaunchProfile::resolve(
            &config(Verbosity::Normal),
            RenderingCapabilities::new(true, false),
        );
        let spec = profile.launch_spec("s4", 1, 6103);
        assert_eq!(spec.args, vec!["-c", "--port", "6103", "--offscreen"]);
    }

    #[test]
    fn test_launch_spec_without_backend() {
        let profile = LaunchProfile::resolve(
            &config(Verbosity::Normal),
            RenderingCapabilities::new(false, false),
        );
        let spec = profile.launch_spec("s2", 1, 6101);
        assert_eq!(profile.backend, RenderingBackend::None);
        assert_eq!(spec.args, vec!["-c", "--port", "6101"]);
    }

    #[test]
    fn test_launch_spec_virtual_display_verbose() {
        let profile = LaunchProfile::resolve(
            &config(Verbosity::Verbose),
            RenderingCapabilities::new(false, true),
        );
        let spec = profile.launch_spec("s3", 2, 6102);
        assert_eq!(
            spec.args,
            vec!["-c", "--port", "6102", "--virtual-display", "--verbose"]
        );
    }
}
