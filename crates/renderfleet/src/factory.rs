use renderfleet_core::ProcessManagerFactory;

/// Selects the process manager for the current platform at compile time
pub struct PlatformProcessManagerFactory;

#[cfg(unix)]
impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = renderfleet_unix::UnixProcessManager;

    fn create_process_manager() -> Self::Manager {
        renderfleet_unix::UnixProcessManagerFactory::create_process_manager()
    }

    fn platform_name() -> &'static str {
        renderfleet_unix::UnixProcessManagerFactory::platform_name()
    }
}

/// Process manager used by [`crate::EngineFleet`]
#[cfg(unix)]
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;
