//! renderfleet - supervises a fleet of headless rendering-engine processes
//!
//! One engine process runs per session. The supervisor allocates each engine
//! a control port, waits for it to become ready, relays commands with a
//! timeout, notices crashes and reclaims idle engines.
//!
//! [`EngineFleet`] wires the platform process manager and the HTTP control
//! channel together. [`EngineSupervisor`] is generic over both seams for
//! callers that bring their own.

mod detector;
mod factory;
#[cfg(unix)]
mod fleet;
mod http_channel;
mod reaper;
mod supervisor;

pub use detector::CapabilityDetector;
pub use factory::*;
#[cfg(unix)]
pub use fleet::{EngineFleet, PlatformSupervisor};
pub use http_channel::HttpControlChannel;
pub use reaper::IdleReaper;
pub use supervisor::EngineSupervisor;
#[cfg(unix)]
pub use renderfleet_unix::{UnixProcessHandle, UnixProcessManager};

// Re-export core functionality
pub use renderfleet_core::*;
