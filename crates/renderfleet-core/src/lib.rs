//! renderfleet core - platform-independent abstractions and configuration
//!
//! This crate provides the process traits, session records, port pool,
//! rendering capability model and error types shared by the platform
//! process managers and the supervisor.

mod capabilities;
mod channel;
mod config;
mod error;
mod ports;
mod process;
mod record;

pub use capabilities::*;
pub use channel::*;
pub use config::*;
pub use error::*;
pub use ports::*;
pub use process::*;
pub use record::*;
