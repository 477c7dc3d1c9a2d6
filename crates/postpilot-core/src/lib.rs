//! # PostPilot Core
//!
//! Shared foundation for the PostPilot workspace: the error taxonomy,
//! the TOML configuration system, and the types every crate speaks
//! (target platform, post payload).

pub mod config;
pub mod error;
pub mod types;

pub use config::PostPilotConfig;
pub use error::{PostPilotError, Result};
pub use types::{Platform, PostPayload};
