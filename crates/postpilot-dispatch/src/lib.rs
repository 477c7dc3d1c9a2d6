//! # PostPilot Dispatch
//!
//! The layer between the task state machine and the provider APIs.
//! One adapter per platform maps a post payload to that provider's
//! write endpoint; a table-driven classifier sorts rejections into
//! transient / token-expired / permanent; and the publisher wraps the
//! call in a bounded retry loop with exponential backoff.

pub mod adapter;
pub mod classify;
pub mod facebook;
pub mod instagram;
pub mod linkedin;
pub mod publisher;
pub mod twitter;

pub use adapter::{PostRequest, ProviderAdapter, ProviderFailure, ProviderPost};
pub use classify::{ErrorClass, classify};
pub use publisher::{DispatchOutcome, Dispatcher, backoff_delay};
