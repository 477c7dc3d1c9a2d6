//! # PostPilot Credentials
//!
//! Owns provider tokens per (user, platform): encrypted at rest,
//! decrypted only inside this crate, refreshed before expiry, and
//! serialized per key so concurrent dispatches never race a refresh.

pub mod crypto;
pub mod manager;
pub mod refresh;
pub mod store;

pub use manager::{CredentialError, CredentialManager};
pub use refresh::{HttpTokenRefresher, RefreshedToken, TokenRefresher};
pub use store::{Credential, CredentialStore};
