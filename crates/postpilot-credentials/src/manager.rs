//! Credential lifecycle manager.
//!
//! The only component allowed to read or write token material. Hands
//! out decrypted credentials, refreshing them when they are inside the
//! expiry margin, and serializes refreshes per (user, platform) so
//! concurrent dispatches share one provider round-trip.

use chrono::{Duration, Utc};
use postpilot_core::Platform;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::refresh::TokenRefresher;
use crate::store::{Credential, CredentialStore, StoredCredential};

/// Typed outcome of credential resolution. Both variants mean "user
/// action required" — the state machine fails the task without
/// consuming retry budget.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credential stored for this (user, platform).
    #[error("no {platform} credential configured for this account")]
    NotConfigured { platform: Platform },

    /// Stored credential is stale and cannot be refreshed automatically.
    #[error("{platform} connection needs re-authorization: {reason}")]
    NeedsReauth { platform: Platform, reason: String },

    /// Storage or crypto failure underneath the lifecycle logic.
    #[error("credential storage error: {0}")]
    Internal(String),
}

type CredKey = (String, Platform);

/// Owns the credential store and the refresh seam.
pub struct CredentialManager {
    store: Mutex<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    /// Refresh this far before expiry.
    margin: Duration,
    /// Per-key refresh locks — single-flight across concurrent callers.
    flights: Mutex<HashMap<CredKey, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    pub fn open(
        db_path: &Path,
        encrypt: bool,
        margin_days: i64,
        refresher: Arc<dyn TokenRefresher>,
    ) -> postpilot_core::Result<Self> {
        let store = CredentialStore::open(db_path, encrypt)?;
        Ok(Self {
            store: Mutex::new(store),
            refresher,
            margin: Duration::days(margin_days),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a usable credential, refreshing it if stale.
    pub async fn get_valid(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Credential, CredentialError> {
        let stored = self.load(user_id, platform).await?;
        if !self.is_stale(&stored) {
            return Ok(stored.credential);
        }

        // Stale: serialize the refresh per key. Whoever gets the lock
        // first does the round-trip; everyone else re-reads the row.
        let flight = self.flight_lock(user_id, platform).await;
        let _guard = flight.lock().await;

        let stored = self.load(user_id, platform).await?;
        if !self.is_stale(&stored) {
            // A concurrent caller already refreshed while we waited.
            return Ok(stored.credential);
        }

        self.refresh_locked(stored).await
    }

    /// Mark the credential stale so the next access refreshes it.
    /// Called by the dispatch layer after a provider auth-rejection.
    pub async fn invalidate(&self, user_id: &str, platform: Platform) -> postpilot_core::Result<()> {
        tracing::info!("🔑 Invalidating {platform} credential for user {user_id}");
        self.store
            .lock()
            .await
            .set_needs_refresh(user_id, platform)
    }

    /// Store new credential material (connect / re-auth surface).
    pub async fn store_credential(&self, credential: &Credential) -> postpilot_core::Result<()> {
        self.store.lock().await.upsert(credential)
    }

    /// Remove a stored credential.
    pub async fn remove(&self, user_id: &str, platform: Platform) -> postpilot_core::Result<bool> {
        self.store.lock().await.delete(user_id, platform)
    }

    /// List stored keys with expiry metadata. Never exposes secrets.
    pub async fn list(
        &self,
    ) -> postpilot_core::Result<Vec<(String, Platform, Option<chrono::DateTime<Utc>>)>> {
        self.store.lock().await.list()
    }

    /// Proactively refresh every credential inside the expiry margin.
    /// One credential's failure never aborts the sweep.
    pub async fn sweep_expiring(&self) -> usize {
        let expiring = match self.store.lock().await.expiring_within(self.margin) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("⚠️ Expiry sweep query failed: {e}");
                return 0;
            }
        };

        let mut refreshed = 0;
        for (user_id, platform) in expiring {
            match self.get_valid(&user_id, platform).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Sweep refresh failed for {user_id}/{platform}: {e}");
                }
            }
        }
        refreshed
    }

    async fn load(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<StoredCredential, CredentialError> {
        self.store
            .lock()
            .await
            .find(user_id, platform)
            .map_err(|e| CredentialError::Internal(e.to_string()))?
            .ok_or(CredentialError::NotConfigured { platform })
    }

    fn is_stale(&self, stored: &StoredCredential) -> bool {
        if stored.needs_refresh {
            return true;
        }
        match stored.credential.expires_at {
            Some(expires_at) => expires_at - Utc::now() < self.margin,
            None => false,
        }
    }

    async fn flight_lock(&self, user_id: &str, platform: Platform) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry((user_id.to_string(), platform))
            .or_default()
            .clone()
    }

    /// Perform the refresh. Caller must hold the per-key flight lock.
    async fn refresh_locked(
        &self,
        stored: StoredCredential,
    ) -> Result<Credential, CredentialError> {
        let platform = stored.credential.platform;
        let user_id = stored.credential.user_id.clone();

        if !self.refresher.can_refresh(&stored.credential) {
            return Err(CredentialError::NeedsReauth {
                platform,
                reason: "no refresh path for this connection".into(),
            });
        }

        tracing::info!("🔄 Refreshing {platform} token for user {user_id}");
        let refreshed = self
            .refresher
            .refresh(&stored.credential)
            .await
            .map_err(|e| CredentialError::NeedsReauth {
                platform,
                reason: e.to_string(),
            })?;

        let credential = Credential {
            user_id: user_id.clone(),
            platform,
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            resource_tokens: refreshed.resource_tokens,
            expires_at: refreshed.expires_at,
        };

        // Token and expiry land in one upsert; the needs_refresh flag
        // clears with the same write.
        self.store
            .lock()
            .await
            .upsert(&credential)
            .map_err(|e| CredentialError::Internal(e.to_string()))?;

        tracing::info!(
            "✅ Refreshed {platform} token for user {user_id} (expires: {})",
            credential
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into())
        );
        Ok(credential)
    }
}
