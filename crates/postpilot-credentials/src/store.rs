//! SQLite-backed credential storage.
//!
//! One row per (user, platform). Token material is serialized to JSON,
//! AES-encrypted, and base64-encoded into a single `secret` column;
//! only expiry metadata stays in plaintext so the expiry sweep can
//! query without decrypting.

use chrono::{DateTime, Utc};
use postpilot_core::Platform;
use postpilot_core::error::{PostPilotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::crypto;

/// A decrypted provider credential for one (user, platform) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub platform: Platform,
    /// Long-lived access token.
    pub access_token: String,
    /// Refresh token, for platforms that issue one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Resource-scoped sub-tokens, e.g. page id → page access token.
    #[serde(default)]
    pub resource_tokens: HashMap<String, String>,
    /// None = token does not expire (OAuth1-style providers).
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(user_id: &str, platform: Platform, access_token: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            platform,
            access_token: access_token.to_string(),
            refresh_token: None,
            resource_tokens: HashMap::new(),
            expires_at: None,
        }
    }

    /// Token to use when posting to a specific resource (e.g. a page).
    /// Falls back to the user-level access token.
    pub fn token_for(&self, resource_id: &str) -> &str {
        self.resource_tokens
            .get(resource_id)
            .map(|s| s.as_str())
            .unwrap_or(&self.access_token)
    }
}

/// Secret half of a row — the part that gets encrypted.
#[derive(Serialize, Deserialize)]
struct SecretMaterial {
    access_token: String,
    refresh_token: Option<String>,
    resource_tokens: HashMap<String, String>,
}

/// A stored credential plus its lifecycle flag.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub credential: Credential,
    /// Set by `invalidate` — forces a refresh on next access.
    pub needs_refresh: bool,
}

/// SQLite credential store.
pub struct CredentialStore {
    conn: rusqlite::Connection,
    encrypt: bool,
    key: [u8; 32],
}

impl CredentialStore {
    /// Open or create the credential database.
    pub fn open(path: &Path, encrypt: bool) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| PostPilotError::Storage(format!("DB open: {e}")))?;
        let store = Self {
            conn,
            encrypt,
            key: crypto::derive_machine_key(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                secret TEXT NOT NULL,            -- encrypted JSON token material
                expires_at TEXT,                 -- NULL = does not expire
                needs_refresh INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, platform)
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_expiry
                ON credentials(expires_at) WHERE expires_at IS NOT NULL;
         ",
            )
            .map_err(|e| PostPilotError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn seal_secret(&self, credential: &Credential) -> Result<String> {
        let material = SecretMaterial {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            resource_tokens: credential.resource_tokens.clone(),
        };
        let json = serde_json::to_string(&material)?;
        Ok(if self.encrypt {
            crypto::seal(&json, &self.key)
        } else {
            json
        })
    }

    fn open_secret(&self, blob: &str) -> Result<SecretMaterial> {
        let json = if self.encrypt {
            crypto::open(blob, &self.key)?
        } else {
            blob.to_string()
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Insert or replace the credential for (user, platform).
    /// Clears any pending `needs_refresh` flag — fresh material is trusted.
    pub fn upsert(&self, credential: &Credential) -> Result<()> {
        let secret = self.seal_secret(credential)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO credentials
                 (user_id, platform, secret, expires_at, needs_refresh, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    credential.user_id,
                    credential.platform.as_str(),
                    secret,
                    credential.expires_at.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| PostPilotError::Storage(format!("Upsert credential: {e}")))?;
        Ok(())
    }

    /// Find and decrypt the credential for (user, platform).
    pub fn find(&self, user_id: &str, platform: Platform) -> Result<Option<StoredCredential>> {
        let row = self
            .conn
            .query_row(
                "SELECT secret, expires_at, needs_refresh FROM credentials
                 WHERE user_id = ?1 AND platform = ?2",
                rusqlite::params![user_id, platform.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i32>(2)? != 0,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(PostPilotError::Storage(format!("Find credential: {other}"))),
            })?;

        let Some((secret, expires_at_str, needs_refresh)) = row else {
            return Ok(None);
        };

        let material = self.open_secret(&secret)?;
        let expires_at = expires_at_str
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(Some(StoredCredential {
            credential: Credential {
                user_id: user_id.to_string(),
                platform,
                access_token: material.access_token,
                refresh_token: material.refresh_token,
                resource_tokens: material.resource_tokens,
                expires_at,
            },
            needs_refresh,
        }))
    }

    /// Flag the credential so the next access refreshes it.
    pub fn set_needs_refresh(&self, user_id: &str, platform: Platform) -> Result<()> {
        self.conn
            .execute(
                "UPDATE credentials SET needs_refresh = 1, updated_at = ?3
                 WHERE user_id = ?1 AND platform = ?2",
                rusqlite::params![user_id, platform.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| PostPilotError::Storage(format!("Invalidate credential: {e}")))?;
        Ok(())
    }

    /// Remove the credential for (user, platform).
    pub fn delete(&self, user_id: &str, platform: Platform) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1 AND platform = ?2",
                rusqlite::params![user_id, platform.as_str()],
            )
            .map_err(|e| PostPilotError::Storage(format!("Delete credential: {e}")))?;
        Ok(n > 0)
    }

    /// Keys of credentials whose expiry falls within `margin` from now.
    /// Used by the background sweep; rows with no expiry never qualify.
    pub fn expiring_within(&self, margin: chrono::Duration) -> Result<Vec<(String, Platform)>> {
        let cutoff = (Utc::now() + margin).to_rfc3339();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, platform FROM credentials
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            )
            .map_err(|e| PostPilotError::Storage(format!("Expiry query: {e}")))?;

        let rows = stmt
            .query_map([cutoff], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| PostPilotError::Storage(format!("Expiry query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, platform_str) =
                row.map_err(|e| PostPilotError::Storage(format!("Expiry row: {e}")))?;
            if let Ok(platform) = Platform::from_str(&platform_str) {
                out.push((user_id, platform));
            }
        }
        Ok(out)
    }

    /// List stored (user, platform) keys with expiry metadata, never secrets.
    pub fn list(&self) -> Result<Vec<(String, Platform, Option<DateTime<Utc>>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, platform, expires_at FROM credentials ORDER BY user_id")
            .map_err(|e| PostPilotError::Storage(format!("List query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| PostPilotError::Storage(format!("List query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, platform_str, expires_at_str) =
                row.map_err(|e| PostPilotError::Storage(format!("List row: {e}")))?;
            if let Ok(platform) = Platform::from_str(&platform_str) {
                let expires_at = expires_at_str
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc));
                out.push((user_id, platform, expires_at));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> (CredentialStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).ok();
        let store = CredentialStore::open(&dir.join("creds.db"), true).unwrap();
        (store, dir)
    }

    #[test]
    fn test_upsert_and_find() {
        let (store, dir) = temp_store("postpilot-cred-store-test");

        let mut cred = Credential::new("user-1", Platform::Facebook, "fb-token");
        cred.resource_tokens
            .insert("page-9".into(), "page-token".into());
        cred.expires_at = Some(Utc::now() + chrono::Duration::days(60));
        store.upsert(&cred).unwrap();

        let loaded = store.find("user-1", Platform::Facebook).unwrap().unwrap();
        assert_eq!(loaded.credential.access_token, "fb-token");
        assert_eq!(loaded.credential.token_for("page-9"), "page-token");
        assert_eq!(loaded.credential.token_for("other"), "fb-token");
        assert!(!loaded.needs_refresh);
        assert!(loaded.credential.expires_at.is_some());

        assert!(store.find("user-1", Platform::Twitter).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_secret_is_encrypted_at_rest() {
        let (store, dir) = temp_store("postpilot-cred-enc-test");
        let cred = Credential::new("user-1", Platform::Linkedin, "li-secret-token");
        store.upsert(&cred).unwrap();

        let raw: String = store
            .conn
            .query_row("SELECT secret FROM credentials", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.contains("li-secret-token"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_needs_refresh_flag() {
        let (store, dir) = temp_store("postpilot-cred-flag-test");
        let cred = Credential::new("user-1", Platform::Instagram, "ig-token");
        store.upsert(&cred).unwrap();

        store
            .set_needs_refresh("user-1", Platform::Instagram)
            .unwrap();
        let loaded = store.find("user-1", Platform::Instagram).unwrap().unwrap();
        assert!(loaded.needs_refresh);

        // Upsert with fresh material clears the flag
        store.upsert(&cred).unwrap();
        let loaded = store.find("user-1", Platform::Instagram).unwrap().unwrap();
        assert!(!loaded.needs_refresh);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_expiring_within() {
        let (store, dir) = temp_store("postpilot-cred-sweep-test");

        let mut soon = Credential::new("user-1", Platform::Facebook, "t1");
        soon.expires_at = Some(Utc::now() + chrono::Duration::days(1));
        store.upsert(&soon).unwrap();

        let mut far = Credential::new("user-2", Platform::Facebook, "t2");
        far.expires_at = Some(Utc::now() + chrono::Duration::days(50));
        store.upsert(&far).unwrap();

        // No expiry — never swept
        store
            .upsert(&Credential::new("user-3", Platform::Twitter, "t3"))
            .unwrap();

        let expiring = store.expiring_within(chrono::Duration::days(3)).unwrap();
        assert_eq!(expiring, vec![("user-1".to_string(), Platform::Facebook)]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
