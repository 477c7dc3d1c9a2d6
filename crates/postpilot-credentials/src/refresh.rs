//! Platform-specific token refresh exchanges.
//!
//! Each platform has its own idea of "refresh": Facebook and Instagram
//! trade the current long-lived token for a new ~60-day one, LinkedIn
//! exchanges a refresh token, and Twitter's OAuth 1.0a tokens never
//! expire so there is nothing to refresh.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use postpilot_core::error::{PostPilotError, Result};
use postpilot_core::{Platform, config::PlatformsConfig};
use std::collections::HashMap;

use crate::store::Credential;

const REFRESH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Fresh token material returned by a provider exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub resource_tokens: HashMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The refresh seam. One implementation talks to real providers; tests
/// substitute their own.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Whether a refresh path exists for this credential at all.
    fn can_refresh(&self, credential: &Credential) -> bool;

    /// Perform the provider exchange and return new token material.
    async fn refresh(&self, credential: &Credential) -> Result<RefreshedToken>;
}

/// Refresher backed by the real provider endpoints.
pub struct HttpTokenRefresher {
    platforms: PlatformsConfig,
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(platforms: PlatformsConfig) -> Self {
        Self {
            platforms,
            client: reqwest::Client::new(),
        }
    }

    /// Facebook: exchange the current token for a fresh long-lived one
    /// (~60 days), then re-derive page tokens from /me/accounts.
    async fn refresh_facebook(&self, credential: &Credential) -> Result<RefreshedToken> {
        let app = &self.platforms.facebook;
        let resp: serde_json::Value = self
            .client
            .get("https://graph.facebook.com/v19.0/oauth/access_token")
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", &app.client_id),
                ("client_secret", &app.client_secret),
                ("fb_exchange_token", &credential.access_token),
            ])
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Facebook exchange failed: {e}")))?
            .json()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Invalid Facebook response: {e}")))?;

        let access_token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                PostPilotError::Credential(format!(
                    "Facebook exchange rejected: {}",
                    resp["error"]["message"].as_str().unwrap_or("no token")
                ))
            })?
            .to_string();
        let expires_at = expiry_from_seconds(resp["expires_in"].as_i64());

        // Page tokens are minted per-page from the new user token.
        let pages: serde_json::Value = self
            .client
            .get("https://graph.facebook.com/v19.0/me/accounts")
            .query(&[("access_token", access_token.as_str())])
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Page token fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Invalid page response: {e}")))?;

        let mut resource_tokens = HashMap::new();
        if let Some(data) = pages["data"].as_array() {
            for page in data {
                if let (Some(id), Some(token)) =
                    (page["id"].as_str(), page["access_token"].as_str())
                {
                    resource_tokens.insert(id.to_string(), token.to_string());
                }
            }
        }

        Ok(RefreshedToken {
            access_token,
            refresh_token: None,
            resource_tokens,
            expires_at,
        })
    }

    /// Instagram: extend the long-lived token another ~60 days.
    async fn refresh_instagram(&self, credential: &Credential) -> Result<RefreshedToken> {
        let resp: serde_json::Value = self
            .client
            .get("https://graph.instagram.com/refresh_access_token")
            .query(&[
                ("grant_type", "ig_refresh_token"),
                ("access_token", &credential.access_token),
            ])
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Instagram refresh failed: {e}")))?
            .json()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Invalid Instagram response: {e}")))?;

        let access_token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                PostPilotError::Credential(format!(
                    "Instagram refresh rejected: {}",
                    resp["error"]["message"].as_str().unwrap_or("no token")
                ))
            })?
            .to_string();

        Ok(RefreshedToken {
            access_token,
            refresh_token: None,
            resource_tokens: credential.resource_tokens.clone(),
            expires_at: expiry_from_seconds(resp["expires_in"].as_i64()),
        })
    }

    /// LinkedIn: standard OAuth2 refresh_token grant.
    async fn refresh_linkedin(&self, credential: &Credential) -> Result<RefreshedToken> {
        let app = &self.platforms.linkedin;
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or_else(|| PostPilotError::Credential("LinkedIn: no refresh token".into()))?;

        let resp: serde_json::Value = self
            .client
            .post("https://www.linkedin.com/oauth/v2/accessToken")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &app.client_id),
                ("client_secret", &app.client_secret),
            ])
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| PostPilotError::Credential(format!("LinkedIn refresh failed: {e}")))?
            .json()
            .await
            .map_err(|e| PostPilotError::Credential(format!("Invalid LinkedIn response: {e}")))?;

        let access_token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                PostPilotError::Credential(format!(
                    "LinkedIn refresh rejected: {}",
                    resp["error_description"].as_str().unwrap_or("no token")
                ))
            })?
            .to_string();

        Ok(RefreshedToken {
            access_token,
            // LinkedIn may rotate the refresh token; keep the old one if not.
            refresh_token: resp["refresh_token"]
                .as_str()
                .map(String::from)
                .or_else(|| credential.refresh_token.clone()),
            resource_tokens: credential.resource_tokens.clone(),
            expires_at: expiry_from_seconds(resp["expires_in"].as_i64()),
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    fn can_refresh(&self, credential: &Credential) -> bool {
        match credential.platform {
            Platform::Facebook => self.platforms.facebook.is_configured(),
            Platform::Instagram => true,
            Platform::Linkedin => {
                self.platforms.linkedin.is_configured() && credential.refresh_token.is_some()
            }
            // OAuth 1.0a tokens never expire; only re-authorization helps.
            Platform::Twitter => false,
        }
    }

    async fn refresh(&self, credential: &Credential) -> Result<RefreshedToken> {
        match credential.platform {
            Platform::Facebook => self.refresh_facebook(credential).await,
            Platform::Instagram => self.refresh_instagram(credential).await,
            Platform::Linkedin => self.refresh_linkedin(credential).await,
            Platform::Twitter => Err(PostPilotError::Credential(
                "Twitter tokens cannot be refreshed".into(),
            )),
        }
    }
}

fn expiry_from_seconds(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|s| Utc::now() + Duration::seconds(s))
}
