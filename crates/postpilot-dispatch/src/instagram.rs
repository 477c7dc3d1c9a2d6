//! Instagram posting via the Graph API container flow.
//!
//! Two steps: create a media container from the image URL, then publish
//! it. Instagram has no text-only posts — a payload without an image is
//! surfaced as an unsendable failure.

use async_trait::async_trait;
use postpilot_core::{Platform, PostPayload};
use postpilot_credentials::Credential;

use crate::adapter::{ProviderAdapter, ProviderFailure, ProviderPost, graph_failure};

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";
const POST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct InstagramAdapter {
    client: reqwest::Client,
}

impl InstagramAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn graph_call(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderFailure> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(POST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(&e))?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::transport(&e))?;

        if body["error"].is_object() {
            return Err(graph_failure(status, &body));
        }
        Ok(body)
    }
}

impl Default for InstagramAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn post(
        &self,
        credential: &Credential,
        network_id: &str,
        payload: &PostPayload,
    ) -> Result<ProviderPost, ProviderFailure> {
        let Some(image_url) = &payload.image_url else {
            return Err(ProviderFailure::invalid(
                "Instagram posts require an image",
            ));
        };
        let token = credential.token_for(network_id);

        // Step 1: create the media container.
        let container = self
            .graph_call(
                &format!("{GRAPH_BASE}/{network_id}/media"),
                serde_json::json!({
                    "image_url": image_url,
                    "caption": payload.text_with_link(),
                    "access_token": token,
                }),
            )
            .await?;
        let creation_id = container["id"].as_str().ok_or_else(|| {
            ProviderFailure::api(None, 200, "Instagram container response carried no id")
        })?;

        // Step 2: publish it.
        let published = self
            .graph_call(
                &format!("{GRAPH_BASE}/{network_id}/media_publish"),
                serde_json::json!({
                    "creation_id": creation_id,
                    "access_token": token,
                }),
            )
            .await?;
        let post_id = published["id"].as_str().ok_or_else(|| {
            ProviderFailure::api(None, 200, "Instagram publish response carried no id")
        })?;

        tracing::info!("📷 Instagram post published for account {network_id}: {post_id}");
        Ok(ProviderPost {
            post_id: post_id.to_string(),
        })
    }
}
