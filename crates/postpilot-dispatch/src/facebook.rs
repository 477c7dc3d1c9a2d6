//! Facebook page posting via the Graph API.
//!
//! Posts land on a page, so the call uses the page-scoped resource
//! token for the task's network id, not the user token.

use async_trait::async_trait;
use postpilot_core::{Platform, PostPayload};
use postpilot_credentials::Credential;

use crate::adapter::{ProviderAdapter, ProviderFailure, ProviderPost, graph_failure};

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";
const POST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct FacebookAdapter {
    client: reqwest::Client,
}

impl FacebookAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for FacebookAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn post(
        &self,
        credential: &Credential,
        network_id: &str,
        payload: &PostPayload,
    ) -> Result<ProviderPost, ProviderFailure> {
        let page_token = credential.token_for(network_id);

        // Image posts go to /photos with a caption; text posts to /feed.
        let (url, body) = match &payload.image_url {
            Some(image) => (
                format!("{GRAPH_BASE}/{network_id}/photos"),
                serde_json::json!({
                    "url": image,
                    "caption": payload.text_with_link(),
                    "access_token": page_token,
                }),
            ),
            None => (
                format!("{GRAPH_BASE}/{network_id}/feed"),
                serde_json::json!({
                    "message": payload.body,
                    "link": payload.link_url,
                    "access_token": page_token,
                }),
            ),
        };

        let response = self
            .client
            .post(&url)
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

        // /photos returns {id, post_id}; /feed returns {id}.
        let post_id = body["post_id"]
            .as_str()
            .or_else(|| body["id"].as_str())
            .ok_or_else(|| {
                ProviderFailure::api(None, status, "Facebook response carried no post id")
            })?;

        tracing::info!("📘 Facebook post created on page {network_id}: {post_id}");
        Ok(ProviderPost {
            post_id: post_id.to_string(),
        })
    }
}
