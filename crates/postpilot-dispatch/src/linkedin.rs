//! LinkedIn posting via the UGC Posts API.

use async_trait::async_trait;
use postpilot_core::{Platform, PostPayload};
use postpilot_credentials::Credential;

use crate::adapter::{ProviderAdapter, ProviderFailure, ProviderPost};

const UGC_POSTS_URL: &str = "https://api.linkedin.com/v2/ugcPosts";
const POST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct LinkedinAdapter {
    client: reqwest::Client,
}

impl LinkedinAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for LinkedinAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for LinkedinAdapter {
    fn platform(&self) -> Platform {
        Platform::Linkedin
    }

    async fn post(
        &self,
        credential: &Credential,
        network_id: &str,
        payload: &PostPayload,
    ) -> Result<ProviderPost, ProviderFailure> {
        let media_category = if payload.link_url.is_some() {
            "ARTICLE"
        } else {
            "NONE"
        };
        let mut share_content = serde_json::json!({
            "shareCommentary": { "text": payload.body },
            "shareMediaCategory": media_category,
        });
        if let Some(link) = &payload.link_url {
            share_content["media"] = serde_json::json!([{
                "status": "READY",
                "originalUrl": link,
                "title": { "text": payload.title },
            }]);
        }

        let body = serde_json::json!({
            "author": format!("urn:li:person:{network_id}"),
            "lifecycleState": "PUBLISHED",
            "specificContent": { "com.linkedin.ugc.ShareContent": share_content },
            "visibility": { "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC" },
        });

        let response = self
            .client
            .post(UGC_POSTS_URL)
            .header("Authorization", format!("Bearer {}", credential.access_token))
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&body)
            .timeout(POST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(&e))?;

        let status = response.status();
        // The created post id travels in a response header.
        let restli_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Err(ProviderFailure::api(
                body["serviceErrorCode"].as_i64(),
                status.as_u16(),
                body["message"].as_str().unwrap_or("LinkedIn API error"),
            ));
        }

        let post_id = match restli_id {
            Some(id) => id,
            None => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                body["id"]
                    .as_str()
                    .ok_or_else(|| {
                        ProviderFailure::api(
                            None,
                            status.as_u16(),
                            "LinkedIn response carried no post id",
                        )
                    })?
                    .to_string()
            }
        };

        tracing::info!("💼 LinkedIn post created for author {network_id}: {post_id}");
        Ok(ProviderPost { post_id })
    }
}
