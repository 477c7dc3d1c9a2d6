//! The provider adapter seam.
//!
//! Adding a platform means adding one `ProviderAdapter` impl plus a
//! classification table — nothing in the state machine changes.

use async_trait::async_trait;
use postpilot_core::{Platform, PostPayload};
use postpilot_credentials::Credential;

/// What the state machine asks the dispatch layer to do: one payload,
/// one target network, one owning user.
#[derive(Debug, Clone)]
pub struct PostRequest {
    pub user_id: String,
    pub platform: Platform,
    /// Provider-side resource id (page id, IG account id, author URN id).
    pub network_id: String,
    pub payload: PostPayload,
}

/// A successful provider write.
#[derive(Debug, Clone)]
pub struct ProviderPost {
    /// Provider-assigned id of the created post.
    pub post_id: String,
}

/// A provider rejection, carrying the raw signal the classifier needs.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// Provider-level error code, when the response body carried one.
    pub code: Option<i64>,
    /// HTTP status of the response, when one arrived at all.
    pub http_status: Option<u16>,
    pub message: String,
    /// Transport-level timeout — always retryable.
    pub timed_out: bool,
}

impl ProviderFailure {
    /// Failure from an error body the provider returned.
    pub fn api(code: Option<i64>, http_status: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            http_status: Some(http_status),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Failure from the transport layer (connect error, timeout).
    pub fn transport(err: &reqwest::Error) -> Self {
        Self {
            code: None,
            http_status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }

    /// Request could not even be built (e.g. missing required media).
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: None,
            http_status: None,
            message: message.into(),
            timed_out: false,
        }
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.http_status) {
            (Some(code), _) => write!(f, "provider error {code}: {}", self.message),
            (None, Some(status)) => write!(f, "HTTP {status}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// One per platform. Maps engine-level parameters to the provider's
/// request shape and surfaces raw error codes for classification.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Post the payload to the provider's write endpoint.
    async fn post(
        &self,
        credential: &Credential,
        network_id: &str,
        payload: &PostPayload,
    ) -> Result<ProviderPost, ProviderFailure>;
}

/// Parse a Graph API error body (Facebook and Instagram share the shape:
/// `{"error": {"code": ..., "message": ...}}`).
pub(crate) fn graph_failure(status: u16, body: &serde_json::Value) -> ProviderFailure {
    ProviderFailure::api(
        body["error"]["code"].as_i64(),
        status,
        body["error"]["message"]
            .as_str()
            .unwrap_or("unknown Graph API error"),
    )
}
