//! Twitter/X posting via the v2 tweets endpoint, signed with OAuth 1.0a.
//!
//! OAuth 1.0a user tokens do not expire; the token secret rides in the
//! credential's resource tokens under `oauth_token_secret`.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use postpilot_core::{Platform, PostPayload, config::AppKeyPair};
use postpilot_credentials::Credential;
use sha1::Sha1;

use crate::adapter::{ProviderAdapter, ProviderFailure, ProviderPost};

const TWEETS_URL: &str = "https://api.twitter.com/2/tweets";
const POST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// RFC 3986 unreserved characters stay bare; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct TwitterAdapter {
    app: AppKeyPair,
    client: reqwest::Client,
}

impl TwitterAdapter {
    pub fn new(app: AppKeyPair) -> Self {
        Self {
            app,
            client: reqwest::Client::new(),
        }
    }

    /// Build the OAuth 1.0a Authorization header for a POST with a JSON
    /// body (body parameters are excluded from the signature base).
    fn authorization_header(&self, credential: &Credential, token_secret: &str) -> String {
        let nonce: String = (0..32)
            .map(|_| {
                let chars = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
                chars[rand::random::<usize>() % chars.len()] as char
            })
            .collect();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut params: Vec<(&str, &str)> = vec![
            ("oauth_consumer_key", &self.app.client_id),
            ("oauth_nonce", &nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", &timestamp),
            ("oauth_token", &credential.access_token),
            ("oauth_version", "1.0"),
        ];
        params.sort();

        let param_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", oauth_encode(k), oauth_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let base_string = format!(
            "POST&{}&{}",
            oauth_encode(TWEETS_URL),
            oauth_encode(&param_string)
        );
        let signing_key = format!(
            "{}&{}",
            oauth_encode(&self.app.client_secret),
            oauth_encode(token_secret)
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(base_string.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut header_params = params;
        let sig_pair = ("oauth_signature", signature.as_str());
        header_params.push(sig_pair);
        header_params.sort();

        format!(
            "OAuth {}",
            header_params
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", oauth_encode(k), oauth_encode(v)))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn oauth_encode(s: &str) -> String {
    utf8_percent_encode(s, OAUTH_ENCODE_SET).to_string()
}

#[async_trait]
impl ProviderAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn post(
        &self,
        credential: &Credential,
        _network_id: &str,
        payload: &PostPayload,
    ) -> Result<ProviderPost, ProviderFailure> {
        let Some(token_secret) = credential.resource_tokens.get("oauth_token_secret") else {
            return Err(ProviderFailure::invalid(
                "Twitter credential is missing its OAuth token secret",
            ));
        };
        let authorization = self.authorization_header(credential, token_secret);

        let response = self
            .client
            .post(TWEETS_URL)
            .header("Authorization", authorization)
            .json(&serde_json::json!({ "text": payload.text_with_link() }))
            .timeout(POST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(&e))?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderFailure::transport(&e))?;

        if let Some(errors) = body["errors"].as_array()
            && let Some(first) = errors.first()
        {
            return Err(ProviderFailure::api(
                first["code"].as_i64(),
                status,
                first["message"]
                    .as_str()
                    .or_else(|| first["detail"].as_str())
                    .unwrap_or("Twitter API error"),
            ));
        }
        if !(200..300).contains(&status) {
            return Err(ProviderFailure::api(
                None,
                status,
                body["detail"].as_str().unwrap_or("Twitter API error"),
            ));
        }

        let post_id = body["data"]["id"].as_str().ok_or_else(|| {
            ProviderFailure::api(None, status, "Twitter response carried no tweet id")
        })?;

        tracing::info!("🐦 Tweet posted: {post_id}");
        Ok(ProviderPost {
            post_id: post_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_encoding() {
        assert_eq!(oauth_encode("abc-._~XYZ"), "abc-._~XYZ");
        assert_eq!(oauth_encode("a b&c"), "a%20b%26c");
        assert_eq!(oauth_encode("token=secret"), "token%3Dsecret");
    }

    #[test]
    fn test_authorization_header_shape() {
        let adapter = TwitterAdapter::new(AppKeyPair {
            client_id: "consumer-key".into(),
            client_secret: "consumer-secret".into(),
        });
        let cred = Credential::new("u", Platform::Twitter, "user-token");
        let header = adapter.authorization_header(&cred, "token-secret");

        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_consumer_key=\"consumer-key\""));
        assert!(header.contains("oauth_token=\"user-token\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert!(header.contains("oauth_signature=\""));
        // Two calls never share a nonce.
        let header2 = adapter.authorization_header(&cred, "token-secret");
        assert_ne!(header, header2);
    }
}
