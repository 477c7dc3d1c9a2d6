//! The publisher — a bounded retry loop around one provider call.
//!
//! Pure function of (request, credential) to outcome, aside from the
//! credential invalidation round-trip on expired-token rejections. The
//! task record itself is never touched here; the state machine owns it.

use postpilot_core::Platform;
use postpilot_credentials::{Credential, CredentialManager};
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{PostRequest, ProviderAdapter};
use crate::classify::{ErrorClass, classify};
use crate::facebook::FacebookAdapter;
use crate::instagram::InstagramAdapter;
use crate::linkedin::LinkedinAdapter;
use crate::twitter::TwitterAdapter;

/// Attempts within a single `publish` call.
const MAX_ATTEMPTS: u32 = 3;

/// What one `publish` call resolved to. The caller (task state machine)
/// owns the outer attempt budget.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Success { post_id: String },
    Recoverable(String),
    Fatal(String),
}

/// Backoff before the retry that follows failed attempt `attempt`
/// (0-based): 1 s, then 2 s. Pure, so the timing is testable without I/O.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_secs(1 << attempt)
}

/// Routes a post request to the right adapter and retries transient
/// failures with backoff.
pub struct Dispatcher {
    adapters: HashMap<Platform, Box<dyn ProviderAdapter>>,
    credentials: Arc<CredentialManager>,
}

impl Dispatcher {
    /// Empty registry — adapters are registered explicitly (tests).
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self {
            adapters: HashMap::new(),
            credentials,
        }
    }

    /// Registry with the four production adapters.
    pub fn with_default_adapters(
        credentials: Arc<CredentialManager>,
        platforms: &postpilot_core::config::PlatformsConfig,
    ) -> Self {
        let mut dispatcher = Self::new(credentials);
        dispatcher.register(Box::new(FacebookAdapter::new()));
        dispatcher.register(Box::new(InstagramAdapter::new()));
        dispatcher.register(Box::new(LinkedinAdapter::new()));
        dispatcher.register(Box::new(TwitterAdapter::new(platforms.twitter.clone())));
        dispatcher
    }

    pub fn register(&mut self, adapter: Box<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    /// Publish with up to three attempts and exponential backoff.
    pub async fn publish(&self, request: &PostRequest, credential: Credential) -> DispatchOutcome {
        let Some(adapter) = self.adapters.get(&request.platform) else {
            return DispatchOutcome::Fatal(format!(
                "no adapter registered for {}",
                request.platform
            ));
        };

        let mut credential = credential;
        let mut last_reason = String::new();
        let mut refreshed_once = false;

        for attempt in 0..MAX_ATTEMPTS {
            match adapter
                .post(&credential, &request.network_id, &request.payload)
                .await
            {
                Ok(post) => {
                    if attempt > 0 {
                        tracing::info!(
                            "✅ {} publish succeeded on attempt {}",
                            request.platform,
                            attempt + 1
                        );
                    }
                    return DispatchOutcome::Success {
                        post_id: post.post_id,
                    };
                }
                Err(failure) => {
                    let class = classify(request.platform, &failure);
                    last_reason = failure.to_string();
                    tracing::warn!(
                        "⚠️ {} publish attempt {}/{MAX_ATTEMPTS} failed ({class:?}): {last_reason}",
                        request.platform,
                        attempt + 1
                    );

                    match class {
                        ErrorClass::Permanent => {
                            return DispatchOutcome::Fatal(last_reason);
                        }
                        // One refresh round-trip per publish call. If the
                        // fresh token is rejected too, the rejection is
                        // handled like any other transient failure.
                        ErrorClass::TokenExpired if !refreshed_once => {
                            refreshed_once = true;
                            // The cached token looked valid locally but the
                            // provider disagrees. Invalidate, re-resolve once,
                            // and keep looping with the fresh credential.
                            if let Err(e) = self
                                .credentials
                                .invalidate(&request.user_id, request.platform)
                                .await
                            {
                                return DispatchOutcome::Recoverable(format!(
                                    "token invalidation failed: {e}"
                                ));
                            }
                            match self
                                .credentials
                                .get_valid(&request.user_id, request.platform)
                                .await
                            {
                                Ok(fresh) => credential = fresh,
                                Err(e) => {
                                    // Refresh failed: bail out of the local
                                    // loop; a later poller pass starts over.
                                    return DispatchOutcome::Recoverable(format!(
                                        "token refresh failed: {e}"
                                    ));
                                }
                            }
                        }
                        ErrorClass::TokenExpired => {}
                        ErrorClass::Transient => {}
                    }

                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        DispatchOutcome::Recoverable(last_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::adapter::{ProviderFailure, ProviderPost};
    use postpilot_core::PostPayload;
    use postpilot_credentials::{RefreshedToken, TokenRefresher};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter that replays a script of outcomes and counts calls.
    struct ScriptedAdapter {
        platform: Platform,
        script: Mutex<Vec<Result<ProviderPost, ProviderFailure>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedAdapter {
        fn new(platform: Platform, script: Vec<Result<ProviderPost, ProviderFailure>>) -> Self {
            Self::counted(platform, script, Arc::new(AtomicUsize::new(0)))
        }

        fn counted(
            platform: Platform,
            script: Vec<Result<ProviderPost, ProviderFailure>>,
            calls: Arc<AtomicUsize>,
        ) -> Self {
            Self {
                platform,
                script: Mutex::new(script),
                calls,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn post(
            &self,
            _credential: &Credential,
            _network_id: &str,
            _payload: &PostPayload,
        ) -> Result<ProviderPost, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(ProviderPost {
                    post_id: "fallback".into(),
                })
            } else {
                script.remove(0)
            }
        }
    }

    struct NoRefresh;

    /// Always succeeds, counting provider round-trips.
    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        fn can_refresh(&self, _credential: &Credential) -> bool {
            true
        }
        async fn refresh(
            &self,
            credential: &Credential,
        ) -> postpilot_core::Result<RefreshedToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RefreshedToken {
                access_token: "fresh".into(),
                refresh_token: credential.refresh_token.clone(),
                resource_tokens: std::collections::HashMap::new(),
                expires_at: Some(chrono::Utc::now() + chrono::Duration::days(60)),
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        fn can_refresh(&self, _credential: &Credential) -> bool {
            false
        }
        async fn refresh(
            &self,
            _credential: &Credential,
        ) -> postpilot_core::Result<RefreshedToken> {
            Err(postpilot_core::PostPilotError::Credential("no".into()))
        }
    }

    fn manager(name: &str) -> (Arc<CredentialManager>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).ok();
        let m = CredentialManager::open(&dir.join("creds.db"), true, 3, Arc::new(NoRefresh))
            .unwrap();
        (Arc::new(m), dir)
    }

    fn request(platform: Platform) -> PostRequest {
        PostRequest {
            user_id: "user-1".into(),
            platform,
            network_id: "net-1".into(),
            payload: PostPayload::new("title", "body"),
        }
    }

    fn ok(id: &str) -> Result<ProviderPost, ProviderFailure> {
        Ok(ProviderPost {
            post_id: id.into(),
        })
    }

    fn rate_limited() -> Result<ProviderPost, ProviderFailure> {
        Err(ProviderFailure::api(Some(32), 403, "page rate limited"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let (credentials, dir) = manager("postpilot-pub-ok");
        let mut dispatcher = Dispatcher::new(credentials);
        let adapter = ScriptedAdapter::new(Platform::Facebook, vec![ok("post-1")]);
        dispatcher.register(Box::new(adapter));

        let cred = Credential::new("user-1", Platform::Facebook, "t");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Success { ref post_id } if post_id == "post-1"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_succeeds() {
        let (credentials, dir) = manager("postpilot-pub-retry");
        let mut dispatcher = Dispatcher::new(credentials);
        dispatcher.register(Box::new(ScriptedAdapter::new(
            Platform::Facebook,
            vec![rate_limited(), rate_limited(), ok("post-2")],
        )));

        let cred = Credential::new("user-1", Platform::Facebook, "t");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Success { ref post_id } if post_id == "post-2"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_is_recoverable() {
        let (credentials, dir) = manager("postpilot-pub-exhaust");
        let mut dispatcher = Dispatcher::new(credentials);
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register(Box::new(ScriptedAdapter::counted(
            Platform::Facebook,
            vec![rate_limited(), rate_limited(), rate_limited()],
            calls.clone(),
        )));

        let cred = Credential::new("user-1", Platform::Facebook, "t");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Recoverable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_short_circuits() {
        let (credentials, dir) = manager("postpilot-pub-fatal");
        let mut dispatcher = Dispatcher::new(credentials);
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register(Box::new(ScriptedAdapter::counted(
            Platform::Facebook,
            vec![Err(ProviderFailure::api(Some(506), 400, "duplicate post"))],
            calls.clone(),
        )));

        let cred = Credential::new("user-1", Platform::Facebook, "t");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Fatal(_)));
        // Fatal bypasses the remaining attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_with_no_refresh_path_is_recoverable() {
        // Token rejected, invalidation flips needs_refresh, and the
        // NoRefresh refresher cannot mint a new one: the local loop
        // terminates early as Recoverable.
        let (credentials, dir) = manager("postpilot-pub-expired");
        credentials
            .store_credential(&Credential::new("user-1", Platform::Facebook, "stale"))
            .await
            .unwrap();

        let mut dispatcher = Dispatcher::new(credentials);
        dispatcher.register(Box::new(ScriptedAdapter::new(
            Platform::Facebook,
            vec![Err(ProviderFailure::api(Some(190), 401, "token expired"))],
        )));

        let cred = Credential::new("user-1", Platform::Facebook, "stale");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Recoverable(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_refreshes_at_most_once_per_call() {
        let dir = std::env::temp_dir().join("postpilot-pub-onerefresh");
        std::fs::create_dir_all(&dir).ok();
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        let credentials = Arc::new(
            CredentialManager::open(
                &dir.join("creds.db"),
                true,
                3,
                Arc::new(CountingRefresher {
                    calls: refresh_calls.clone(),
                }),
            )
            .unwrap(),
        );
        credentials
            .store_credential(&Credential::new("user-1", Platform::Facebook, "stale"))
            .await
            .unwrap();

        // The provider rejects even the refreshed token.
        let expired = || Err(ProviderFailure::api(Some(190), 401, "token expired"));
        let adapter_calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new(credentials);
        dispatcher.register(Box::new(ScriptedAdapter::counted(
            Platform::Facebook,
            vec![expired(), expired(), expired()],
            adapter_calls.clone(),
        )));

        let cred = Credential::new("user-1", Platform::Facebook, "stale");
        let outcome = dispatcher.publish(&request(Platform::Facebook), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Recoverable(_)));
        assert_eq!(adapter_calls.load(Ordering::SeqCst), 3);
        // One refresh round-trip; later rejections fall through as
        // plain transient failures.
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_adapter_is_fatal() {
        let (credentials, dir) = manager("postpilot-pub-noadapter");
        let dispatcher = Dispatcher::new(credentials);
        let cred = Credential::new("user-1", Platform::Linkedin, "t");
        let outcome = dispatcher.publish(&request(Platform::Linkedin), cred).await;
        assert!(matches!(outcome, DispatchOutcome::Fatal(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(0), std::time::Duration::from_secs(1));
        assert_eq!(backoff_delay(1), std::time::Duration::from_secs(2));
    }
}
