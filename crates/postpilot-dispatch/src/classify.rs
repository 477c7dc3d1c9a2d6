//! Table-driven provider error classification.
//!
//! Each platform maps a small fixed set of provider error codes to
//! transient (retry locally), token-expired (invalidate + re-resolve
//! the credential, then retry), or permanent (fail the task now).

use postpilot_core::Platform;

use crate::adapter::ProviderFailure;

/// How the retry loop should react to a provider rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after backoff.
    Transient,
    /// The cached token is stale — refresh it, then retry.
    TokenExpired,
    /// No automatic retry can succeed.
    Permanent,
}

// Graph API (Facebook + Instagram share the code space):
// 1/2 temporary API errors, 4/17/32 app/user/page rate limits,
// 341 application-level throttle.
const GRAPH_TRANSIENT: &[i64] = &[1, 2, 4, 17, 32, 341];
// 102 session invalidated, 190 access token expired.
const GRAPH_TOKEN_EXPIRED: &[i64] = &[102, 190];
// 10 permission denied, 100 invalid parameter, 368 blocked by policy,
// 506 duplicate post.
const GRAPH_PERMANENT: &[i64] = &[10, 100, 368, 506];

// Twitter v1.1-style error codes surfaced alongside v2 responses:
// 88 rate limit, 130 over capacity.
const TWITTER_TRANSIENT: &[i64] = &[88, 130];
// 89 invalid or expired token.
const TWITTER_TOKEN_EXPIRED: &[i64] = &[89];
// 64 account suspended, 187 duplicate status, 226 flagged as spam.
const TWITTER_PERMANENT: &[i64] = &[64, 187, 226];

/// Classify a provider rejection for the retry loop.
pub fn classify(platform: Platform, failure: &ProviderFailure) -> ErrorClass {
    if failure.timed_out {
        return ErrorClass::Transient;
    }

    match platform {
        Platform::Facebook | Platform::Instagram => classify_graph(failure),
        Platform::Linkedin => classify_linkedin(failure),
        Platform::Twitter => classify_twitter(failure),
    }
}

fn classify_graph(failure: &ProviderFailure) -> ErrorClass {
    if let Some(code) = failure.code {
        if GRAPH_TOKEN_EXPIRED.contains(&code) {
            return ErrorClass::TokenExpired;
        }
        if GRAPH_TRANSIENT.contains(&code) {
            return ErrorClass::Transient;
        }
        if GRAPH_PERMANENT.contains(&code) || (200..=299).contains(&code) {
            // 200-299 is the Graph permission-error band.
            return ErrorClass::Permanent;
        }
    }
    by_http_status(failure)
}

fn classify_linkedin(failure: &ProviderFailure) -> ErrorClass {
    match failure.http_status {
        Some(401) => ErrorClass::TokenExpired,
        Some(429) => ErrorClass::Transient,
        Some(403) | Some(422) => ErrorClass::Permanent,
        _ => by_http_status(failure),
    }
}

fn classify_twitter(failure: &ProviderFailure) -> ErrorClass {
    if let Some(code) = failure.code {
        if TWITTER_TOKEN_EXPIRED.contains(&code) {
            return ErrorClass::TokenExpired;
        }
        if TWITTER_TRANSIENT.contains(&code) {
            return ErrorClass::Transient;
        }
        if TWITTER_PERMANENT.contains(&code) {
            return ErrorClass::Permanent;
        }
    }
    match failure.http_status {
        Some(401) => ErrorClass::TokenExpired,
        _ => by_http_status(failure),
    }
}

/// Fallback for codes outside the tables: server-side trouble and rate
/// limiting retry, everything else is treated as permanent.
fn by_http_status(failure: &ProviderFailure) -> ErrorClass {
    match failure.http_status {
        Some(429) => ErrorClass::Transient,
        Some(status) if status >= 500 => ErrorClass::Transient,
        Some(_) => ErrorClass::Permanent,
        // No HTTP status and no timeout: the request never left the
        // adapter (e.g. missing media) — retrying cannot help.
        None => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(code: i64, status: u16) -> ProviderFailure {
        ProviderFailure::api(Some(code), status, "test")
    }

    #[test]
    fn test_graph_tables() {
        for code in [1, 2, 4, 17, 32, 341] {
            assert_eq!(
                classify(Platform::Facebook, &graph(code, 400)),
                ErrorClass::Transient,
                "code {code}"
            );
        }
        for code in [102, 190] {
            assert_eq!(
                classify(Platform::Facebook, &graph(code, 400)),
                ErrorClass::TokenExpired
            );
        }
        for code in [10, 100, 368, 506, 200, 230, 299] {
            assert_eq!(
                classify(Platform::Instagram, &graph(code, 400)),
                ErrorClass::Permanent,
                "code {code}"
            );
        }
    }

    #[test]
    fn test_graph_unknown_code_falls_back_to_status() {
        assert_eq!(
            classify(Platform::Facebook, &graph(9999, 500)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(Platform::Facebook, &graph(9999, 400)),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_linkedin_statuses() {
        let by_status = |s: u16| ProviderFailure::api(None, s, "test");
        assert_eq!(
            classify(Platform::Linkedin, &by_status(401)),
            ErrorClass::TokenExpired
        );
        assert_eq!(
            classify(Platform::Linkedin, &by_status(429)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(Platform::Linkedin, &by_status(503)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(Platform::Linkedin, &by_status(422)),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(Platform::Linkedin, &by_status(403)),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_twitter_tables() {
        let by_code = |c: i64| ProviderFailure::api(Some(c), 403, "test");
        assert_eq!(classify(Platform::Twitter, &by_code(88)), ErrorClass::Transient);
        assert_eq!(
            classify(Platform::Twitter, &by_code(89)),
            ErrorClass::TokenExpired
        );
        assert_eq!(classify(Platform::Twitter, &by_code(64)), ErrorClass::Permanent);
        assert_eq!(
            classify(Platform::Twitter, &by_code(187)),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(Platform::Twitter, &ProviderFailure::api(None, 429, "limit")),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_timeout_always_transient() {
        for platform in Platform::all() {
            let failure = ProviderFailure {
                code: None,
                http_status: None,
                message: "deadline exceeded".into(),
                timed_out: true,
            };
            assert_eq!(classify(platform, &failure), ErrorClass::Transient);
        }
    }

    #[test]
    fn test_unsendable_request_is_permanent() {
        assert_eq!(
            classify(Platform::Instagram, &ProviderFailure::invalid("no image")),
            ErrorClass::Permanent
        );
    }
}
