//! Shared plumbing for calls to managed services
//!
//! Every client in this crate turns a non-success HTTP response into
//! [`AppError::Upstream`] through [`check_response`], and wraps idempotent
//! calls in [`with_retry`]. Calls that create something retry only through
//! [`with_retry_if`] with [`was_not_processed`].

use crate::errors::{AppError, Result, Upstream};
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Response, StatusCode, Url};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Longest vendor body kept in an error message
const MAX_MESSAGE_LEN: usize = 500;

/// Build a reqwest client with the given timeout
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("condoportal/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// `base` followed by `segments`, each percent-encoded as one path segment.
/// Caller-supplied ids go through here so they cannot climb out of the
/// resource they name; empty and dot segments are refused.
pub fn segment_url<I, S>(base: &str, segments: I) -> Result<Url>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut url = Url::parse(base).map_err(|e| AppError::Configuration {
        message: format!("Invalid base URL {}: {}", base, e),
    })?;
    {
        let mut path = url.path_segments_mut().map_err(|_| AppError::Configuration {
            message: format!("Base URL {} cannot take a path", base),
        })?;
        path.pop_if_empty();
        for segment in segments {
            let segment = segment.as_ref();
            if matches!(segment, "" | "." | "..") {
                return Err(AppError::invalid_field("id", format!("invalid id {:?}", segment)));
            }
            path.push(segment);
        }
    }
    Ok(url)
}

/// Pass successful responses through, convert the rest into upstream errors
pub async fn check_response(service: Upstream, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = vendor_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    });

    tracing::error!(
        service = %service,
        status = status.as_u16(),
        error = %message,
        "Upstream request failed"
    );
    crate::metrics::record_upstream_error(&service.to_string());

    Err(AppError::upstream(service, Some(status.as_u16()), message))
}

/// [`check_response`] for calls made with the caller's ID token, where a
/// 403 means security rules refused that user
pub async fn check_caller_response(service: Upstream, response: Response) -> Result<Response> {
    if response.status() != StatusCode::FORBIDDEN {
        return check_response(service, response).await;
    }

    let body = response.text().await.unwrap_or_default();
    let message = vendor_message(&body).unwrap_or_else(|| "Permission denied".to_string());
    warn!(service = %service, error = %message, "Caller denied by upstream rules");
    Err(AppError::Forbidden { message })
}

/// Pull a human-readable message out of a vendor error body
///
/// Understands `{"error": {"message": ..}}` (Google APIs),
/// `{"message": ..}` (Dify) and `{"error": ".."}` (token endpoints).
pub fn vendor_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let candidate = json
            .pointer("/error/message")
            .or_else(|| json.get("message"))
            .or_else(|| json.get("error_description"))
            .or_else(|| json.get("error"))
            .and_then(|v| v.as_str());
        if let Some(message) = candidate {
            return Some(truncate(message));
        }
    }

    Some(truncate(trimmed))
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_MESSAGE_LEN).collect();
    out.push('…');
    out
}

/// Whether an error is worth another attempt
pub fn is_transient(err: &AppError) -> bool {
    match err {
        AppError::Upstream {
            status: Some(status),
            ..
        } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                || *status >= 500
        }
        AppError::HttpClient(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

/// Whether the service certainly did not act on the request: it was never
/// delivered, or it was turned away with 429. Timeouts and 5xx may follow
/// a committed write.
pub fn was_not_processed(err: &AppError) -> bool {
    match err {
        AppError::Upstream {
            status: Some(status),
            ..
        } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16(),
        AppError::HttpClient(e) => e.is_connect(),
        _ => false,
    }
}

/// Run an operation with exponential backoff on transient failures
pub async fn with_retry<T, F, Fut>(service: Upstream, budget: Duration, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(service, budget, is_transient, operation).await
}

/// [`with_retry`] with a custom test for which errors are retried
pub async fn with_retry_if<T, F, Fut>(
    service: Upstream,
    budget: Duration,
    retryable: fn(&AppError) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(budget),
        ..ExponentialBackoff::default()
    };

    retry(policy, || {
        let attempt = operation();
        async move {
            attempt.await.map_err(|err| {
                if retryable(&err) {
                    warn!(service = %service, error = %err, "Transient upstream failure, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_google_error_body() {
        let body = r#"{"error": {"code": 400, "message": "INVALID_PASSWORD", "status": "INVALID_ARGUMENT"}}"#;
        assert_eq!(vendor_message(body).as_deref(), Some("INVALID_PASSWORD"));
    }

    #[test]
    fn test_dify_error_body() {
        let body = r#"{"code": "dataset_not_initialized", "message": "The dataset is still being initialized.", "status": 400}"#;
        assert_eq!(
            vendor_message(body).as_deref(),
            Some("The dataset is still being initialized.")
        );
    }

    #[test]
    fn test_plain_text_body() {
        assert_eq!(vendor_message("Bad Gateway").as_deref(), Some("Bad Gateway"));
        assert_eq!(vendor_message("   "), None);
    }

    #[test]
    fn test_long_body_is_truncated() {
        let message = vendor_message(&"x".repeat(2000)).unwrap();
        assert_eq!(message.chars().count(), MAX_MESSAGE_LEN + 1);
    }

    #[test]
    fn test_segment_url_keeps_ids_in_place() {
        let url = segment_url("https://api.dify.ai/v1/", ["datasets", "ds-1", "documents", "../../ds-2/documents/d"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.dify.ai/v1/datasets/ds-1/documents/..%2F..%2Fds-2%2Fdocuments%2Fd"
        );

        let url = segment_url("https://api.dify.ai/v1", ["documents", "%2e%2e"]).unwrap();
        assert_eq!(url.path(), "/v1/documents/%252e%252e");

        assert!(segment_url("https://api.dify.ai/v1", ["documents", ".."]).is_err());
        assert!(segment_url("https://api.dify.ai/v1", ["documents", ""]).is_err());
        assert!(segment_url("not a url", ["x"]).is_err());
    }

    #[tokio::test]
    async fn test_caller_denied_is_forbidden() {
        let denied = axum::http::Response::builder()
            .status(403)
            .body(r#"{"error": {"code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED"}}"#)
            .unwrap();
        let err = check_caller_response(Upstream::Firebase, Response::from(denied))
            .await
            .unwrap_err();
        assert!(matches!(&err, AppError::Forbidden { message } if message == "Missing or insufficient permissions."));
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);

        let broken = axum::http::Response::builder().status(500).body("boom").unwrap();
        let err = check_caller_response(Upstream::Firebase, Response::from(broken))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);

        let ok = axum::http::Response::builder().status(200).body("{}").unwrap();
        assert!(check_caller_response(Upstream::Firebase, Response::from(ok)).await.is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&AppError::upstream(Upstream::Dify, Some(503), "busy")));
        assert!(is_transient(&AppError::upstream(Upstream::Dify, Some(429), "slow down")));
        assert!(!is_transient(&AppError::upstream(Upstream::Dify, Some(404), "missing")));
        assert!(!is_transient(&AppError::invalid_field("query", "empty")));
    }

    #[test]
    fn test_not_processed_classification() {
        assert!(was_not_processed(&AppError::upstream(Upstream::Dify, Some(429), "slow down")));
        assert!(!was_not_processed(&AppError::upstream(Upstream::Dify, Some(503), "busy")));
        assert!(!was_not_processed(&AppError::upstream(Upstream::Dify, Some(504), "timeout")));
        assert!(!was_not_processed(&AppError::invalid_field("text", "empty")));
    }

    #[tokio::test]
    async fn test_create_is_not_resent_after_server_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry_if(Upstream::Dify, Duration::from_secs(5), was_not_processed, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::upstream(Upstream::Dify, Some(502), "gateway")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_is_resent_after_rate_limit() {
        let calls = AtomicU32::new(0);
        let result = with_retry_if(Upstream::Dify, Duration::from_secs(5), was_not_processed, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(AppError::upstream(Upstream::Dify, Some(429), "slow down"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(Upstream::Dify, Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::upstream(Upstream::Dify, Some(400), "bad request")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(Upstream::Dify, Duration::from_secs(5), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(AppError::upstream(Upstream::Dify, Some(502), "gateway"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
