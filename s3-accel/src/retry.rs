//! Bounded retry around the request executor.
//!
//! Retried failures: the fixed network classes, all six timeout kinds, and
//! HTTP 429/5xx. The backoff for attempt `k` (counted from 2) is
//! `uniform(0, 2^(k-1))` seconds clamped to `max_delay`; the exponent is
//! allowed to grow without bound because the clamp already prevents
//! pathological delays. The wait is interruptible: cancellation during
//! backoff completes the call with `Cancelled` immediately.

use crate::error::{Error, is_retriable_status};
use crate::http::{ConnectionPool, HttpRequest, HttpResponse, TimeoutProfile, execute};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Attempt budget and backoff clamp for one logical request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: usize,
    pub(crate) max_delay: Duration,
}

impl RetryPolicy {
    /// S3 data-path default: 5 attempts, 20 s clamp.
    pub(crate) const S3_ATTEMPTS: usize = 5;
    /// Instance-metadata default: 3 attempts.
    pub(crate) const IMDS_ATTEMPTS: usize = 3;
    pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(20);

    pub(crate) fn imds() -> Self {
        Self { max_attempts: Self::IMDS_ATTEMPTS, max_delay: Self::DEFAULT_MAX_DELAY }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: Self::S3_ATTEMPTS, max_delay: Self::DEFAULT_MAX_DELAY }
    }
}

fn backoff_delay(attempt: usize, max_delay: Duration) -> Duration {
    // Next attempt is k = attempt + 1, so the window is 2^attempt seconds.
    let window = (1u64 << attempt.min(32)) as f64;
    let sampled = rand::rng().random_range(0.0..window);
    Duration::from_secs_f64(sampled.min(max_delay.as_secs_f64()))
}

async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Issue `req` until it yields a non-retriable outcome or the attempt
/// budget runs out.
///
/// A delivered 429/5xx consumes attempts like a failure; once the budget is
/// exhausted the final response is returned as-is so the caller keeps the
/// status code and raw body.
pub(crate) async fn send_with_retry(
    req: &HttpRequest,
    timeouts: &TimeoutProfile,
    policy: &RetryPolicy,
    pool: &ConnectionPool,
    cancel: &CancellationToken,
) -> Result<HttpResponse, Error> {
    let mut attempt = 1usize;
    loop {
        let outcome = execute(req, timeouts, pool, cancel).await;
        let last_attempt = attempt >= policy.max_attempts;
        match outcome {
            Ok(response) if is_retriable_status(response.status.as_u16()) && !last_attempt => {
                warn!(
                    status = response.status.as_u16(),
                    attempt,
                    path = %req.path_and_query,
                    "retriable status, backing off"
                );
            }
            Ok(response) => return Ok(response),
            Err(err) if err.is_retriable() && !last_attempt => {
                warn!(%err, attempt, path = %req.path_and_query, "retriable failure, backing off");
            }
            Err(err) => return Err(err),
        }
        let delay = backoff_delay(attempt, policy.max_delay);
        wait_or_cancel(delay, cancel).await?;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Endpoint;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_window_grows_and_clamps() {
        let clamp = Duration::from_millis(50);
        for attempt in 1..=8 {
            let delay = backoff_delay(attempt, clamp);
            assert!(delay <= clamp, "attempt {attempt} exceeded the clamp: {delay:?}");
        }
        // Unclamped, the window for the first retry is two seconds.
        for _ in 0..32 {
            let delay = backoff_delay(1, Duration::from_secs(60));
            assert!(delay < Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let started = tokio::time::Instant::now();
        let err = wait_or_cancel(Duration::from_secs(30), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    async fn serve_statuses(listener: TcpListener, statuses: Vec<u16>, hits: Arc<AtomicUsize>) {
        for status in statuses {
            let (mut sock, _) = listener.accept().await.unwrap();
            hits.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            let reason = if status == 200 { "OK" } else { "Server Error" };
            let body = if status == 200 { "done" } else { "nope" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
        }
    }

    fn request_for(endpoint: Endpoint) -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            endpoint,
            path_and_query: "/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn tight_profile() -> TimeoutProfile {
        TimeoutProfile {
            resolve: None,
            connection: Some(Duration::from_secs(1)),
            write: Some(Duration::from_secs(1)),
            read: Some(Duration::from_secs(1)),
            data: Some(Duration::from_secs(1)),
            request: Some(Duration::from_secs(2)),
        }
    }

    #[tokio::test]
    async fn test_retries_5xx_until_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_statuses(listener, vec![500, 503, 200], hits.clone()));

        let policy = RetryPolicy { max_attempts: 5, max_delay: Duration::from_millis(5) };
        let response = send_with_retry(
            &request_for(Endpoint::http("127.0.0.1", port)),
            &tight_profile(),
            &policy,
            &ConnectionPool::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(&response.body[..], b"done");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_final_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_statuses(listener, vec![500, 500, 500], hits.clone()));

        let policy = RetryPolicy { max_attempts: 3, max_delay: Duration::from_millis(5) };
        let response = send_with_retry(
            &request_for(Endpoint::http("127.0.0.1", port)),
            &tight_profile(),
            &policy,
            &ConnectionPool::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status.as_u16(), 500);
        assert_eq!(&response.body[..], b"nope");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_status_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_statuses(listener, vec![404], hits.clone()));

        let policy = RetryPolicy::default();
        let response = send_with_retry(
            &request_for(Endpoint::http("127.0.0.1", port)),
            &tight_profile(),
            &policy,
            &ConnectionPool::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status.as_u16(), 404);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
