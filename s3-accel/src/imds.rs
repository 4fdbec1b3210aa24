//! IMDSv2 (token-authenticated instance metadata) client.
//!
//! Requests are two-part: a PUT obtains a session token, then GETs carry it
//! in `x-aws-ec2-metadata-token`. The token is cached and refreshed a
//! little before its TTL so a request never rides an expired token.

use crate::error::Error;
use crate::http::{ConnectionPool, Endpoint, HttpRequest, TimeoutProfile};
use crate::retry::{RetryPolicy, send_with_retry};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_SECONDS: u64 = 600;
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(60);

static TOKEN_TTL_HEADER: http::header::HeaderName =
    http::header::HeaderName::from_static("x-aws-ec2-metadata-token-ttl-seconds");
static TOKEN_HEADER: http::header::HeaderName =
    http::header::HeaderName::from_static("x-aws-ec2-metadata-token");

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub(crate) struct ImdsClient {
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    timeouts: TimeoutProfile,
    retry: RetryPolicy,
    token: Mutex<Option<CachedToken>>,
}

static SHARED: LazyLock<ImdsClient> = LazyLock::new(ImdsClient::new);

impl ImdsClient {
    pub(crate) fn new() -> Self {
        Self::with_endpoint(Endpoint::http("169.254.169.254", 80))
    }

    /// Point the client somewhere else; used by tests to run the protocol
    /// against a local mock.
    pub(crate) fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            pool: Arc::new(ConnectionPool::default()),
            timeouts: TimeoutProfile::imds(),
            retry: RetryPolicy::imds(),
            token: Mutex::new(None),
        }
    }

    /// The process-wide client used by region and credential discovery.
    pub(crate) fn shared() -> &'static ImdsClient {
        &SHARED
    }

    pub(crate) fn clear(&self) {
        *self.token.lock().expect("imds token cache poisoned") = None;
    }

    fn cached_token(&self) -> Option<String> {
        let token = self.token.lock().expect("imds token cache poisoned");
        token
            .as_ref()
            .filter(|t| t.expires_at.saturating_duration_since(Instant::now()) > TOKEN_REFRESH_BUFFER)
            .map(|t| t.value.clone())
    }

    async fn token(&self, cancel: &CancellationToken) -> Result<String, Error> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_TTL_HEADER.clone(), HeaderValue::from(TOKEN_TTL_SECONDS));
        let request = HttpRequest {
            method: Method::PUT,
            endpoint: self.endpoint.clone(),
            path_and_query: TOKEN_PATH.to_string(),
            headers,
            body: Bytes::new(),
        };
        let response =
            send_with_retry(&request, &self.timeouts, &self.retry, &self.pool, cancel).await?;
        if !response.status.is_success() {
            return Err(Error::UnexpectedResponse {
                status_code: response.status.as_u16(),
                content_type: response.header_str("content-type").map(str::to_string),
                body: response.body,
            });
        }
        let value = utf8_body(&response.body, response.status.as_u16())?;

        debug!("imds session token refreshed");
        let expires_at = Instant::now() + Duration::from_secs(TOKEN_TTL_SECONDS);
        *self.token.lock().expect("imds token cache poisoned") =
            Some(CachedToken { value: value.clone(), expires_at });
        Ok(value)
    }

    /// GET a metadata path and return the body as text.
    pub(crate) async fn get(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let token = self.token(cancel).await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            TOKEN_HEADER.clone(),
            HeaderValue::from_str(&token)
                .map_err(|_| Error::Config("imds token is not a valid header".to_string()))?,
        );
        let request = HttpRequest {
            method: Method::GET,
            endpoint: self.endpoint.clone(),
            path_and_query: path.to_string(),
            headers,
            body: Bytes::new(),
        };
        let response =
            send_with_retry(&request, &self.timeouts, &self.retry, &self.pool, cancel).await?;
        if !response.status.is_success() {
            return Err(Error::UnexpectedResponse {
                status_code: response.status.as_u16(),
                content_type: response.header_str("content-type").map(str::to_string),
                body: response.body,
            });
        }
        utf8_body(&response.body, response.status.as_u16())
    }
}

fn utf8_body(body: &Bytes, status_code: u16) -> Result<String, Error> {
    String::from_utf8(body.to_vec()).map_err(|_| Error::UnexpectedResponse {
        status_code,
        content_type: None,
        body: body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ImdsClient {
        ImdsClient::with_endpoint(Endpoint::parse(&server.uri()).unwrap())
    }

    #[tokio::test]
    async fn test_token_is_fetched_once_and_attached() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .and(header("x-aws-ec2-metadata-token-ttl-seconds", "600"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok-1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/placement/region"))
            .and(header("x-aws-ec2-metadata-token", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("eu-west-1"))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let cancel = CancellationToken::new();
        let first = client.get("/latest/meta-data/placement/region", &cancel).await.unwrap();
        let second = client.get("/latest/meta-data/placement/region", &cancel).await.unwrap();
        assert_eq!(first, "eu-west-1");
        assert_eq!(second, "eu-west-1");
    }

    #[tokio::test]
    async fn test_cleared_cache_refetches_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let cancel = CancellationToken::new();
        client.get("/latest/meta-data/foo", &cancel).await.unwrap();
        client.clear();
        client.get("/latest/meta-data/foo", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_error_statuses_surface() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .get("/latest/meta-data/missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse { status_code: 404, .. }), "got {err:?}");
    }
}
