//! Credential resolution.
//!
//! Order: a caller-supplied provider wins; otherwise the environment pair
//! `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` (plus optional
//! `AWS_SESSION_TOKEN`); otherwise the instance-metadata role credentials,
//! cached process-wide and refreshed once they are older than
//! [`CREDENTIAL_MAX_AGE`].

use crate::error::Error;
use crate::imds::ImdsClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A cached instance-metadata credential older than this is refreshed on
/// the next request.
const CREDENTIAL_MAX_AGE: Duration = Duration::from_secs(4 * 60);

const ROLE_LIST_PATH: &str = "/latest/meta-data/iam/security-credentials/";

/// An access key pair with an optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

/// Caller-supplied credential source. Called once per request; the provider
/// owns its own caching.
#[async_trait]
pub trait ProvideCredentials: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, Error>;
}

/// Fixed credentials, never refreshed.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: Credentials,
}

impl StaticProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl ProvideCredentials for StaticProvider {
    async fn credentials(&self) -> Result<Credentials, Error> {
        Ok(self.credentials.clone())
    }
}

/// The environment → instance-metadata fallback chain.
#[derive(Debug, Default)]
pub struct DefaultChainProvider;

#[async_trait]
impl ProvideCredentials for DefaultChainProvider {
    async fn credentials(&self) -> Result<Credentials, Error> {
        if let Some(credentials) = from_env() {
            return Ok(credentials);
        }
        imds_credentials(ImdsClient::shared(), &CancellationToken::new()).await
    }
}

fn from_env() -> Option<Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    if access_key_id.is_empty() || secret_access_key.is_empty() {
        return None;
    }
    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Ok(token) = std::env::var("AWS_SESSION_TOKEN") {
        if !token.is_empty() {
            credentials = credentials.with_session_token(token);
        }
    }
    Some(credentials)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityCredentialsDocument {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

struct CachedCredentials {
    credentials: Credentials,
    cached_at: Instant,
}

static IMDS_CREDENTIALS: LazyLock<Mutex<Option<CachedCredentials>>> =
    LazyLock::new(|| Mutex::new(None));

fn cached_imds_credentials() -> Option<Credentials> {
    let cache = IMDS_CREDENTIALS.lock().expect("credentials cache poisoned");
    cache
        .as_ref()
        .filter(|c| c.cached_at.elapsed() < CREDENTIAL_MAX_AGE)
        .map(|c| c.credentials.clone())
}

pub(crate) async fn imds_credentials(
    client: &ImdsClient,
    cancel: &CancellationToken,
) -> Result<Credentials, Error> {
    if let Some(credentials) = cached_imds_credentials() {
        return Ok(credentials);
    }

    let roles = client.get(ROLE_LIST_PATH, cancel).await?;
    let role = roles.lines().next().map(str::trim).filter(|r| !r.is_empty()).ok_or_else(|| {
        Error::UnexpectedResponse {
            status_code: 200,
            content_type: None,
            body: bytes::Bytes::from(roles.clone()),
        }
    })?;

    let document = client.get(&format!("{ROLE_LIST_PATH}{role}"), cancel).await?;
    let parsed: SecurityCredentialsDocument =
        serde_json::from_str(&document).map_err(|_| Error::UnexpectedResponse {
            status_code: 200,
            content_type: None,
            body: bytes::Bytes::from(document.clone()),
        })?;

    let mut credentials = Credentials::new(parsed.access_key_id, parsed.secret_access_key);
    if let Some(token) = parsed.token {
        credentials = credentials.with_session_token(token);
    }

    debug!(role, "instance credentials refreshed");
    *IMDS_CREDENTIALS.lock().expect("credentials cache poisoned") =
        Some(CachedCredentials { credentials: credentials.clone(), cached_at: Instant::now() });
    Ok(credentials)
}

/// Forget cached instance credentials. Test hook.
pub fn clear_credentials_cache() {
    *IMDS_CREDENTIALS.lock().expect("credentials cache poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Endpoint;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCUMENT: &str = r#"{
        "Code": "Success",
        "Type": "AWS-HMAC",
        "AccessKeyId": "AKIDIMDS",
        "SecretAccessKey": "imds-secret",
        "Token": "imds-token",
        "Expiration": "2030-01-01T00:00:00Z"
    }"#;

    async fn mock_imds(server: &MockServer, expected_document_fetches: u64) {
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(ROLE_LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("worker-role\n"))
            .expect(expected_document_fetches)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/iam/security-credentials/worker-role"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DOCUMENT))
            .expect(expected_document_fetches)
            .mount(server)
            .await;
    }

    // One test covers parse, cache hit, and clear-then-refetch: the cache
    // is process-wide, so splitting these cases would race across tests.
    #[tokio::test]
    async fn test_imds_credentials_parse_cache_and_clear() {
        clear_credentials_cache();
        let server = MockServer::start().await;
        mock_imds(&server, 2).await;
        let client = ImdsClient::with_endpoint(Endpoint::parse(&server.uri()).unwrap());
        let cancel = CancellationToken::new();

        let first = imds_credentials(&client, &cancel).await.unwrap();
        assert_eq!(first.access_key_id, "AKIDIMDS");
        assert_eq!(first.secret_access_key, "imds-secret");
        assert_eq!(first.session_token.as_deref(), Some("imds-token"));

        // Second resolution is served from the process cache.
        let second = imds_credentials(&client, &cancel).await.unwrap();
        assert_eq!(second, first);

        // Clearing forces the next resolution back to the metadata service.
        clear_credentials_cache();
        let third = imds_credentials(&client, &cancel).await.unwrap();
        assert_eq!(third, first);
        clear_credentials_cache();
    }

    #[tokio::test]
    async fn test_static_provider_round_trips() {
        let provider =
            StaticProvider::new(Credentials::new("AKID", "secret").with_session_token("token"));
        let credentials = provider.credentials().await.unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
        assert_eq!(credentials.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_environment_credentials() {
        // SAFETY: test-local mutation of this process's environment; no
        // other test reads these variables.
        unsafe {
            std::env::set_var("AWS_ACCESS_KEY_ID", "AKIDENV");
            std::env::set_var("AWS_SECRET_ACCESS_KEY", "env-secret");
            std::env::set_var("AWS_SESSION_TOKEN", "env-token");
        }
        let credentials = from_env().expect("environment credentials should resolve");
        assert_eq!(credentials.access_key_id, "AKIDENV");
        assert_eq!(credentials.secret_access_key, "env-secret");
        assert_eq!(credentials.session_token.as_deref(), Some("env-token"));

        unsafe {
            std::env::remove_var("AWS_SESSION_TOKEN");
        }
        let credentials = from_env().expect("token is optional");
        assert_eq!(credentials.session_token, None);

        unsafe {
            std::env::remove_var("AWS_ACCESS_KEY_ID");
            std::env::remove_var("AWS_SECRET_ACCESS_KEY");
        }
        assert!(from_env().is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = Credentials::new("AKID", "super-secret").with_session_token("tok");
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok\""));
    }
}
