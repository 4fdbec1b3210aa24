//! Region discovery and path-style endpoint composition.
//!
//! The region comes from `AWS_REGION` when set, otherwise from the
//! instance-identity document, and the first success is cached for the
//! process lifetime. Addressing is uniformly path-style
//! (`s3.{region}.amazonaws.com/{bucket}/{escaped_key}`), which stays
//! compatible with bucket names containing dots.

use crate::error::Error;
use crate::imds::ImdsClient;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::sync::{LazyLock, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";

/// Everything except `A–Z a–z 0–9 _ . ~ - %` is escaped. `%` passes
/// through so pre-encoded keys survive; `*` does not, and becomes `%2A`.
const KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'-')
    .remove(b'%');

static REGION: LazyLock<Mutex<Option<String>>> = LazyLock::new(|| Mutex::new(None));

#[derive(Debug, Deserialize)]
struct InstanceIdentityDocument {
    region: String,
}

fn cached_region() -> Option<String> {
    REGION.lock().expect("region cache poisoned").clone()
}

fn store_region(region: &str) {
    *REGION.lock().expect("region cache poisoned") = Some(region.to_string());
}

/// Resolve the region, consulting the cache, the environment, then the
/// instance-identity document.
pub(crate) async fn region(
    client: &ImdsClient,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    if let Some(region) = cached_region() {
        return Ok(region);
    }

    if let Ok(region) = std::env::var("AWS_REGION") {
        if !region.is_empty() {
            store_region(&region);
            return Ok(region);
        }
    }

    let document = client.get(IDENTITY_DOCUMENT_PATH, cancel).await?;
    let parsed: InstanceIdentityDocument =
        serde_json::from_str(&document).map_err(|_| Error::UnexpectedResponse {
            status_code: 200,
            content_type: None,
            body: bytes::Bytes::from(document.clone()),
        })?;
    debug!(region = %parsed.region, "region discovered from instance metadata");
    store_region(&parsed.region);
    Ok(parsed.region)
}

/// Forget the discovered region. Test hook.
pub fn clear_region_cache() {
    *REGION.lock().expect("region cache poisoned") = None;
}

/// The default path-style hostname for a region.
pub(crate) fn default_hostname(region: &str) -> String {
    format!("s3.{region}.amazonaws.com")
}

/// Escape an object key for use as the URI path (after the bucket
/// segment).
pub(crate) fn escape_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ESCAPE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Endpoint;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_escape_key_keeps_unreserved_and_percent() {
        assert_eq!(escape_key("simple-key_1.txt~"), "simple-key_1.txt~");
        assert_eq!(escape_key("pre%20encoded"), "pre%20encoded");
    }

    #[test]
    fn test_escape_key_escapes_everything_else() {
        assert_eq!(escape_key("a/b c"), "a%2Fb%20c");
        assert_eq!(escape_key("wild*card"), "wild%2Acard");
        assert_eq!(escape_key("plus+and=eq&amp"), "plus%2Band%3Deq%26amp");
        // Multi-byte characters are escaped per UTF-8 byte.
        assert_eq!(escape_key("naïve"), "na%C3%AFve");
    }

    #[test]
    fn test_default_hostname_is_path_style_regional() {
        assert_eq!(default_hostname("eu-west-1"), "s3.eu-west-1.amazonaws.com");
    }

    #[tokio::test]
    async fn test_region_from_identity_document_is_cached() {
        clear_region_cache();
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(IDENTITY_DOCUMENT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"region": "ap-southeast-2", "instanceId": "i-0abc"}"#,
            ))
            .mount(&server)
            .await;

        let client = ImdsClient::with_endpoint(Endpoint::parse(&server.uri()).unwrap());
        let cancel = CancellationToken::new();
        // The environment may define AWS_REGION on developer machines; this
        // test only asserts the cached path once a region is known.
        let first = region(&client, &cancel).await.unwrap();
        let second = region(&client, &cancel).await.unwrap();
        assert_eq!(first, second);
        clear_region_cache();
    }
}
