//! One signed `GetObject`, by byte range or by part number.

use crate::credentials::ProvideCredentials;
use crate::error::Error;
use crate::http::{ConnectionPool, Endpoint, HttpRequest, HttpResponse, TimeoutProfile};
use crate::region::escape_key;
use crate::retry::{RetryPolicy, send_with_retry};
use crate::sign::{EMPTY_PAYLOAD_SHA256, sign};
use bytes::Bytes;
use chrono::Utc;
use http::header::RANGE;
use http::{HeaderMap, HeaderValue, Method};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Strict query-value escaping: only unreserved characters pass.
const QUERY_ESCAPE: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'~').remove(b'-');

/// The object to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    /// Sent as the `versionId` query parameter when present.
    pub version: Option<String>,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), key: key.into(), version: None }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// How one part is addressed on the wire. Exactly one of the two forms is
/// used per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartSpec {
    /// `Range: bytes=start-end`, both bounds inclusive.
    Range { start: u64, end: u64 },
    /// `partNumber=n` query parameter.
    PartNumber(u64),
}

/// Parsed `Content-Range: bytes START-END/TOTAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) total: u64,
}

pub(crate) fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: total.trim().parse().ok()?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct S3ErrorDocument {
    pub(crate) code: String,
    pub(crate) message: String,
}

/// Parse `<Error><Code>…</Code><Message>…</Message>…</Error>`. Anything
/// that is not that exact document shape yields `None`.
pub(crate) fn parse_s3_error(body: &[u8]) -> Option<S3ErrorDocument> {
    let text = std::str::from_utf8(body).ok()?;
    let mut rest = text.trim_start();
    if let Some(declaration_end) = rest.strip_prefix("<?").and_then(|r| r.find("?>")) {
        rest = &rest[declaration_end + 4..];
        rest = rest.trim_start();
    }
    if !rest.starts_with("<Error") {
        return None;
    }
    quick_xml::de::from_str(rest).ok()
}

/// Result of one successful GET.
#[derive(Debug)]
pub(crate) struct GetObjectResponse {
    pub(crate) body: Bytes,
    pub(crate) content_range: Option<ContentRange>,
    /// `x-amz-mp-parts-count`, present on multipart objects in
    /// part-number addressing.
    pub(crate) parts_count: Option<u64>,
    /// The object is empty: a `200` with no body, or a `416` whose error
    /// code is `InvalidRange`.
    pub(crate) zero_length: bool,
}

/// Everything needed to issue part GETs for one object.
pub(crate) struct ObjectClient {
    pub(crate) endpoint: Endpoint,
    pub(crate) region: String,
    pub(crate) object: ObjectRef,
    pub(crate) provider: Arc<dyn ProvideCredentials>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) timeouts: TimeoutProfile,
    pub(crate) retry: RetryPolicy,
}

impl ObjectClient {
    fn path(&self) -> String {
        format!("/{}/{}", self.object.bucket, escape_key(&self.object.key))
    }

    /// Query pairs in canonical (sorted) order; `partNumber` < `versionId`.
    fn canonical_query(&self, part: PartSpec) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::with_capacity(2);
        if let PartSpec::PartNumber(n) = part {
            pairs.push(("partNumber", n.to_string()));
        }
        if let Some(version) = &self.object.version {
            pairs.push(("versionId", version.clone()));
        }
        pairs
            .iter()
            .map(|(name, value)| {
                format!("{name}={}", utf8_percent_encode(value, QUERY_ESCAPE))
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    pub(crate) async fn get(
        &self,
        part: PartSpec,
        cancel: &CancellationToken,
    ) -> Result<GetObjectResponse, Error> {
        let credentials = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            credentials = self.provider.credentials() => credentials?,
        };

        let path = self.path();
        let query = self.canonical_query(part);

        let mut headers = HeaderMap::new();
        if let PartSpec::Range { start, end } = part {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&format!("bytes={start}-{end}"))
                    .expect("unreachable error: range header is always ASCII"),
            );
        }
        sign(
            &Method::GET,
            &self.endpoint.host_header(),
            &path,
            &query,
            &mut headers,
            EMPTY_PAYLOAD_SHA256,
            &credentials,
            &self.region,
            "s3",
            Utc::now(),
        )?;

        let path_and_query =
            if query.is_empty() { path } else { format!("{path}?{query}") };
        let request = HttpRequest {
            method: Method::GET,
            endpoint: self.endpoint.clone(),
            path_and_query,
            headers,
            body: Bytes::new(),
        };

        debug!(part = ?part, path = %request.path_and_query, "getting object part");
        let response =
            send_with_retry(&request, &self.timeouts, &self.retry, &self.pool, cancel).await?;
        interpret(response)
    }
}

/// Map a delivered response onto the GetObject contract.
fn interpret(response: HttpResponse) -> Result<GetObjectResponse, Error> {
    let status_code = response.status.as_u16();
    match status_code {
        206 => {
            let content_range = response
                .header_str("content-range")
                .and_then(parse_content_range);
            let Some(content_range) = content_range else {
                return Err(Error::UnexpectedResponse {
                    status_code,
                    content_type: response.header_str("content-type").map(str::to_string),
                    body: response.body,
                });
            };
            let parts_count = response
                .header_str("x-amz-mp-parts-count")
                .and_then(|v| v.parse().ok());
            Ok(GetObjectResponse {
                body: response.body,
                content_range: Some(content_range),
                parts_count,
                zero_length: false,
            })
        }
        200 if response.body.is_empty() => Ok(GetObjectResponse {
            body: Bytes::new(),
            content_range: None,
            parts_count: None,
            zero_length: true,
        }),
        416 if parse_s3_error(&response.body).is_some_and(|e| e.code == "InvalidRange") => {
            Ok(GetObjectResponse {
                body: Bytes::new(),
                content_range: None,
                parts_count: None,
                zero_length: true,
            })
        }
        _ => Err(classify_failure(response)),
    }
}

fn classify_failure(response: HttpResponse) -> Error {
    let status_code = response.status.as_u16();
    let content_type = response.header_str("content-type").map(str::to_string);
    let is_xml = content_type
        .as_deref()
        .is_some_and(|t| t.starts_with("application/xml") || t.starts_with("text/xml"));
    if is_xml {
        match parse_s3_error(&response.body) {
            Some(document) => Error::S3Protocol {
                code: document.code,
                message: document.message,
                status_code,
                body: response.body,
            },
            None => Error::UnexpectedXml { body: response.body },
        }
    } else {
        Error::UnexpectedResponse { status_code, content_type, body: response.body }
    }
}
